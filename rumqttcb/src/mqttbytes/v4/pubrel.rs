use super::*;
use bytes::{Buf, Bytes};

/// Release of a QoS2 publish, sent in response to PUBREC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

impl PubRel {
    pub fn new(pkid: u16) -> PubRel {
        PubRel { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        let variable_header_index = fixed_header.fixed_header_len;
        bytes.advance(variable_header_index);
        let pkid = read_u16(&mut bytes)?;

        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        Ok(PubRel { pkid })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = 2;
        buffer.put_u8(0x62);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);
        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    #[test]
    fn pubrel_encoding_sets_reserved_flags() {
        let mut buf = BytesMut::new();
        PubRel::new(0x0102).write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x62, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn ack_family_round_trip_through_packet() {
        let acks = vec![
            Packet::PubAck(PubAck::new(1)),
            Packet::PubRec(PubRec::new(2)),
            Packet::PubRel(PubRel::new(3)),
            Packet::PubComp(PubComp::new(4)),
            Packet::UnsubAck(UnsubAck::new(5)),
        ];

        let mut buf = BytesMut::new();
        for ack in acks.iter() {
            ack.write(&mut buf).unwrap();
        }

        for ack in acks {
            assert_eq!(Packet::read(&mut buf, 10).unwrap(), ack);
        }
    }
}
