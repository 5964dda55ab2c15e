use super::*;
use bytes::{Buf, Bytes};

/// Unsubscribe packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    pub fn new<S: Into<String>>(topic: S) -> Unsubscribe {
        Unsubscribe {
            pkid: 0,
            topics: vec![topic.into()],
        }
    }

    fn len(&self) -> usize {
        // len of pkid + vec![topic len]
        2 + self.topics.iter().fold(0, |s, topic| s + topic.len() + 2)
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        let variable_header_index = fixed_header.fixed_header_len;
        bytes.advance(variable_header_index);

        let pkid = read_u16(&mut bytes)?;
        let mut topics = Vec::new();
        while bytes.has_remaining() {
            topics.push(read_mqtt_string(&mut bytes)?);
        }

        if topics.is_empty() {
            return Err(Error::EmptySubscription);
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let remaining_len = self.len();
        buffer.put_u8(0xA2);
        let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;
        buffer.put_u16(self.pkid);

        for topic in self.topics.iter() {
            write_mqtt_string(buffer, topic.as_str())?;
        }

        Ok(1 + remaining_len_bytes + remaining_len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    #[test]
    fn unsubscribe_encoding_works() {
        let mut unsubscribe = Unsubscribe::new("a/#");
        unsubscribe.pkid = 3;

        let mut buf = BytesMut::new();
        unsubscribe.write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xA2, 7, 0x00, 0x03, 0x00, 0x03, b'a', b'/', b'#']);

        let packet = Packet::read(&mut buf, 100).unwrap();
        assert_eq!(packet, Packet::Unsubscribe(unsubscribe));
    }
}
