use super::*;

mod codec;
mod connack;
mod connect;
mod disconnect;
mod ping;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub use codec::*;
pub use connack::*;
pub use connect::*;
pub use disconnect::*;
pub use ping::*;
pub use puback::*;
pub use pubcomp::*;
pub use publish::*;
pub use pubrec::*;
pub use pubrel::*;
pub use suback::*;
pub use subscribe::*;
pub use unsuback::*;
pub use unsubscribe::*;

/// Protocol level of mqtt 3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;

/// Encapsulates all MQTT packet types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Reads the next packet out of the stream. Returns
    /// `Error::InsufficientBytes` and leaves the stream untouched when
    /// the frame isn't complete yet
    pub fn read(stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
        let fixed_header = check(stream.iter(), max_size)?;

        let packet = stream.split_to(fixed_header.frame_length());
        let packet_type = fixed_header.packet_type()?;

        if fixed_header.remaining_len == 0 {
            // no payload packets
            return match packet_type {
                PacketType::PingReq => Ok(Packet::PingReq),
                PacketType::PingResp => Ok(Packet::PingResp),
                PacketType::Disconnect => Ok(Packet::Disconnect),
                _ => Err(Error::PayloadRequired),
            };
        }

        let packet = packet.freeze();
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(fixed_header, packet)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(fixed_header, packet)?),
            PacketType::Publish => Packet::Publish(Publish::read(fixed_header, packet)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(fixed_header, packet)?),
            PacketType::PubRec => Packet::PubRec(PubRec::read(fixed_header, packet)?),
            PacketType::PubRel => Packet::PubRel(PubRel::read(fixed_header, packet)?),
            PacketType::PubComp => Packet::PubComp(PubComp::read(fixed_header, packet)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(fixed_header, packet)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(fixed_header, packet)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(fixed_header, packet)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(fixed_header, packet)?),
            PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
                return Err(Error::IncorrectPacketFormat)
            }
        };

        Ok(packet)
    }

    /// Serializes the packet into `buffer` and returns the number of bytes
    /// written. Nothing is guaranteed about the contents of `buffer` on error
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        match self {
            Packet::Connect(connect) => connect.write(buffer),
            Packet::ConnAck(connack) => connack.write(buffer),
            Packet::Publish(publish) => publish.write(buffer),
            Packet::PubAck(puback) => puback.write(buffer),
            Packet::PubRec(pubrec) => pubrec.write(buffer),
            Packet::PubRel(pubrel) => pubrel.write(buffer),
            Packet::PubComp(pubcomp) => pubcomp.write(buffer),
            Packet::Subscribe(subscribe) => subscribe.write(buffer),
            Packet::SubAck(suback) => suback.write(buffer),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buffer),
            Packet::UnsubAck(unsuback) => unsuback.write(buffer),
            Packet::PingReq => PingReq.write(buffer),
            Packet::PingResp => PingResp.write(buffer),
            Packet::Disconnect => Disconnect.write(buffer),
        }
    }

    /// Name used in log lines, e.g. "sending PUBLISH"
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packets_are_read_one_frame_at_a_time() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&[
            0xD0, 0x00, // pingresp
            0x40, 0x02, 0x00, 0x0A, // puback, pkid = 10
            0x30, 0x05, 0x00, 0x01, b't', // incomplete publish
        ]);

        assert_eq!(Packet::read(&mut stream, 100).unwrap(), Packet::PingResp);
        assert_eq!(
            Packet::read(&mut stream, 100).unwrap(),
            Packet::PubAck(PubAck::new(10))
        );

        let o = Packet::read(&mut stream, 100);
        assert!(matches!(o, Err(Error::InsufficientBytes(2))));
        assert_eq!(stream.len(), 5);

        stream.extend_from_slice(&[b'x', b'y']);
        let publish = match Packet::read(&mut stream, 100).unwrap() {
            Packet::Publish(publish) => publish,
            packet => panic!("Expected publish, received {packet:?}"),
        };

        assert_eq!(publish.topic, "t");
        assert_eq!(&publish.payload[..], b"xy");
        assert!(stream.is_empty());
    }

    #[test]
    fn unknown_packet_type_is_an_error() {
        let mut stream = BytesMut::from(&[0xF0, 0x00][..]);
        let o = Packet::read(&mut stream, 100);
        assert!(matches!(o, Err(Error::InvalidPacketType(15))));
    }

    #[test]
    fn payloadless_ack_is_an_error() {
        let mut stream = BytesMut::from(&[0x40, 0x00][..]);
        let o = Packet::read(&mut stream, 100);
        assert!(matches!(o, Err(Error::PayloadRequired)));
    }
}
