//! Mqtt 3.1.1 wire format
//!
//! Packets are framed with [`check`] and read/written by the types in [`v4`].
//! Everything here works on `bytes` buffers so that a partially received
//! packet stays in the read buffer until the rest of it arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::slice::Iter;

mod topic;
pub mod v4;

pub use topic::*;

/// Largest value the variable length remaining length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Error during serialization and deserialization
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expected Connect, received: {0:?}")]
    NotConnect(PacketType),
    #[error("Invalid Connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid QoS level: {0}")]
    InvalidQoS(u8),
    #[error("Invalid subscribe reason code: {0}")]
    InvalidSubscribeReasonCode(u8),
    #[error("Packet id Zero")]
    PacketIdZero,
    #[error("Empty Subscription")]
    EmptySubscription,
    #[error("Payload is too long")]
    PayloadTooLong,
    #[error("Max Payload size of {max:?} has been exceeded by packet of {pkt_size:?} bytes")]
    PayloadSizeLimitExceeded { pkt_size: usize, max: usize },
    #[error("Payload is required")]
    PayloadRequired,
    #[error("Topic is not UTF-8")]
    TopicNotUtf8,
    #[error("Promised boundary crossed: {0}")]
    BoundaryCrossed(usize),
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    /// More bytes required to frame packet. Argument
    /// implies minimum additional bytes required to
    /// proceed further
    #[error("At least {0} more bytes required to frame packet")]
    InsufficientBytes(usize),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// MQTT packet type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Quality of service
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Packet type from a byte
///
/// ```ignore
///          7                          3                          0
///          +--------------------------+--------------------------+
/// byte 1   | MQTT Control Packet Type | Flags for each type      |
///          +--------------------------+--------------------------+
///          |         Remaining Bytes Len  (1/2/3/4 bytes)        |
///          +-----------------------------------------------------+
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc385349207>
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct FixedHeader {
    /// First byte of the stream. Used to identify packet types and
    /// several flags
    pub byte1: u8,
    /// Byte 1 + (1..4) bytes of remaining length
    pub fixed_header_len: usize,
    /// Variable header + payload size
    pub remaining_len: usize,
}

impl FixedHeader {
    pub fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Size of the full frame. Fixed header is enough to know this
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

/// Checks if the stream has enough bytes to frame a packet and returns the
/// fixed header only when a full frame is available. The parent stream's
/// cursor isn't moved, so a failed check can be retried after more bytes
/// have been read
pub fn check(stream: Iter<u8>, max_packet_size: usize) -> Result<FixedHeader, Error> {
    let stream_len = stream.len();
    let fixed_header = parse_fixed_header(stream)?;

    // Reject huge packets before buffering them
    if fixed_header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded {
            pkt_size: fixed_header.remaining_len,
            max: max_packet_size,
        });
    }

    let frame_length = fixed_header.frame_length();
    if stream_len < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream_len));
    }

    Ok(fixed_header)
}

/// Parses fixed header
pub(crate) fn parse_fixed_header(mut stream: Iter<u8>) -> Result<FixedHeader, Error> {
    // At least 2 bytes are necessary to frame a packet
    let stream_len = stream.len();
    let byte1 = match stream.next() {
        Some(byte1) if stream_len >= 2 => *byte1,
        _ => return Err(Error::InsufficientBytes(2 - stream_len)),
    };

    let (len_len, len) = length(stream)?;
    Ok(FixedHeader::new(byte1, len_len, len))
}

/// Parses the variable byte integer at the start of the stream. Returns the
/// number of bytes it occupies and its value
fn length(stream: Iter<u8>) -> Result<(usize, usize), Error> {
    let mut len: usize = 0;
    let mut len_len = 0;
    let mut done = false;
    let mut shift = 0;

    // 0b1xxx_xxxx 0b1yyy_yyyy 0b1zzz_zzzz 0b0www_wwww is framed as
    // 0bwww_wwww_zzz_zzzz_yyy_yyyy_xxx_xxxx
    for byte in stream {
        len_len += 1;
        let byte = *byte as usize;
        len += (byte & 0x7F) << shift;

        done = (byte & 0x80) == 0;
        if done {
            break;
        }

        shift += 7;

        // more than 4 shifts (0, 7, 14, 21) implies bad length
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

/// Reads a series of bytes with a length from a byte stream
fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;

    // Length prefix lying about the amount of data left in the frame
    if len > stream.len() {
        return Err(Error::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

/// Reads a string from bytes stream
fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_mqtt_bytes(stream)?;
    String::from_utf8(s.to_vec()).map_err(|_| Error::TopicNotUtf8)
}

/// Serializes bytes to stream (including length). Fails instead of
/// truncating when the data can't be described by a 16 bit prefix
fn write_mqtt_bytes(stream: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(bytes.len()).map_err(|_| Error::PayloadTooLong)?;
    stream.put_u16(len);
    stream.extend_from_slice(bytes);
    Ok(())
}

/// Serializes a string to stream
fn write_mqtt_string(stream: &mut BytesMut, string: &str) -> Result<(), Error> {
    write_mqtt_bytes(stream, string.as_bytes())
}

/// Writes remaining length to stream and returns number of bytes for remaining length
fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadTooLong);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        qos => Err(Error::InvalidQoS(qos)),
    }
}

/// A frame can be complete and still lie about its contents, e.g. a
/// remaining length that ends before the packet id. These checks keep
/// `bytes` from panicking on such frames
fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn remaining_length_boundaries_are_encoded() {
        let cases: [(usize, &[u8]); 8] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (16_384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xFF, 0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];

        for (len, expected) in cases {
            let mut stream = BytesMut::new();
            let count = write_remaining_length(&mut stream, len).unwrap();
            assert_eq!(&stream[..], expected);
            assert_eq!(count, expected.len());

            let (len_len, parsed) = length(stream.iter()).unwrap();
            assert_eq!(len_len, expected.len());
            assert_eq!(parsed, len);
        }
    }

    #[test]
    fn remaining_length_above_max_fails() {
        let mut stream = BytesMut::new();
        let o = write_remaining_length(&mut stream, MAX_REMAINING_LENGTH + 1);
        assert!(matches!(o, Err(Error::PayloadTooLong)));
        assert!(stream.is_empty());
    }

    #[test]
    fn five_length_bytes_are_malformed() {
        let stream = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let o = parse_fixed_header(stream.iter());
        assert!(matches!(o, Err(Error::MalformedRemainingLength)));
    }

    #[test]
    fn partial_header_asks_for_more_bytes() {
        let o = parse_fixed_header([0x30].iter());
        assert!(matches!(o, Err(Error::InsufficientBytes(1))));

        // continuation bit set on the last available length byte
        let o = parse_fixed_header([0x30, 0x80].iter());
        assert!(matches!(o, Err(Error::InsufficientBytes(1))));

        // header is complete but the body isn't
        let o = check([0x30, 0x05, 0x00].iter(), 100);
        assert!(matches!(o, Err(Error::InsufficientBytes(4))));
    }

    #[test]
    fn oversized_incoming_packet_is_rejected_early() {
        let o = check([0x30, 0x80, 0x01].iter(), 100);
        assert!(matches!(
            o,
            Err(Error::PayloadSizeLimitExceeded {
                pkt_size: 128,
                max: 100
            })
        ));
    }

    #[test]
    fn long_mqtt_strings_are_not_truncated() {
        let mut stream = BytesMut::new();
        let data = vec![b'a'; 65536];
        assert!(matches!(
            write_mqtt_bytes(&mut stream, &data),
            Err(Error::PayloadTooLong)
        ));

        write_mqtt_bytes(&mut stream, &data[..65535]).unwrap();
        assert_eq!(&stream[..2], &[0xFF, 0xFF]);
    }
}
