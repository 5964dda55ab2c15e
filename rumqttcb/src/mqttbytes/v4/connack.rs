use super::*;
use bytes::{Buf, Bytes};

/// Return code in connack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Success = 0,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadUserNamePassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    /// Human readable reason, as brokers describe it
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectReturnCode::Success => "connection accepted",
            ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::BadClientId => "identifier rejected",
            ConnectReturnCode::ServiceUnavailable => "broker unavailable",
            ConnectReturnCode::BadUserNamePassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        }
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = Error;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        let code = match num {
            0 => ConnectReturnCode::Success,
            1 => ConnectReturnCode::RefusedProtocolVersion,
            2 => ConnectReturnCode::BadClientId,
            3 => ConnectReturnCode::ServiceUnavailable,
            4 => ConnectReturnCode::BadUserNamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            num => return Err(Error::InvalidConnectReturnCode(num)),
        };

        Ok(code)
    }
}

/// Acknowledgement to connect packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> ConnAck {
        ConnAck {
            code,
            session_present,
        }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        let variable_header_index = fixed_header.fixed_header_len;
        bytes.advance(variable_header_index);

        let flags = read_u8(&mut bytes)?;
        let return_code = read_u8(&mut bytes)?;

        let session_present = (flags & 0x01) == 1;
        let code = ConnectReturnCode::try_from(return_code)?;
        Ok(ConnAck::new(code, session_present))
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        // session present + code
        let len = 2;
        buffer.put_u8(0x20);

        let count = write_remaining_length(buffer, len)?;
        buffer.put_u8(self.session_present as u8);
        buffer.put_u8(self.code as u8);

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    #[test]
    fn connack_parsing_works() {
        let mut stream = bytes::BytesMut::new();
        let packetstream = &[
            0b0010_0000,
            0x02, // packet type, flags and remaining len
            0x01,
            0x00, // variable header. connack flags, connect return code
            0xDE,
            0xAD,
            0xBE,
            0xEF, // extra packets in the stream
        ];

        stream.extend_from_slice(&packetstream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let connack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let connack = ConnAck::read(fixed_header, connack_bytes).unwrap();

        assert_eq!(connack, ConnAck::new(ConnectReturnCode::Success, true));
    }

    #[test]
    fn refusal_codes_are_parsed() {
        let mut stream = BytesMut::from(&[0x20, 0x02, 0x00, 0x05][..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let connack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let connack = ConnAck::read(fixed_header, connack_bytes).unwrap();

        assert_eq!(connack.code, ConnectReturnCode::NotAuthorized);
        assert!(!connack.session_present);
    }

    #[test]
    fn unknown_return_code_is_an_error() {
        let mut stream = BytesMut::from(&[0x20, 0x02, 0x00, 0x06][..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let connack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let o = ConnAck::read(fixed_header, connack_bytes);

        assert!(matches!(o, Err(Error::InvalidConnectReturnCode(6))));
    }

    #[test]
    fn connack_encoding_works() {
        let connack = ConnAck::new(ConnectReturnCode::BadUserNamePassword, false);

        let mut buf = BytesMut::new();
        connack.write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x20, 0x02, 0x00, 0x04]);
    }
}
