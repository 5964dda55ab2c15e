use super::*;
use bytes::{Buf, Bytes};

/// Connection packet initiated by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Mqtt keep alive time
    pub keep_alive: u16,
    /// Client Id
    pub client_id: String,
    /// Clean session. Asks the broker to clear previous state
    pub clean_session: bool,
    /// Will that broker needs to publish when the client disconnects
    pub last_will: Option<LastWill>,
    /// Login credentials
    pub login: Option<Login>,
}

impl Connect {
    pub fn new<S: Into<String>>(id: S) -> Connect {
        Connect {
            keep_alive: 10,
            client_id: id.into(),
            clean_session: true,
            last_will: None,
            login: None,
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + "MQTT".len() // protocol name
                              + 1            // protocol version
                              + 1            // connect flags
                              + 2; // keep alive

        len += 2 + self.client_id.len();

        if let Some(last_will) = &self.last_will {
            len += last_will.len();
        }

        if let Some(login) = &self.login {
            len += login.len();
        }

        len
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
        let variable_header_index = fixed_header.fixed_header_len;
        bytes.advance(variable_header_index);

        // Variable header
        let protocol_name = read_mqtt_string(&mut bytes)?;
        let protocol_level = read_u8(&mut bytes)?;
        if protocol_name != "MQTT" {
            return Err(Error::InvalidProtocol);
        }

        if protocol_level != PROTOCOL_LEVEL {
            return Err(Error::InvalidProtocolLevel(protocol_level));
        }

        let connect_flags = read_u8(&mut bytes)?;
        let clean_session = (connect_flags & 0b10) != 0;
        let keep_alive = read_u16(&mut bytes)?;

        let client_id = read_mqtt_string(&mut bytes)?;
        let last_will = LastWill::read(connect_flags, &mut bytes)?;
        let login = Login::read(connect_flags, &mut bytes)?;

        let connect = Connect {
            keep_alive,
            client_id,
            clean_session,
            last_will,
            login,
        };

        Ok(connect)
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0b0001_0000);
        let count = write_remaining_length(buffer, len)?;
        write_mqtt_string(buffer, "MQTT")?;
        buffer.put_u8(PROTOCOL_LEVEL);

        let flags_index = buffer.len();

        let mut connect_flags = 0;
        if self.clean_session {
            connect_flags |= 0x02;
        }

        buffer.put_u8(connect_flags);
        buffer.put_u16(self.keep_alive);
        write_mqtt_string(buffer, &self.client_id)?;

        if let Some(last_will) = &self.last_will {
            connect_flags |= last_will.write(buffer)?;
        }

        if let Some(login) = &self.login {
            connect_flags |= login.write(buffer)?;
        }

        // update connect flags
        buffer[flags_index] = connect_flags;
        Ok(1 + count + len)
    }
}

/// LastWill that broker forwards on behalf of the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> LastWill {
        LastWill {
            topic: topic.into(),
            message: Bytes::from(payload.into()),
            qos,
            retain,
        }
    }

    fn len(&self) -> usize {
        2 + self.topic.len() + 2 + self.message.len()
    }

    fn read(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<LastWill>, Error> {
        let last_will = match connect_flags & 0b100 {
            // will qos and retain without a will
            0 if (connect_flags & 0b0011_1000) != 0 => {
                return Err(Error::IncorrectPacketFormat);
            }
            0 => None,
            _ => {
                let topic = read_mqtt_string(bytes)?;
                let message = read_mqtt_bytes(bytes)?;
                let qos = qos((connect_flags & 0b11000) >> 3)?;
                Some(LastWill {
                    topic,
                    message,
                    qos,
                    retain: (connect_flags & 0b0010_0000) != 0,
                })
            }
        };

        Ok(last_will)
    }

    fn write(&self, buffer: &mut BytesMut) -> Result<u8, Error> {
        let mut connect_flags = 0x04 | (self.qos as u8) << 3;
        if self.retain {
            connect_flags |= 0x20;
        }

        write_mqtt_string(buffer, &self.topic)?;
        write_mqtt_bytes(buffer, &self.message)?;
        Ok(connect_flags)
    }
}

/// Username and optional password. Mqtt 3.1.1 doesn't allow a password
/// without a username
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: Option<String>,
}

impl Login {
    pub fn new<U: Into<String>>(username: U, password: Option<String>) -> Login {
        Login {
            username: username.into(),
            password,
        }
    }

    fn read(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<Login>, Error> {
        let username = match connect_flags & 0b1000_0000 {
            0 => None,
            _ => Some(read_mqtt_string(bytes)?),
        };

        let password = match connect_flags & 0b0100_0000 {
            0 => None,
            _ => Some(read_mqtt_string(bytes)?),
        };

        match (username, password) {
            (Some(username), password) => Ok(Some(Login { username, password })),
            (None, None) => Ok(None),
            (None, Some(_)) => Err(Error::IncorrectPacketFormat),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.username.len();
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }

        len
    }

    fn write(&self, buffer: &mut BytesMut) -> Result<u8, Error> {
        let mut connect_flags = 0x80;
        write_mqtt_string(buffer, &self.username)?;

        if let Some(password) = &self.password {
            connect_flags |= 0x40;
            write_mqtt_string(buffer, password)?;
        }

        Ok(connect_flags)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    fn sample_bytes() -> Vec<u8> {
        vec![
            0x10,
            39, // packet type, flags and remaining len
            0x00,
            0x04,
            b'M',
            b'Q',
            b'T',
            b'T',
            0x04,        // variable header
            0b1100_1110, // +username, +password, -will retain, will qos=1, +last_will, +clean_session
            0x00,
            0x0a, // variable header. keep alive = 10 sec
            0x00,
            0x04,
            b't',
            b'e',
            b's',
            b't', // payload. client_id
            0x00,
            0x02,
            b'/',
            b'a', // payload. will topic = '/a'
            0x00,
            0x07,
            b'o',
            b'f',
            b'f',
            b'l',
            b'i',
            b'n',
            b'e', // payload. will msg = 'offline'
            0x00,
            0x04,
            b'r',
            b'u',
            b's',
            b't', // payload. username = 'rust'
            0x00,
            0x02,
            b'm',
            b'q', // payload. password = 'mq'
        ]
    }

    fn sample_connect() -> Connect {
        Connect {
            keep_alive: 10,
            client_id: "test".to_owned(),
            clean_session: true,
            last_will: Some(LastWill::new("/a", "offline", QoS::AtLeastOnce, false)),
            login: Some(Login::new("rust", Some("mq".to_owned()))),
        }
    }

    #[test]
    fn connect_parsing_works() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&sample_bytes());
        stream.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // extra packets in the stream

        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let connect_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = Connect::read(fixed_header, connect_bytes).unwrap();

        assert_eq!(packet, sample_connect());
        assert_eq!(&stream[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn connect_encoding_works() {
        let mut buf = BytesMut::new();
        let written = sample_connect().write(&mut buf).unwrap();

        assert_eq!(buf, sample_bytes());
        assert_eq!(written, buf.len());
    }

    #[test]
    fn username_without_password_is_encoded() {
        let mut connect = Connect::new("c");
        connect.keep_alive = 0;
        connect.login = Some(Login::new("u", None));

        let mut buf = BytesMut::new();
        connect.write(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x10, 16, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0b1000_0010, 0x00, 0x00,
                0x00, 0x01, b'c', 0x00, 0x01, b'u'
            ]
        );
    }

    #[test]
    fn oversized_will_payload_fails_to_encode() {
        let mut connect = Connect::new("c");
        connect.last_will = Some(LastWill::new("w", vec![0; 65536], QoS::AtMostOnce, false));

        let mut buf = BytesMut::new();
        assert!(matches!(connect.write(&mut buf), Err(Error::PayloadTooLong)));
    }
}
