use super::*;

/// Graceful close, sent by the client before closing the socket. The
/// broker discards the will of a client that disconnects this way
pub struct Disconnect;

impl Disconnect {
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_slice(&[0xE0, 0x00]);
        Ok(2)
    }
}
