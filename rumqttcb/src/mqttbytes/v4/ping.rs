use super::*;

/// Keep alive request
pub struct PingReq;

impl PingReq {
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_slice(&[0xC0, 0x00]);
        Ok(2)
    }
}

/// Keep alive response
pub struct PingResp;

impl PingResp {
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_slice(&[0xD0, 0x00]);
        Ok(2)
    }
}
