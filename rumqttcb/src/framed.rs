use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::eventloop::ConnectionError;
use crate::mqttbytes::v4::{Codec, Packet};
use crate::mqttbytes::Error;
use crate::state::StateError;

use std::collections::VecDeque;
use std::time::Duration;

/// Network transforms packets <-> frames efficiently. It takes
/// advantage of pre-allocation, buffering and vectorization when
/// appropriate to achieve performance
pub struct Network {
    /// Frame MQTT packets from network connection
    framed: Framed<Box<dyn AsyncReadWrite>, Codec>,
    /// Maximum incoming packet size
    max_incoming_size: usize,
    /// Time within which a flush should complete
    timeout: Duration,
}

impl Network {
    pub fn new(
        socket: impl AsyncReadWrite + 'static,
        max_incoming_size: usize,
        timeout: Duration,
    ) -> Network {
        let socket = Box::new(socket) as Box<dyn AsyncReadWrite>;
        let codec = Codec { max_incoming_size };
        let framed = Framed::new(socket, codec);

        Network {
            framed,
            max_incoming_size,
            timeout,
        }
    }

    /// Reads and returns a single packet from network
    pub async fn read(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(error(e)),
            None => Err(ConnectionError::ConnectionClosed),
        }
    }

    /// Read packets in bulk. This allow replies to be in bulk. This method is used
    /// after the connection is established to read a bunch of incoming packets.
    /// Waits for at least one packet, then takes what is already buffered up to
    /// `max` packets. The rest stays in the read buffer for the next call
    pub async fn readb(
        &mut self,
        incoming: &mut VecDeque<Packet>,
        max: usize,
    ) -> Result<(), ConnectionError> {
        let packet = self.read().await?;
        incoming.push_back(packet);

        while incoming.len() < max {
            let buffer = self.framed.read_buffer_mut();
            match Packet::read(buffer, self.max_incoming_size) {
                Ok(packet) => incoming.push_back(packet),
                Err(Error::InsufficientBytes(_)) => break,
                Err(e) => return Err(error(e)),
            }
        }

        Ok(())
    }

    /// Serializes packet into write buffer. Nothing is written to the buffer
    /// when serialization fails
    pub fn feed(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let buffer = self.framed.write_buffer_mut();
        let len = buffer.len();
        if let Err(e) = packet.write(buffer) {
            buffer.truncate(len);
            return Err(error(e));
        }

        Ok(())
    }

    /// Writes all the buffered packets to the network
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        let flush = SinkExt::<Packet>::flush(&mut self.framed);
        timeout(self.timeout, flush).await?.map_err(error)
    }

    pub fn wants_write(&self) -> bool {
        !self.framed.write_buffer().is_empty()
    }

    /// Flushes what is buffered and closes the write half
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.flush().await?;
        timeout(self.timeout, self.framed.get_mut().shutdown()).await??;
        Ok(())
    }
}

fn error(e: Error) -> ConnectionError {
    match e {
        Error::Io(e) => ConnectionError::Io(e),
        e => ConnectionError::MqttState(StateError::Deserialization(e)),
    }
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mqttbytes::v4::{PubAck, PubRec};
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn buffered_packets_are_read_in_bulk() {
        let (client, mut broker) = duplex(1024);
        let mut network = Network::new(client, 1024, Duration::from_secs(1));

        broker
            .write_all(&[0x40, 0x02, 0x00, 0x01, 0x50, 0x02, 0x00, 0x02, 0xD0, 0x00])
            .await
            .unwrap();

        let mut incoming = VecDeque::new();
        network.readb(&mut incoming, 2).await.unwrap();
        assert_eq!(
            incoming.drain(..).collect::<Vec<_>>(),
            vec![
                Packet::PubAck(PubAck::new(1)),
                Packet::PubRec(PubRec::new(2))
            ]
        );

        // third packet waits for the next read
        network.readb(&mut incoming, 2).await.unwrap();
        assert_eq!(incoming.pop_front(), Some(Packet::PingResp));
        assert!(incoming.is_empty());
    }

    #[tokio::test]
    async fn closed_socket_is_reported() {
        let (client, broker) = duplex(1024);
        let mut network = Network::new(client, 1024, Duration::from_secs(1));
        drop(broker);

        let o = network.read().await;
        assert!(matches!(o, Err(ConnectionError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn fed_packets_are_written_on_flush() {
        let (client, mut broker) = duplex(1024);
        let mut network = Network::new(client, 1024, Duration::from_secs(1));

        network.feed(&Packet::PingReq).unwrap();
        network.feed(&Packet::PubAck(PubAck::new(10))).unwrap();
        assert!(network.wants_write());

        network.flush().await.unwrap();
        assert!(!network.wants_write());

        let mut buf = [0u8; 6];
        broker.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00, 0x40, 0x02, 0x00, 0x0A]);
    }

    #[tokio::test]
    async fn unserializable_packet_leaves_buffer_untouched() {
        let (client, _broker) = duplex(1024);
        let mut network = Network::new(client, 1024, Duration::from_secs(1));

        let subscribe = crate::mqttbytes::v4::Subscribe::new("a", crate::QoS::AtMostOnce);
        let o = network.feed(&Packet::Subscribe(subscribe));
        assert!(matches!(
            o,
            Err(ConnectionError::MqttState(StateError::Deserialization(
                Error::PacketIdZero
            )))
        ));
        assert!(!network.wants_write());
    }
}
