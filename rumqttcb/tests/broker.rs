#![allow(dead_code)]

use bytes::BytesMut;
use rumqttcb::mqttbytes::v4::*;
use rumqttcb::mqttbytes::{Error, MAX_REMAINING_LENGTH};
use rumqttcb::ConnectReturnCode;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Time a read waits before reporting that nothing came
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Starts a broker thread on a random port. `script` accepts connections
/// from the listener and plays its side of the conversation
pub fn start<F, T>(script: F) -> (u16, JoinHandle<T>)
where
    F: FnOnce(TcpListener) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || script(listener));
    (port, handle)
}

/// One connection of a scripted broker
pub struct Broker {
    stream: TcpStream,
    buffer: BytesMut,
    /// Connect packet the client opened the connection with
    pub connect: Connect,
}

impl Broker {
    /// Accepts the next connection and reads its CONNECT. No connack is sent
    pub fn accept(listener: &TcpListener) -> Broker {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();

        let mut broker = Broker {
            stream,
            buffer: BytesMut::new(),
            connect: Connect::new(""),
        };

        match broker.read() {
            Some(Packet::Connect(connect)) => broker.connect = connect,
            packet => panic!("Expecting connect packet. Received = {:?}", packet),
        }

        broker
    }

    /// Accepts the next connection and accepts its session
    pub fn accept_and_connack(listener: &TcpListener) -> Broker {
        let mut broker = Broker::accept(listener);
        broker.connack(ConnectReturnCode::Success);
        broker
    }

    pub fn connack(&mut self, code: ConnectReturnCode) {
        self.write(Packet::ConnAck(ConnAck::new(code, false)));
    }

    /// Reads the next packet. `None` when the client closed the connection
    /// or nothing came in time
    pub fn read(&mut self) -> Option<Packet> {
        loop {
            match Packet::read(&mut self.buffer, MAX_REMAINING_LENGTH) {
                Ok(packet) => return Some(packet),
                Err(Error::InsufficientBytes(_)) => {}
                Err(e) => panic!("Invalid packet from client = {:?}", e),
            }

            let mut chunk = [0u8; 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == ErrorKind::TimedOut => return None,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return None,
                Err(e) => panic!("Read error = {:?}", e),
            }
        }
    }

    /// Reads the next packet other than a ping. Pings are answered
    pub fn read_skip_pings(&mut self) -> Option<Packet> {
        loop {
            match self.read()? {
                Packet::PingReq => self.write(Packet::PingResp),
                packet => return Some(packet),
            }
        }
    }

    pub fn read_publish(&mut self) -> Publish {
        match self.read_skip_pings() {
            Some(Packet::Publish(publish)) => publish,
            packet => panic!("Expecting a publish. Received = {:?}", packet),
        }
    }

    pub fn write(&mut self, packet: Packet) {
        let mut buffer = BytesMut::new();
        packet.write(&mut buffer).unwrap();
        self.stream.write_all(&buffer).unwrap();
    }

    /// Waits for the client to close the connection. Packets that come
    /// before that are returned
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = self.read() {
            packets.push(packet);
        }

        packets
    }
}
