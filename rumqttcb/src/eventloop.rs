use crate::dispatch::{Dispatcher, LogLevel, Notification};
use crate::framed::Network;
use crate::mqttbytes::v4::*;
use crate::state::{ConnectionStatus, MqttState, Request, StateError};
use crate::{lock, MqttOptions};

use flume::{bounded, unbounded, Receiver, Sender};
use futures_util::FutureExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{self, error::Elapsed};

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Value of [`EventLoop::socket`] while there is no socket
const NO_SOCKET: i64 = -1;

/// Critical errors during eventloop polling
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Mqtt state: {0}")]
    MqttState(#[from] StateError),
    #[error("Timeout")]
    Timeout(#[from] Elapsed),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Connection refused, return code: `{0:?}`")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Expected ConnAck packet, received: {0:?}")]
    NotConnAck(Box<Packet>),
    #[error("Connection closed by peer abruptly")]
    ConnectionClosed,
    #[error("No connection to the broker")]
    NoConnection,
}

/// Outcome of one pass over the network
enum Flow {
    Continue,
    /// DISCONNECT went out, the socket should be closed
    Close,
}

/// What ended the wait of an iteration
enum Wake {
    Incoming,
    Request(Request),
    Idle,
}

/// Eventloop with all the state of a connection. Shared between the client
/// facade and the thread driving the loop. Only one iteration runs at a
/// time, the socket lock serializes iterations and connection handshakes
pub struct EventLoop {
    /// Options of the current mqtt connection
    options: Mutex<MqttOptions>,
    /// Current state of the connection
    state: Mutex<MqttState>,
    /// Network connection to the broker
    network: AsyncMutex<Option<Network>>,
    /// Requests handle to send requests
    requests_tx: Sender<Request>,
    /// Request stream
    requests_rx: Receiver<Request>,
    /// Handle to send cancellation requests
    cancel_tx: Sender<()>,
    /// Handle to read cancellation requests
    cancel_rx: Receiver<()>,
    /// Wakes an idle loop and interrupts a waiting one
    wakeup: Notify,
    /// Raw descriptor of the current socket
    socket: AtomicI64,
    /// Held while notifications are being delivered
    delivering: Mutex<()>,
    /// Runtime the network futures run on
    runtime: Handle,
    pub dispatcher: Dispatcher,
}

impl EventLoop {
    /// New MQTT `EventLoop`
    pub fn new(options: MqttOptions, runtime: Handle) -> EventLoop {
        let (requests_tx, requests_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded(1);
        let max_inflight = options.inflight();

        EventLoop {
            options: Mutex::new(options),
            state: Mutex::new(MqttState::new(max_inflight)),
            network: AsyncMutex::new(None),
            requests_tx,
            requests_rx,
            cancel_tx,
            cancel_rx,
            wakeup: Notify::new(),
            socket: AtomicI64::new(NO_SOCKET),
            delivering: Mutex::new(()),
            runtime,
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn options(&self) -> MutexGuard<'_, MqttOptions> {
        lock(&self.options)
    }

    pub fn state(&self) -> MutexGuard<'_, MqttState> {
        lock(&self.state)
    }

    /// Runs a network future to completion on the process runtime. Must not
    /// be called from inside the runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Hands a request to the loop
    pub fn request(&self, request: Request) {
        // the receiver lives as long as self
        if let Err(e) = self.requests_tx.send(request) {
            error!("Failed to queue request: {:?}", e.into_inner());
        }
    }

    /// Descriptor of the socket, if there is one
    pub fn socket(&self) -> Option<i64> {
        match self.socket.load(Ordering::SeqCst) {
            NO_SOCKET => None,
            fd => Some(fd),
        }
    }

    /// Wakes up a waiting iteration and makes the next one return early
    pub fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    /// Forgets cancel requests that nobody consumed
    pub fn clear_cancel(&self) {
        self.cancel_rx.drain().for_each(drop);
    }

    /// Asks the loop to open the connection in its next iteration
    pub fn connect_async(&self) {
        self.state().connect_pending = true;
        self.wakeup.notify_one();
    }

    /// Outbound bytes or requests are waiting to be written
    pub fn want_write(&self) -> bool {
        if !self.requests_rx.is_empty() {
            return true;
        }

        match self.network.try_lock() {
            Ok(network) => network.as_ref().map_or(false, Network::wants_write),
            Err(_) => false,
        }
    }

    /// Delivers queued notifications to the handlers on the calling thread,
    /// in the order they were produced. Returns right away when another
    /// thread (or a handler up the stack) is already delivering, that
    /// delivery picks up the new notifications
    pub fn dispatch_events(&self) {
        let _delivering = match self.delivering.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };

        loop {
            let events: Vec<Notification> = self.state().events.drain(..).collect();
            if events.is_empty() {
                break;
            }

            for event in events.iter() {
                self.dispatcher.deliver(event);
            }
        }
    }

    /// One iteration of the loop for callers outside the runtime. Delivers
    /// pending notifications, polls the network and delivers what the poll
    /// produced
    pub fn iterate(&self, timeout: Duration, max_packets: usize) -> Result<(), ConnectionError> {
        self.dispatch_events();
        let o = self.block_on(self.poll(timeout, max_packets));
        self.dispatch_events();
        o
    }

    /// Waits for a connect request, a cancel or the timeout. Used by the
    /// loop thread while there is no connection
    pub async fn idle(&self, timeout: Duration) {
        select! {
            _ = self.wakeup.notified() => {},
            _ = self.cancel_rx.recv_async() => {},
            _ = time::sleep(timeout) => {},
        }
    }

    /// Closes the current connection (if any) and connects to the broker.
    /// Returns once the broker accepted or refused the connection
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        // a waiting iteration holds the socket lock. No permit is stored,
        // the next iteration waits as usual
        self.wakeup.notify_waiters();
        let mut network = self.network.lock().await;
        self.state().connect_pending = false;
        self.close_previous(&mut network).await;

        match self.open(true).await {
            Ok(n) => *network = Some(n),
            Err(e) => {
                self.closed(false);
                self.log_error("connect failed", &e);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Drops the connection without a DISCONNECT
    pub async fn close(&self) {
        let mut network = self.network.lock().await;
        if let Some(mut n) = network.take() {
            if let Err(e) = n.shutdown().await {
                debug!("Error while closing socket = {:?}", e);
            }

            self.closed(false);
        }
    }

    /// Drops the connection and all session state and installs new options
    pub async fn reset(&self, options: MqttOptions) {
        let mut network = self.network.lock().await;
        network.take();
        self.socket.store(NO_SOCKET, Ordering::SeqCst);
        self.requests_rx.drain().for_each(drop);
        self.state().reset();
        *self.options() = options;
    }

    /// Yields after at most `timeout`, or earlier if keep alive or retries
    /// need attention, after handling everything that happened in between.
    /// Opens the connection first if `connect_async` asked for one
    pub async fn poll(&self, timeout: Duration, max_packets: usize) -> Result<(), ConnectionError> {
        let mut network = self.network.lock().await;

        let connect_pending = std::mem::take(&mut self.state().connect_pending);
        if connect_pending {
            // the wakeup of `connect_async` is consumed here when no idle
            // loop took it
            let _ = self.wakeup.notified().now_or_never();
            self.close_previous(&mut network).await;
            match self.open(false).await {
                Ok(n) => *network = Some(n),
                Err(e) => {
                    self.closed(false);
                    self.log_error("connect failed", &e);
                    return Err(e);
                }
            }
        }

        let o = match network.as_mut() {
            Some(n) => self.select(n, timeout, max_packets.max(1)).await,
            None => return Err(ConnectionError::NoConnection),
        };

        self.settle(&mut network, o).await
    }

    /// Reads what is available right now and handles it
    pub async fn poll_read(&self, max_packets: usize) -> Result<(), ConnectionError> {
        let mut network = self.network.lock().await;
        let n = match network.as_mut() {
            Some(n) => n,
            None => return Err(ConnectionError::NoConnection),
        };

        let mut incoming = VecDeque::new();
        let read = time::timeout(Duration::ZERO, n.readb(&mut incoming, max_packets.max(1))).await;
        let o = match read {
            Ok(Ok(())) => self.handle_incoming(n, &mut incoming).map(|_| Flow::Continue),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Flow::Continue),
        };

        self.settle(&mut network, o).await
    }

    /// Writes queued requests and buffered packets
    pub async fn poll_write(&self) -> Result<(), ConnectionError> {
        let mut network = self.network.lock().await;
        let n = match network.as_mut() {
            Some(n) => n,
            None => return Err(ConnectionError::NoConnection),
        };

        let o = async {
            let flow = self.write_requests(n)?;
            n.flush().await?;
            Ok::<_, ConnectionError>(flow)
        }
        .await;

        self.settle(&mut network, o).await
    }

    /// Time based housekeeping. Packets it produces are written by the next
    /// `poll_write`
    pub async fn poll_misc(&self) -> Result<(), ConnectionError> {
        let mut network = self.network.lock().await;
        let n = match network.as_mut() {
            Some(n) => n,
            None => return Err(ConnectionError::NoConnection),
        };

        let o = self.misc(n).map(|_| Flow::Continue);
        self.settle(&mut network, o).await
    }

    /// Select on network and requests and generate keepalive pings when necessary
    async fn select(
        &self,
        network: &mut Network,
        timeout: Duration,
        max_packets: usize,
    ) -> Result<Flow, ConnectionError> {
        // requests which came in since the last iteration go out first
        if let Flow::Close = self.write_requests(network)? {
            network.flush().await?;
            return Ok(Flow::Close);
        }

        network.flush().await?;

        let wait = self.state().next_timeout(Instant::now(), timeout);
        let mut incoming = VecDeque::new();

        let wake = select! {
            biased;
            _ = self.cancel_rx.recv_async() => Wake::Idle,
            _ = self.wakeup.notified() => Wake::Idle,
            // Pull a bunch of packets from network, reply in bunch
            o = network.readb(&mut incoming, max_packets) => {
                o?;
                Wake::Incoming
            },
            // Pull next request from user requests channel
            request = self.requests_rx.recv_async() => match request {
                Ok(request) => Wake::Request(request),
                Err(_) => Wake::Idle,
            },
            _ = time::sleep(wait) => Wake::Idle,
        };

        let mut flow = Flow::Continue;
        match wake {
            Wake::Incoming => self.handle_incoming(network, &mut incoming)?,
            Wake::Request(request) => {
                let mut state = self.state();
                flow = self.write_request(network, &mut state, request)?;
            }
            Wake::Idle => {}
        }

        if let Flow::Continue = flow {
            flow = self.write_requests(network)?;
        }

        if let Flow::Continue = flow {
            self.misc(network)?;
        }

        network.flush().await?;
        Ok(flow)
    }

    /// Applies incoming packets to the state and buffers the replies
    fn handle_incoming(
        &self,
        network: &mut Network,
        incoming: &mut VecDeque<Packet>,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state();
        for packet in incoming.drain(..) {
            let line = format!("Client {} received {}", state.client_id(), packet.name());
            state.log(LogLevel::Debug, line);

            match state.handle_incoming_packet(packet, Instant::now()) {
                Ok(Some(reply)) => self.write(network, &mut state, reply)?,
                Ok(None) => {}
                Err(StateError::ConnectionRefused(code)) => {
                    return Err(ConnectionError::ConnectionRefused(code))
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Buffers requests that are already queued
    fn write_requests(&self, network: &mut Network) -> Result<Flow, ConnectionError> {
        let mut state = self.state();
        for request in self.requests_rx.drain() {
            if let Flow::Close = self.write_request(network, &mut state, request)? {
                return Ok(Flow::Close);
            }
        }

        Ok(Flow::Continue)
    }

    fn write_request(
        &self,
        network: &mut Network,
        state: &mut MqttState,
        request: Request,
    ) -> Result<Flow, ConnectionError> {
        let packet = match state.handle_outgoing_packet(request, Instant::now()) {
            Some(packet) => packet,
            None => return Ok(Flow::Continue),
        };

        let flow = match packet {
            Packet::Disconnect => Flow::Close,
            _ => Flow::Continue,
        };

        self.write(network, state, packet)?;
        Ok(flow)
    }

    /// Keep alive, retransmissions and the connack timeout
    fn misc(&self, network: &mut Network) -> Result<(), ConnectionError> {
        let mut state = self.state();
        for packet in state.misc(Instant::now())? {
            self.write(network, &mut state, packet)?;
        }

        Ok(())
    }

    fn write(
        &self,
        network: &mut Network,
        state: &mut MqttState,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        network.feed(&packet)?;
        state.on_outgoing(&packet, Instant::now());

        let line = format!("Client {} sending {}", state.client_id(), packet.name());
        state.log(LogLevel::Debug, line);
        Ok(())
    }

    /// Tears the connection down when a poll failed or sent DISCONNECT
    async fn settle(
        &self,
        network: &mut Option<Network>,
        o: Result<Flow, ConnectionError>,
    ) -> Result<(), ConnectionError> {
        match o {
            Ok(Flow::Continue) => Ok(()),
            Ok(Flow::Close) => {
                if let Some(mut n) = network.take() {
                    if let Err(e) = n.shutdown().await {
                        debug!("Error while closing socket = {:?}", e);
                    }
                }

                self.closed(false);
                Ok(())
            }
            Err(e) => {
                network.take();
                self.closed(true);
                self.log_error("connection error", &e);
                Err(e)
            }
        }
    }

    /// Connection replaced by a new connect. A queued DISCONNECT still
    /// reaches the broker
    async fn close_previous(&self, network: &mut Option<Network>) {
        let mut previous = match network.take() {
            Some(n) => n,
            None => return,
        };

        if let Err(e) = self.write_requests(&mut previous) {
            debug!("Dropping queued requests = {:?}", e);
        }

        if let Err(e) = previous.shutdown().await {
            debug!("Error while closing socket = {:?}", e);
        }

        self.closed(false);
    }

    fn closed(&self, unexpected: bool) {
        self.socket.store(NO_SOCKET, Ordering::SeqCst);
        // qos 0 publishes don't survive the connection
        self.requests_rx.drain().for_each(drop);
        self.state().socket_closed(unexpected);
    }

    fn log_error(&self, context: &str, e: &ConnectionError) {
        let mut state = self.state();
        let line = format!("Client {} {}: {}", state.client_id(), context, e);
        state.log(LogLevel::Error, line);
    }

    /// Opens the socket and sends CONNECT. Waits for the connack when
    /// `wait_connack` is set, otherwise it is handled by the next polls
    async fn open(&self, wait_connack: bool) -> Result<Network, ConnectionError> {
        let options = self.options().clone();
        let (host, port) = options.broker_address();
        let timeout = options.connection_timeout();

        self.state().begin_connect(&options, Instant::now());

        let connect = socket_connect(&host, port, options.bind_address());
        let stream = time::timeout(timeout, connect).await??;
        let fd = raw_socket(&stream);

        let mut network = Network::new(stream, options.max_packet_size(), timeout);
        let packet = Packet::Connect(options.connect_packet());
        self.write(&mut network, &mut self.state(), packet)?;
        network.flush().await?;
        self.socket.store(fd, Ordering::SeqCst);

        if !wait_connack {
            return Ok(network);
        }

        let packet = time::timeout(timeout, network.read()).await??;
        let mut state = self.state();
        let line = format!("Client {} received {}", state.client_id(), packet.name());
        state.log(LogLevel::Debug, line);

        match packet {
            Packet::ConnAck(connack) => {
                match state.handle_incoming_packet(Packet::ConnAck(connack), Instant::now()) {
                    Ok(_) => Ok(network),
                    Err(StateError::ConnectionRefused(code)) => {
                        Err(ConnectionError::ConnectionRefused(code))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            packet => Err(ConnectionError::NotConnAck(Box::new(packet))),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }
}

/// Resolves the broker and connects to the first address that accepts the
/// connection, optionally from a local address
pub(crate) async fn socket_connect(
    host: &str,
    port: u16,
    bind_address: Option<SocketAddr>,
) -> io::Result<TcpStream> {
    let addrs = lookup_host((host, port)).await?;
    let mut last_err = None;

    for addr in addrs {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if let Some(bind_address) = bind_address {
            if bind_address.is_ipv4() != addr.is_ipv4() {
                continue;
            }

            socket.bind(bind_address)?;
        }

        match socket.connect(addr).await {
            Ok(s) => {
                s.set_nodelay(true)?;
                return Ok(s);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    }))
}

#[cfg(unix)]
fn raw_socket(stream: &TcpStream) -> i64 {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd() as i64
}

#[cfg(windows)]
fn raw_socket(stream: &TcpStream) -> i64 {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as i64
}

#[cfg(not(any(unix, windows)))]
fn raw_socket(_stream: &TcpStream) -> i64 {
    0
}
