//! This module offers a callback driven synchronous abstraction over the
//! async eventloop
use crate::dispatch::{EventKind, LogAdapter, LogLevel, Message, Notification};
use crate::eventloop::{ConnectionError, EventLoop};
use crate::mqttbytes::v4::*;
use crate::mqttbytes::{valid_filter, valid_topic, QoS, MAX_REMAINING_LENGTH};
use crate::state::{ConnectionStatus, Request, StateError};
use crate::{lock, runtime, MqttOptions};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wait of one iteration of the loop thread
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Packets handled per iteration of the loop thread
const LOOP_MAX_PACKETS: usize = 10;

/// Client Error
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid broker host `{0}`")]
    InvalidHost(String),
    #[error("Invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("Invalid topic filter `{0}`")]
    InvalidFilter(String),
    #[error("Payload of {0} bytes doesn't fit in a packet")]
    PayloadTooLarge(usize),
    #[error("Password requires a username")]
    PasswordWithoutUsername,
    #[error("Invalid client id")]
    InvalidClientId,
    #[error("Not connected")]
    NotConnected,
    #[error("Client never connected, nothing to reconnect to")]
    NeverConnected,
    #[error("Network loop is already running")]
    LoopRunning,
    #[error("Library isn't initialised, call `rumqttcb::init()` first")]
    NotInitialized,
    #[error("Connection: {0}")]
    Connection(#[from] ConnectionError),
}

impl From<StateError> for ClientError {
    fn from(e: StateError) -> ClientError {
        match e {
            StateError::InvalidState(_) => ClientError::NotConnected,
            e => ClientError::Connection(ConnectionError::MqttState(e)),
        }
    }
}

/// Mqtt client. Operations queue their packets for the network loop, which
/// is driven either by the caller (`loop_once`, `loop_forever`) or by a
/// thread (`loop_start`). Everything that comes back from the broker is
/// delivered to the registered handlers.
///
/// Client is cloneable, clones share the connection
#[derive(Clone)]
pub struct Client {
    inner: Arc<Shared>,
}

struct Shared {
    eventloop: Arc<EventLoop>,
    /// Loop thread started by `loop_start`
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Asks the loop thread and `loop_forever` to return
    stop: Arc<AtomicBool>,
    /// A caller driven loop call is in progress
    manual: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.eventloop.cancel();

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            join(handle);
        }
    }
}

impl Client {
    /// Creates a client with the given id, or a random one with a clean
    /// session when `client_id` is `None`
    ///
    /// ```no_run
    /// rumqttcb::init().unwrap();
    /// let client = rumqttcb::Client::new(Some("sensor-1")).unwrap();
    /// ```
    pub fn new(client_id: Option<&str>) -> Result<Client, ClientError> {
        let options = MqttOptions::new(client_id_or_random(client_id)?, "localhost", 1883);
        Client::with_options(options)
    }

    /// Creates a client with prepared options. Broker address and keep alive
    /// are replaced by the `connect*` calls
    pub fn with_options(options: MqttOptions) -> Result<Client, ClientError> {
        if !valid_client_id(&options.client_id()) {
            return Err(ClientError::InvalidClientId);
        }

        let runtime = runtime::handle().ok_or(ClientError::NotInitialized)?;
        let eventloop = EventLoop::new(options, runtime);

        let inner = Shared {
            eventloop: Arc::new(eventloop),
            thread: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            manual: AtomicBool::new(false),
        };

        Ok(Client {
            inner: Arc::new(inner),
        })
    }

    /// Drops the connection, the session, the handlers, the will and the
    /// credentials. The client starts over as if it was just created
    pub fn reinitialise(&self, client_id: Option<&str>) -> Result<(), ClientError> {
        if self.loop_running() {
            return Err(ClientError::LoopRunning);
        }

        let options = MqttOptions::new(client_id_or_random(client_id)?, "localhost", 1883);
        let eventloop = &self.inner.eventloop;
        eventloop.block_on(eventloop.reset(options));
        eventloop.dispatcher.clear();
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.inner.eventloop.options().client_id()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.eventloop.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Descriptor of the socket. `None` while there is no connection
    pub fn socket(&self) -> Option<i64> {
        self.inner.eventloop.socket()
    }

    /// Sets the will for the next connection. The broker publishes it when
    /// the connection drops without a DISCONNECT
    pub fn will_set<S, V>(&self, topic: S, payload: V, qos: QoS, retain: bool) -> Result<(), ClientError>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if !valid_topic(&topic) {
            return Err(ClientError::InvalidTopic(topic));
        }

        let payload = payload.into();
        if payload.len() > MAX_REMAINING_LENGTH {
            return Err(ClientError::PayloadTooLarge(payload.len()));
        }

        let will = LastWill::new(topic, payload, qos, retain);
        self.inner.eventloop.options().set_last_will(will);
        Ok(())
    }

    pub fn will_clear(&self) {
        self.inner.eventloop.options().clear_last_will();
    }

    /// Credentials for the next connection. `auth(None, None)` removes them
    pub fn auth(&self, username: Option<&str>, password: Option<&str>) -> Result<(), ClientError> {
        let mut options = self.inner.eventloop.options();
        match (username, password) {
            (Some(username), password) => {
                options.set_credentials(username, password.map(str::to_owned));
            }
            (None, Some(_)) => return Err(ClientError::PasswordWithoutUsername),
            (None, None) => {
                options.clear_credentials();
            }
        }

        Ok(())
    }

    /// Maximum number of qos 1/2 publishes waiting for acks. Publishes
    /// beyond it are queued. 0 is unlimited
    pub fn set_max_inflight_messages(&self, inflight: u16) {
        let eventloop = &self.inner.eventloop;
        eventloop.options().set_inflight(inflight);
        eventloop.state().set_max_inflight(inflight);
    }

    /// Time after which unacknowledged publishes are sent again
    pub fn set_message_retry(&self, retry: Duration) {
        let eventloop = &self.inner.eventloop;
        eventloop.options().set_message_retry(retry);
        eventloop.state().set_message_retry(retry);
    }

    /// Connects to the broker and waits for its connack
    pub fn connect(&self, host: &str, port: u16, keep_alive: Duration) -> Result<(), ClientError> {
        self.connect_bind(host, port, keep_alive, None)
    }

    /// Same as [`Client::connect`] but binds the socket to a local address first
    pub fn connect_bind(
        &self,
        host: &str,
        port: u16,
        keep_alive: Duration,
        bind_address: Option<SocketAddr>,
    ) -> Result<(), ClientError> {
        self.configure(host, port, keep_alive, bind_address)?;
        self.connect_now()
    }

    /// Asks the network loop to connect. Returns right away, the outcome is
    /// reported to the connect handler
    pub fn connect_async(&self, host: &str, port: u16, keep_alive: Duration) -> Result<(), ClientError> {
        self.connect_bind_async(host, port, keep_alive, None)
    }

    pub fn connect_bind_async(
        &self,
        host: &str,
        port: u16,
        keep_alive: Duration,
        bind_address: Option<SocketAddr>,
    ) -> Result<(), ClientError> {
        self.configure(host, port, keep_alive, bind_address)?;
        self.inner.eventloop.connect_async();
        Ok(())
    }

    /// Connects again with the address, credentials and will of the last
    /// connection
    pub fn reconnect(&self) -> Result<(), ClientError> {
        if !self.inner.eventloop.state().connected_once {
            return Err(ClientError::NeverConnected);
        }

        self.connect_now()
    }

    pub fn reconnect_async(&self) -> Result<(), ClientError> {
        if !self.inner.eventloop.state().connected_once {
            return Err(ClientError::NeverConnected);
        }

        self.inner.eventloop.connect_async();
        Ok(())
    }

    fn configure(
        &self,
        host: &str,
        port: u16,
        keep_alive: Duration,
        bind_address: Option<SocketAddr>,
    ) -> Result<(), ClientError> {
        if !valid_host(host) {
            return Err(ClientError::InvalidHost(host.to_owned()));
        }

        let mut options = self.inner.eventloop.options();
        options
            .set_broker_address(host, port)
            .set_keep_alive(keep_alive)
            .set_bind_address(bind_address);
        Ok(())
    }

    fn connect_now(&self) -> Result<(), ClientError> {
        let eventloop = &self.inner.eventloop;
        let o = eventloop.block_on(eventloop.connect());
        eventloop.dispatch_events();
        o?;
        Ok(())
    }

    /// Sends a DISCONNECT. The loop closes the socket once it is written
    pub fn disconnect(&self) -> Result<(), ClientError> {
        let eventloop = &self.inner.eventloop;
        eventloop.state().begin_disconnect()?;
        eventloop.request(Request::Disconnect);
        Ok(())
    }

    /// Publishes a message. Returns the message id of qos 1/2 publishes,
    /// which is reported to the publish handler once the broker acks it
    pub fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<Option<u16>, ClientError>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.ensure_connected()?;

        let topic = topic.into();
        if !valid_topic(&topic) {
            return Err(ClientError::InvalidTopic(topic));
        }

        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        if publish.len() > MAX_REMAINING_LENGTH {
            return Err(ClientError::PayloadTooLarge(publish.payload.len()));
        }

        let eventloop = &self.inner.eventloop;
        let (pkid, request) = eventloop.state().outgoing_publish(publish)?;
        if let Some(request) = request {
            eventloop.request(request);
        }

        match qos {
            QoS::AtMostOnce => Ok(None),
            _ => Ok(Some(pkid)),
        }
    }

    /// Subscribes to a topic filter. Returns the message id reported to the
    /// subscribe handler with the granted qos
    pub fn subscribe<S: Into<String>>(&self, filter: S, qos: QoS) -> Result<u16, ClientError> {
        self.ensure_connected()?;

        let filter = filter.into();
        if !valid_filter(&filter) {
            return Err(ClientError::InvalidFilter(filter));
        }

        let eventloop = &self.inner.eventloop;
        let (pkid, request) = eventloop.state().outgoing_subscribe(Subscribe::new(filter, qos))?;
        eventloop.request(request);
        Ok(pkid)
    }

    /// Unsubscribes from a topic filter. Returns the message id reported to
    /// the unsubscribe handler
    pub fn unsubscribe<S: Into<String>>(&self, filter: S) -> Result<u16, ClientError> {
        self.ensure_connected()?;

        let filter = filter.into();
        if !valid_filter(&filter) {
            return Err(ClientError::InvalidFilter(filter));
        }

        let eventloop = &self.inner.eventloop;
        let (pkid, request) = eventloop.state().outgoing_unsubscribe(Unsubscribe::new(filter))?;
        eventloop.request(request);
        Ok(pkid)
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        match self.status() {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Runs one iteration of the network loop on the calling thread. Waits
    /// at most `timeout` for network activity and handles up to
    /// `max_packets` incoming packets
    pub fn loop_once(&self, timeout: Duration, max_packets: usize) -> Result<(), ClientError> {
        let _manual = self.manual()?;
        let o = self.inner.eventloop.iterate(timeout, max_packets);
        not_connected(o)
    }

    /// Runs the network loop on the calling thread until the connection is
    /// closed with `disconnect`, `loop_stop` is called or the connection
    /// fails
    pub fn loop_forever(&self, timeout: Duration, max_packets: usize) -> Result<(), ClientError> {
        let _manual = self.manual()?;
        let eventloop = &self.inner.eventloop;
        self.inner.stop.store(false, Ordering::SeqCst);

        let mut first = true;
        while !self.inner.stop.load(Ordering::SeqCst) {
            match eventloop.iterate(timeout, max_packets) {
                Ok(()) => {}
                Err(ConnectionError::NoConnection) if !first => return Ok(()),
                Err(e) => return not_connected(Err(e)),
            }

            first = false;
        }

        Ok(())
    }

    /// Reads and handles what the socket has available without waiting
    pub fn loop_read(&self, max_packets: usize) -> Result<(), ClientError> {
        let _manual = self.manual()?;
        let eventloop = &self.inner.eventloop;
        eventloop.dispatch_events();
        let o = eventloop.block_on(eventloop.poll_read(max_packets));
        eventloop.dispatch_events();
        not_connected(o)
    }

    /// Writes queued requests and replies
    pub fn loop_write(&self) -> Result<(), ClientError> {
        let _manual = self.manual()?;
        let eventloop = &self.inner.eventloop;
        let o = eventloop.block_on(eventloop.poll_write());
        eventloop.dispatch_events();
        not_connected(o)
    }

    /// Keep alive and retransmissions. Must be called regularly when the
    /// loop is driven with `loop_read` and `loop_write`
    pub fn loop_misc(&self) -> Result<(), ClientError> {
        let _manual = self.manual()?;
        let eventloop = &self.inner.eventloop;
        let o = eventloop.block_on(eventloop.poll_misc());
        eventloop.dispatch_events();
        not_connected(o)
    }

    /// There is something for `loop_write` to write
    pub fn want_write(&self) -> bool {
        self.inner.eventloop.want_write()
    }

    /// Starts a thread which drives the network loop. Does nothing when the
    /// thread is already running
    pub fn loop_start(&self) -> Result<(), ClientError> {
        let mut thread = lock(&self.inner.thread);
        if thread.is_some() {
            return Ok(());
        }

        if self.inner.manual.load(Ordering::SeqCst) {
            return Err(ClientError::LoopRunning);
        }

        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner.eventloop.clear_cancel();

        let eventloop = self.inner.eventloop.clone();
        let stop = self.inner.stop.clone();
        let handle = thread::Builder::new()
            .name("rumqttcb-loop".to_owned())
            .spawn(move || run(eventloop, stop))
            .map_err(ConnectionError::Io)?;

        *thread = Some(handle);
        Ok(())
    }

    /// Stops the loop thread and waits for it to finish its iteration. With
    /// `force` the socket is closed as well. Otherwise requests the thread
    /// didn't get to, a DISCONNECT included, are written before returning.
    /// Safe to call from any thread, handlers included, and when the loop
    /// isn't running
    pub fn loop_stop(&self, force: bool) -> Result<(), ClientError> {
        let eventloop = &self.inner.eventloop;
        self.inner.stop.store(true, Ordering::SeqCst);
        eventloop.cancel();

        let handle = lock(&self.inner.thread).take();
        if let Some(handle) = handle {
            join(handle);
        }

        if force {
            eventloop.block_on(eventloop.close());
            eventloop.dispatch_events();
            return Ok(());
        }

        if eventloop.want_write() {
            let o = eventloop.block_on(eventloop.poll_write());
            eventloop.dispatch_events();
            match o {
                Ok(()) | Err(ConnectionError::NoConnection) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn loop_running(&self) -> bool {
        lock(&self.inner.thread).is_some() || self.inner.manual.load(Ordering::SeqCst)
    }

    fn manual(&self) -> Result<ManualLoop<'_>, ClientError> {
        // `loop_start` checks the flag under the same lock
        let thread = lock(&self.inner.thread);
        if thread.is_some() || self.inner.manual.swap(true, Ordering::SeqCst) {
            return Err(ClientError::LoopRunning);
        }

        Ok(ManualLoop(&self.inner.manual))
    }

    /// Registers the handler for an event kind, replacing the previous one
    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.eventloop.dispatcher.register(kind, Arc::new(handler));
    }

    pub fn unregister(&self, kind: EventKind) {
        self.inner.eventloop.dispatcher.unregister(kind);
    }

    /// Called with the connack code of every connection attempt
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(ConnectReturnCode) + Send + Sync + 'static,
    {
        self.register(EventKind::Connect, move |n: &Notification| {
            if let Notification::Connect(code) = n {
                f(*code)
            }
        });
    }

    /// Called when a connection closes, with `true` when it wasn't asked for
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.register(EventKind::Disconnect, move |n: &Notification| {
            if let Notification::Disconnect { unexpected } = n {
                f(*unexpected)
            }
        });
    }

    /// Called with the message id of a qos 1/2 publish once it is acked
    pub fn on_publish<F>(&self, f: F)
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        self.register(EventKind::Publish, move |n: &Notification| {
            if let Notification::Publish { mid } = n {
                f(*mid)
            }
        });
    }

    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(EventKind::Message, move |n: &Notification| {
            if let Notification::Message(message) = n {
                f(message)
            }
        });
    }

    pub fn on_subscribe<F>(&self, f: F)
    where
        F: Fn(u16, &[SubscribeReasonCode]) + Send + Sync + 'static,
    {
        self.register(EventKind::Subscribe, move |n: &Notification| {
            if let Notification::Subscribe { mid, granted_qos } = n {
                f(*mid, &granted_qos[..])
            }
        });
    }

    pub fn on_unsubscribe<F>(&self, f: F)
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        self.register(EventKind::Unsubscribe, move |n: &Notification| {
            if let Notification::Unsubscribe { mid } = n {
                f(*mid)
            }
        });
    }

    pub fn on_log<F>(&self, f: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.register(EventKind::Log, move |n: &Notification| {
            if let Notification::Log { level, message } = n {
                f(*level, message)
            }
        });
    }

    /// Routes log events to a logger. Replaces the log handler
    pub fn set_logger(&self, adapter: Box<dyn LogAdapter>) {
        let progname = self.client_id();
        self.inner.eventloop.dispatcher.set_logger(adapter, progname);
    }
}

/// Clears the manual loop flag when the loop call returns
struct ManualLoop<'a>(&'a AtomicBool);

impl Drop for ManualLoop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Body of the loop thread
fn run(eventloop: Arc<EventLoop>, stop: Arc<AtomicBool>) {
    debug!("Loop thread started");
    while !stop.load(Ordering::SeqCst) {
        match eventloop.iterate(LOOP_TIMEOUT, LOOP_MAX_PACKETS) {
            Ok(()) => {}
            Err(ConnectionError::NoConnection) => eventloop.block_on(eventloop.idle(LOOP_TIMEOUT)),
            Err(e) => debug!("Loop iteration failed = {:?}", e),
        }
    }

    eventloop.dispatch_events();
    debug!("Loop thread stopped");
}

/// Waits for the loop thread. A handler stopping the loop runs on the loop
/// thread itself, which then exits after the handler returns
fn join(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }

    if handle.join().is_err() {
        error!("Loop thread panicked");
    }
}

fn not_connected(o: Result<(), ConnectionError>) -> Result<(), ClientError> {
    match o {
        Ok(()) => Ok(()),
        Err(ConnectionError::NoConnection) => Err(ClientError::NotConnected),
        Err(e) => Err(e.into()),
    }
}

fn client_id_or_random(client_id: Option<&str>) -> Result<String, ClientError> {
    match client_id {
        Some(id) if !valid_client_id(id) => Err(ClientError::InvalidClientId),
        Some(id) => Ok(id.to_owned()),
        None => {
            let suffix: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            Ok(format!("rumqttcb-{suffix}"))
        }
    }
}

/// Client ids have to fit a length prefixed string and can't be empty
fn valid_client_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= u16::MAX as usize && !id.contains('\0')
}

/// Host names and addresses can't be empty or contain whitespace or control
/// characters
fn valid_host(host: &str) -> bool {
    !host.is_empty() && !host.chars().any(|c| c.is_whitespace() || c.is_control())
}
