//! Callback registry. Every event the engine produces, log lines included,
//! reaches user code through [`Dispatcher::deliver`]

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::lock;
use crate::mqttbytes::v4::{ConnectReturnCode, Publish, SubscribeReasonCode};
use crate::mqttbytes::QoS;

pub const LOG_NONE: u16 = 0x00;
pub const LOG_INFO: u16 = 0x01;
pub const LOG_NOTICE: u16 = 0x02;
pub const LOG_WARNING: u16 = 0x04;
pub const LOG_ERR: u16 = 0x08;
pub const LOG_DEBUG: u16 = 0x10;
pub const LOG_SUBSCRIBE: u16 = 0x20;
pub const LOG_UNSUBSCRIBE: u16 = 0x40;
pub const LOG_ALL: u16 = 0xFFFF;

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Notice,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    /// Bit of this level in the `LOG_*` masks
    pub fn mask(&self) -> u16 {
        match self {
            LogLevel::Info => LOG_INFO,
            LogLevel::Notice => LOG_NOTICE,
            LogLevel::Warning => LOG_WARNING,
            LogLevel::Error => LOG_ERR,
            LogLevel::Debug => LOG_DEBUG,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> log::Level {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Notice | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Publish received from the broker
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Packet id. 0 for qos 0 messages
    pub mid: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl Message {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, invalid utf-8 is replaced
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Message {
        Message {
            mid: publish.pkid,
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mid = {}, Topic = {}, Qos = {:?}, Retain = {}, Payload Size = {}",
            self.mid,
            self.topic,
            self.qos,
            self.retain,
            self.payload.len()
        )
    }
}

/// Kinds of events a handler can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Publish,
    Message,
    Subscribe,
    Unsubscribe,
    Log,
}

/// Events delivered to handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Connack for a connect attempt. Refusals are reported too
    Connect(ConnectReturnCode),
    /// Socket of an established connection closed. `unexpected` is false
    /// only when the close followed `disconnect()` or a new connect
    Disconnect { unexpected: bool },
    /// Outgoing qos 1/2 publish completed its ack flow
    Publish { mid: u16 },
    /// Incoming publish
    Message(Message),
    Subscribe {
        mid: u16,
        granted_qos: Vec<SubscribeReasonCode>,
    },
    Unsubscribe { mid: u16 },
    Log { level: LogLevel, message: String },
}

impl Notification {
    pub fn kind(&self) -> EventKind {
        match self {
            Notification::Connect(_) => EventKind::Connect,
            Notification::Disconnect { .. } => EventKind::Disconnect,
            Notification::Publish { .. } => EventKind::Publish,
            Notification::Message(_) => EventKind::Message,
            Notification::Subscribe { .. } => EventKind::Subscribe,
            Notification::Unsubscribe { .. } => EventKind::Unsubscribe,
            Notification::Log { .. } => EventKind::Log,
        }
    }

    pub(crate) fn log<S: Into<String>>(level: LogLevel, message: S) -> Notification {
        Notification::Log {
            level,
            message: message.into(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Logger collaborator. Receives every log event with the client id as
/// `progname`
pub trait LogAdapter: Send + Sync {
    fn add(&self, level: LogLevel, message: &str, progname: &str);
}

/// Forwards log events to the `log` facade under a fixed target
pub struct LogCrateAdapter {
    target: String,
}

impl LogCrateAdapter {
    pub fn new<S: Into<String>>(target: S) -> LogCrateAdapter {
        LogCrateAdapter {
            target: target.into(),
        }
    }
}

impl LogAdapter for LogCrateAdapter {
    fn add(&self, level: LogLevel, message: &str, progname: &str) {
        log!(target: &self.target, log::Level::from(level), "{}: {}", progname, message);
    }
}

/// At most one handler per [`EventKind`]. Registration replaces the
/// previous handler
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<EventKind, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn register(&self, kind: EventKind, handler: Handler) {
        lock(&self.handlers).insert(kind, handler);
    }

    pub fn unregister(&self, kind: EventKind) {
        lock(&self.handlers).remove(&kind);
    }

    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }

    /// Routes log events to `adapter`, replacing any log handler
    pub fn set_logger(&self, adapter: Box<dyn LogAdapter>, progname: String) {
        let adapter: Arc<dyn LogAdapter> = Arc::from(adapter);
        self.register(
            EventKind::Log,
            Arc::new(move |notification: &Notification| {
                if let Notification::Log { level, message } = notification {
                    adapter.add(*level, message, &progname);
                }
            }),
        );
    }

    /// Produces a log event
    pub fn log<S: Into<String>>(&self, level: LogLevel, message: S) {
        self.deliver(&Notification::log(level, message));
    }

    /// Calls the handler registered for the notification's kind. The
    /// registry isn't locked while the handler runs, so handlers are free
    /// to register handlers or call into the client
    pub fn deliver(&self, notification: &Notification) {
        if let Notification::Log { level, message } = notification {
            log!(log::Level::from(*level), "{}", message);
        }

        let kind = notification.kind();
        let handler = match lock(&self.handlers).get(&kind) {
            Some(handler) => handler.clone(),
            None => return,
        };

        let o = panic::catch_unwind(AssertUnwindSafe(|| handler(notification)));
        if let Err(e) = o {
            let reason = panic_message(&*e);
            match kind {
                EventKind::Log => error!("Log handler panicked: {}", reason),
                kind => self.log(
                    LogLevel::Error,
                    format!("{:?} handler panicked: {}", kind, reason),
                ),
            }
        }
    }
}

fn panic_message(e: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector(dispatcher: &Dispatcher, kind: EventKind) -> Arc<Mutex<Vec<Notification>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.register(
            kind,
            Arc::new(move |n: &Notification| sink.lock().unwrap().push(n.clone())),
        );

        events
    }

    #[test]
    fn notifications_reach_handler_of_their_kind() {
        let dispatcher = Dispatcher::new();
        let connects = collector(&dispatcher, EventKind::Connect);
        let acks = collector(&dispatcher, EventKind::Publish);

        dispatcher.deliver(&Notification::Connect(ConnectReturnCode::Success));
        dispatcher.deliver(&Notification::Publish { mid: 1 });
        dispatcher.deliver(&Notification::Publish { mid: 2 });
        dispatcher.deliver(&Notification::Unsubscribe { mid: 3 });

        assert_eq!(
            *connects.lock().unwrap(),
            vec![Notification::Connect(ConnectReturnCode::Success)]
        );
        assert_eq!(
            *acks.lock().unwrap(),
            vec![
                Notification::Publish { mid: 1 },
                Notification::Publish { mid: 2 }
            ]
        );
    }

    #[test]
    fn last_registration_wins() {
        let dispatcher = Dispatcher::new();
        let first = collector(&dispatcher, EventKind::Publish);
        let second = collector(&dispatcher, EventKind::Publish);

        dispatcher.deliver(&Notification::Publish { mid: 1 });
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);

        dispatcher.unregister(EventKind::Publish);
        dispatcher.deliver(&Notification::Publish { mid: 2 });
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn handler_panic_becomes_error_log() {
        let dispatcher = Dispatcher::new();
        let logs = collector(&dispatcher, EventKind::Log);
        dispatcher.register(EventKind::Message, Arc::new(|_: &Notification| panic!("bad handler")));

        let message = Message::from(Publish::new("t", QoS::AtMostOnce, "x"));
        dispatcher.deliver(&Notification::Message(message));

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        match &logs[0] {
            Notification::Log { level, message } => {
                assert_eq!(*level, LogLevel::Error);
                assert!(message.contains("bad handler"));
            }
            n => panic!("Expected log, received {n:?}"),
        }
    }

    #[test]
    fn panicking_log_handler_is_contained() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        dispatcher.register(
            EventKind::Log,
            Arc::new(move |_: &Notification| {
                c.fetch_add(1, Ordering::SeqCst);
                panic!("bad logger")
            }),
        );

        dispatcher.log(LogLevel::Info, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_can_reregister_from_inside_a_callback() {
        let dispatcher = Arc::new(Dispatcher::new());
        let d = dispatcher.clone();
        dispatcher.register(
            EventKind::Connect,
            Arc::new(move |_: &Notification| d.unregister(EventKind::Connect)),
        );

        dispatcher.deliver(&Notification::Connect(ConnectReturnCode::Success));
        assert!(lock(&dispatcher.handlers).is_empty());
    }

    struct Recorder(Mutex<Vec<(LogLevel, String, String)>>);

    impl LogAdapter for Arc<Recorder> {
        fn add(&self, level: LogLevel, message: &str, progname: &str) {
            self.0
                .lock()
                .unwrap()
                .push((level, message.to_owned(), progname.to_owned()));
        }
    }

    #[test]
    fn logger_adapter_receives_level_message_and_progname() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        dispatcher.set_logger(Box::new(recorder.clone()), "client-1".to_owned());

        dispatcher.log(LogLevel::Warning, "careful");
        dispatcher.deliver(&Notification::Publish { mid: 1 });

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(
                LogLevel::Warning,
                "careful".to_owned(),
                "client-1".to_owned()
            )]
        );
    }

    #[test]
    fn log_levels_map_to_masks_and_log_crate() {
        assert_eq!(LogLevel::Notice.mask(), LOG_NOTICE);
        assert_eq!(LogLevel::Debug.mask(), 0x10);

        let levels = [
            LogLevel::Info,
            LogLevel::Notice,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Debug,
        ];
        for level in levels {
            assert_eq!(level.mask() & LOG_ALL, level.mask());
            assert_eq!(level.mask() & LOG_NONE, 0);
            assert_eq!(level.mask() & (LOG_SUBSCRIBE | LOG_UNSUBSCRIBE), 0);
        }

        assert_eq!(log::Level::from(LogLevel::Notice), log::Level::Info);
        assert_eq!(log::Level::from(LogLevel::Warning), log::Level::Warn);
    }
}
