//! A callback driven MQTT 3.1.1 client engine.
//!
//! Operations on a [`Client`] queue packets for a network loop backed by an
//! async (tokio) eventloop. Everything the broker sends back, acks and
//! incoming messages and the client's own log lines, is delivered to the
//! handlers registered on the client. The loop is driven either by the
//! caller, one iteration at a time, or by a thread owned by the client.
//!
//! A simple publish and subscribe
//! ----------------------------
//!
//! ```no_run
//! use rumqttcb::{Client, QoS};
//! use std::time::Duration;
//!
//! rumqttcb::init().unwrap();
//!
//! let client = Client::new(Some("rumqttcb-sync")).unwrap();
//! client.on_message(|message| println!("{} = {}", message.topic, message.payload_str()));
//! client.on_log(|level, line| println!("{:?}: {}", level, line));
//!
//! client.connect("test.mosquitto.org", 1883, Duration::from_secs(10)).unwrap();
//! client.subscribe("hello/rumqtt", QoS::AtLeastOnce).unwrap();
//! client.publish("hello/rumqtt", QoS::AtLeastOnce, false, "hello").unwrap();
//!
//! // Drive the network loop on the calling thread
//! for _ in 0..10 {
//!     client.loop_once(Duration::from_secs(1), 10).unwrap();
//! }
//!
//! client.disconnect().unwrap();
//! client.loop_once(Duration::from_secs(1), 10).unwrap();
//! rumqttcb::cleanup();
//! ```
//!
//! Quick overview of features
//! - Qos 0, 1 and 2 publishes in both directions with retransmission (DUP)
//!   of unacked publishes after a reconnect
//! - Inflight window for outgoing publishes with queueing beyond it
//! - Pings the broker when necessary and detects half open connections
//! - Blocking and asynchronous connects, no automatic reconnection
//! - Loop driven manually (`loop_once`, `loop_forever`, split read/write/misc
//!   phases) or by a thread (`loop_start`/`loop_stop`)
//!
//! ## Important notes
//!
//! - [`init`] must be called before creating clients and [`cleanup`] once
//!   they are dropped. Both nest.
//! - Handlers run on the thread driving the loop. Blocking inside a handler
//!   blocks connection progress.
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;

use std::sync::{Mutex, MutexGuard, PoisonError};

mod client;
mod dispatch;
mod eventloop;
mod framed;
pub mod mqttbytes;
mod options;
mod runtime;
mod state;

pub use client::{Client, ClientError};
pub use dispatch::{
    EventKind, Handler, LogAdapter, LogCrateAdapter, LogLevel, Message, Notification, LOG_ALL,
    LOG_DEBUG, LOG_ERR, LOG_INFO, LOG_NONE, LOG_NOTICE, LOG_SUBSCRIBE, LOG_UNSUBSCRIBE,
    LOG_WARNING,
};
pub use eventloop::ConnectionError;
pub use mqttbytes::v4::{ConnectReturnCode, LastWill, Login, SubscribeReasonCode};
pub use mqttbytes::QoS;
#[cfg(feature = "url")]
pub use options::OptionError;
pub use options::MqttOptions;
pub use runtime::{cleanup, init, version};
pub use state::{ConnectionStatus, StateError};

/// Mqtt protocol level spoken by the client (3.1.1)
pub const MQTT_PROTOCOL_LEVEL: u8 = mqttbytes::v4::PROTOCOL_LEVEL;

/// Locks a mutex. Handlers run under `catch_unwind`, a poisoned lock still
/// holds consistent data
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
