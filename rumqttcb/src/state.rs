use crate::dispatch::{LogLevel, Message, Notification};
use crate::mqttbytes::v4::*;
use crate::mqttbytes::{self, QoS};
use crate::MqttOptions;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Errors during state handling
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Operation needs an established connection
    #[error("Operation not allowed while {0:?}")]
    InvalidState(ConnectionStatus),
    #[error("Last pingreq isn't acked")]
    AwaitPingResp,
    #[error("Connack not received within connection timeout")]
    AwaitConnAck,
    #[error("All packet ids are in use")]
    PacketIdsExhausted,
    #[error("Broker refused connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Received unexpected {0} from broker")]
    UnexpectedPacket(&'static str),
    #[error("Received connack while {0:?}")]
    UnexpectedConnAck(ConnectionStatus),
    #[error("Mqtt serialization/deserialization error: {0}")]
    Deserialization(#[from] mqttbytes::Error),
}

/// Status of the connection to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What an outstanding packet id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Acknowledgement progress of an outstanding packet id. Terminal states
/// aren't represented, entries are removed once they get there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Publish waiting for room in the inflight window
    Queued,
    /// Packet handed to the network, waiting for puback, pubrec, suback
    /// or unsuback
    Sent,
    /// Pubrec received and pubrel sent, waiting for pubcomp
    Received,
}

/// Bookkeeping of one packet id
#[derive(Debug, Clone)]
pub struct OutstandingMessage {
    pub direction: Direction,
    pub qos: QoS,
    pub state: AckState,
    /// Issue order, used to retransmit in the original order
    seq: u64,
    /// Last time the packet was written. `None` until the network loop
    /// picks up the request
    sent_at: Option<Instant>,
    /// Connection dropped before the ack flow completed. Sent again once
    /// the next connection is accepted
    pending: bool,
    packet: Packet,
}

/// Requests by the client to the network loop. Packets that need acks are
/// stored in the state when they are issued and travel as their packet id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// QoS 0 publish
    Publish(Publish),
    /// Publish, subscribe or unsubscribe held by the state
    Outstanding(u16),
    Disconnect,
}

/// State of the mqtt connection.
/// Methods will just modify the state of the object without doing any network operations
/// Network loop holds the state behind a lock and updates it for every packet
/// that goes in or out, facade operations use it to allocate packet ids
#[derive(Debug)]
pub struct MqttState {
    /// Status of the connection
    pub status: ConnectionStatus,
    /// Set once a connection has been accepted by a broker
    pub connected_once: bool,
    /// Connect has been requested but the network loop hasn't opened the
    /// socket yet
    pub connect_pending: bool,
    /// Client id used in log lines
    client_id: String,
    /// Status of last ping
    pub await_pingresp: bool,
    /// Last incoming packet time
    last_incoming: Instant,
    /// Last outgoing packet time
    last_outgoing: Instant,
    /// Time of the last pingreq
    last_ping: Instant,
    /// Time the current connection attempt started
    connect_started: Instant,
    keep_alive: Duration,
    message_retry: Duration,
    connection_timeout: Duration,
    /// Packet id of the last outgoing packet
    last_pkid: u16,
    /// Next value of `OutstandingMessage::seq`
    seq: u64,
    /// Number of outgoing qos 1/2 publishes occupying the inflight window
    pub inflight: u16,
    /// Maximum number of allowed inflight. 0 is unlimited
    max_inflight: u16,
    /// Outgoing publishes, subscribes and unsubscribes waiting for acks
    outstanding: HashMap<u16, OutstandingMessage>,
    /// Queued publishes in issue order
    queued: VecDeque<u16>,
    /// Packet ids of incoming qos 2 publishes waiting for pubrel
    incoming_pub: HashSet<u16>,
    /// Notifications waiting to be dispatched
    pub events: VecDeque<Notification>,
}

impl MqttState {
    /// Creates new mqtt state. Same state should be used during a
    /// connection for persistent sessions while new state should
    /// instantiated for clean sessions
    pub fn new(max_inflight: u16) -> Self {
        let now = Instant::now();
        MqttState {
            status: ConnectionStatus::Disconnected,
            connected_once: false,
            connect_pending: false,
            client_id: String::new(),
            await_pingresp: false,
            last_incoming: now,
            last_outgoing: now,
            last_ping: now,
            connect_started: now,
            keep_alive: Duration::ZERO,
            message_retry: Duration::ZERO,
            connection_timeout: Duration::from_secs(5),
            last_pkid: 0,
            seq: 0,
            inflight: 0,
            max_inflight,
            outstanding: HashMap::new(),
            queued: VecDeque::new(),
            incoming_pub: HashSet::new(),
            events: VecDeque::new(),
        }
    }

    pub fn set_max_inflight(&mut self, max_inflight: u16) {
        self.max_inflight = max_inflight;
    }

    pub fn set_message_retry(&mut self, retry: Duration) {
        self.message_retry = retry;
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Entry for a packet id, if it is still waiting for acks
    #[cfg(test)]
    pub fn outstanding(&self, pkid: u16) -> Option<&OutstandingMessage> {
        self.outstanding.get(&pkid)
    }

    #[cfg(test)]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Queues a log notification
    pub fn log<S: Into<String>>(&mut self, level: LogLevel, message: S) {
        self.events.push_back(Notification::log(level, message));
    }

    /// Starts a connection attempt with the timers and limits of `options`
    pub fn begin_connect(&mut self, options: &MqttOptions, now: Instant) {
        self.status = ConnectionStatus::Connecting;
        self.client_id = options.client_id();
        self.keep_alive = options.keep_alive();
        self.message_retry = options.message_retry();
        self.connection_timeout = options.connection_timeout();
        self.max_inflight = options.inflight();
        self.await_pingresp = false;
        self.connect_started = now;
        self.last_incoming = now;
        self.last_outgoing = now;
    }

    /// Graceful close requested by the user
    pub fn begin_disconnect(&mut self) -> Result<(), StateError> {
        if self.status != ConnectionStatus::Connected {
            return Err(StateError::InvalidState(self.status));
        }

        self.status = ConnectionStatus::Disconnecting;
        Ok(())
    }

    /// Socket is gone. Publishes in the middle of an ack flow keep their
    /// packet ids and are sent again after the next connack, subscribes
    /// and unsubscribes are forgotten. Incoming qos 2 ids waiting for
    /// pubrel stay until a connack without a session
    pub fn socket_closed(&mut self, unexpected: bool) {
        let previous = self.status;
        self.status = ConnectionStatus::Disconnected;
        self.connect_pending = false;
        self.await_pingresp = false;

        self.outstanding.retain(|_, m| m.direction == Direction::Publish);
        for message in self.outstanding.values_mut() {
            if message.state != AckState::Queued {
                message.pending = true;
            }
        }

        match previous {
            ConnectionStatus::Connected => {
                self.events
                    .push_back(Notification::Disconnect { unexpected });
            }
            ConnectionStatus::Disconnecting => {
                self.events
                    .push_back(Notification::Disconnect { unexpected: false });
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => (),
        }
    }

    /// Drops all session state. Used when the client is reinitialised
    pub fn reset(&mut self) {
        *self = MqttState::new(self.max_inflight);
    }

    fn ensure_connected(&self) -> Result<(), StateError> {
        match self.status {
            ConnectionStatus::Connected => Ok(()),
            status => Err(StateError::InvalidState(status)),
        }
    }

    /// Registers an outgoing publish. Returns the allocated packet id (0
    /// for qos 0) and the request to hand to the network loop. A publish
    /// beyond the inflight window gets an id but no request, it is
    /// released by `retransmits` once acks make room
    pub fn outgoing_publish(
        &mut self,
        mut publish: Publish,
    ) -> Result<(u16, Option<Request>), StateError> {
        self.ensure_connected()?;

        if publish.qos == QoS::AtMostOnce {
            return Ok((0, Some(Request::Publish(publish))));
        }

        let pkid = self.next_pkid()?;
        publish.pkid = pkid;

        let window_full = self.max_inflight != 0 && self.inflight >= self.max_inflight;
        let state = if window_full {
            self.queued.push_back(pkid);
            AckState::Queued
        } else {
            self.inflight += 1;
            AckState::Sent
        };

        let qos = publish.qos;
        self.insert(pkid, Direction::Publish, qos, state, Packet::Publish(publish));

        match state {
            AckState::Queued => Ok((pkid, None)),
            _ => Ok((pkid, Some(Request::Outstanding(pkid)))),
        }
    }

    /// Registers an outgoing subscribe. Always allocates a packet id
    pub fn outgoing_subscribe(
        &mut self,
        mut subscribe: Subscribe,
    ) -> Result<(u16, Request), StateError> {
        self.ensure_connected()?;

        let pkid = self.next_pkid()?;
        subscribe.pkid = pkid;

        let qos = subscribe
            .filters
            .iter()
            .map(|f| f.qos)
            .max_by_key(|qos| *qos as u8)
            .unwrap_or_default();

        let packet = Packet::Subscribe(subscribe);
        self.insert(pkid, Direction::Subscribe, qos, AckState::Sent, packet);
        Ok((pkid, Request::Outstanding(pkid)))
    }

    /// Registers an outgoing unsubscribe. Always allocates a packet id
    pub fn outgoing_unsubscribe(
        &mut self,
        mut unsubscribe: Unsubscribe,
    ) -> Result<(u16, Request), StateError> {
        self.ensure_connected()?;

        let pkid = self.next_pkid()?;
        unsubscribe.pkid = pkid;

        let packet = Packet::Unsubscribe(unsubscribe);
        let qos = QoS::AtLeastOnce;
        self.insert(pkid, Direction::Unsubscribe, qos, AckState::Sent, packet);
        Ok((pkid, Request::Outstanding(pkid)))
    }

    fn insert(&mut self, pkid: u16, direction: Direction, qos: QoS, state: AckState, packet: Packet) {
        self.seq += 1;
        let message = OutstandingMessage {
            direction,
            qos,
            state,
            seq: self.seq,
            sent_at: None,
            pending: false,
            packet,
        };

        self.outstanding.insert(pkid, message);
    }

    /// Converts a request from the client into the packet to write. Stale
    /// requests (acked, waiting for retransmission after a reconnect or
    /// already written) produce nothing
    pub fn handle_outgoing_packet(
        &mut self,
        request: Request,
        now: Instant,
    ) -> Option<Packet> {
        let packet = match request {
            Request::Publish(publish) => Packet::Publish(publish),
            Request::Outstanding(pkid) => {
                let message = self.outstanding.get_mut(&pkid)?;
                if message.pending || message.sent_at.is_some() {
                    return None;
                }

                if message.state == AckState::Queued {
                    return None;
                }

                message.sent_at = Some(now);
                message.packet.clone()
            }
            Request::Disconnect if self.status == ConnectionStatus::Disconnecting => {
                Packet::Disconnect
            }
            Request::Disconnect => return None,
        };

        Some(packet)
    }

    /// Records that a packet was written to the network
    pub fn on_outgoing(&mut self, packet: &Packet, now: Instant) {
        self.last_outgoing = now;
        if let Packet::PingReq = packet {
            self.await_pingresp = true;
            self.last_ping = now;
        }
    }

    /// Consolidates handling of all incoming mqtt packets. Returns a
    /// `Packet` which for the user to consume and `Packet` which for the
    /// eventloop to put on the network. Notifications produced by the packet
    /// are queued in `events`
    pub fn handle_incoming_packet(
        &mut self,
        packet: Packet,
        now: Instant,
    ) -> Result<Option<Packet>, StateError> {
        self.last_incoming = now;
        match packet {
            Packet::ConnAck(connack) => self.handle_incoming_connack(connack),
            Packet::Publish(publish) => self.handle_incoming_publish(publish),
            Packet::PubAck(puback) => self.handle_incoming_puback(puback),
            Packet::PubRec(pubrec) => self.handle_incoming_pubrec(pubrec, now),
            Packet::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel),
            Packet::PubComp(pubcomp) => self.handle_incoming_pubcomp(pubcomp),
            Packet::SubAck(suback) => self.handle_incoming_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_incoming_unsuback(unsuback),
            Packet::PingResp => {
                self.await_pingresp = false;
                Ok(None)
            }
            packet => Err(StateError::UnexpectedPacket(packet.name())),
        }
    }

    fn handle_incoming_connack(&mut self, connack: ConnAck) -> Result<Option<Packet>, StateError> {
        if self.status != ConnectionStatus::Connecting {
            return Err(StateError::UnexpectedConnAck(self.status));
        }

        self.events.push_back(Notification::Connect(connack.code));
        if connack.code != ConnectReturnCode::Success {
            self.status = ConnectionStatus::Disconnected;
            self.log(
                LogLevel::Error,
                format!("Connection refused: {}", connack.code.reason()),
            );
            return Err(StateError::ConnectionRefused(connack.code));
        }

        // a broker without our session won't release old qos 2 ids
        if !connack.session_present {
            self.incoming_pub.clear();
        }

        self.status = ConnectionStatus::Connected;
        self.connected_once = true;
        Ok(None)
    }

    /// Results in a publish notification in all the QoS cases. Replies with
    /// an ack in case of QoS1 and Replies rec in case of QoS2. A QoS2
    /// publish seen again before its pubrel isn't notified twice
    fn handle_incoming_publish(&mut self, publish: Publish) -> Result<Option<Packet>, StateError> {
        let qos = publish.qos;
        let pkid = publish.pkid;

        match qos {
            QoS::AtMostOnce => {
                self.events.push_back(Notification::Message(Message::from(publish)));
                Ok(None)
            }
            QoS::AtLeastOnce => {
                self.events.push_back(Notification::Message(Message::from(publish)));
                Ok(Some(Packet::PubAck(PubAck::new(pkid))))
            }
            QoS::ExactlyOnce => {
                if self.incoming_pub.insert(pkid) {
                    self.events.push_back(Notification::Message(Message::from(publish)));
                } else {
                    self.log(
                        LogLevel::Debug,
                        format!("Duplicate qos 2 publish, mid = {pkid}"),
                    );
                }

                Ok(Some(Packet::PubRec(PubRec::new(pkid))))
            }
        }
    }

    fn handle_incoming_puback(&mut self, puback: PubAck) -> Result<Option<Packet>, StateError> {
        let pkid = puback.pkid;
        if !self.is_awaiting(pkid, Direction::Publish, QoS::AtLeastOnce, AckState::Sent) {
            self.unsolicited("PUBACK", pkid);
            return Ok(None);
        }

        self.outstanding.remove(&pkid);
        self.inflight = self.inflight.saturating_sub(1);
        self.events.push_back(Notification::Publish { mid: pkid });
        Ok(None)
    }

    fn handle_incoming_pubrec(
        &mut self,
        pubrec: PubRec,
        now: Instant,
    ) -> Result<Option<Packet>, StateError> {
        let pkid = pubrec.pkid;
        if !self.is_awaiting(pkid, Direction::Publish, QoS::ExactlyOnce, AckState::Sent) {
            self.unsolicited("PUBREC", pkid);
            return Ok(None);
        }

        if let Some(message) = self.outstanding.get_mut(&pkid) {
            message.state = AckState::Received;
            message.sent_at = Some(now);
            message.packet = Packet::PubRel(PubRel::new(pkid));
        }

        Ok(Some(Packet::PubRel(PubRel::new(pkid))))
    }

    fn handle_incoming_pubrel(&mut self, pubrel: PubRel) -> Result<Option<Packet>, StateError> {
        let pkid = pubrel.pkid;
        if !self.incoming_pub.remove(&pkid) {
            // the broker may repeat a pubrel whose pubcomp got lost
            self.unsolicited("PUBREL", pkid);
        }

        Ok(Some(Packet::PubComp(PubComp::new(pkid))))
    }

    fn handle_incoming_pubcomp(&mut self, pubcomp: PubComp) -> Result<Option<Packet>, StateError> {
        let pkid = pubcomp.pkid;
        if !self.is_awaiting(pkid, Direction::Publish, QoS::ExactlyOnce, AckState::Received) {
            self.unsolicited("PUBCOMP", pkid);
            return Ok(None);
        }

        self.outstanding.remove(&pkid);
        self.inflight = self.inflight.saturating_sub(1);
        self.events.push_back(Notification::Publish { mid: pkid });
        Ok(None)
    }

    fn handle_incoming_suback(&mut self, suback: SubAck) -> Result<Option<Packet>, StateError> {
        let pkid = suback.pkid;
        if !self.is_awaiting_direction(pkid, Direction::Subscribe) {
            self.unsolicited("SUBACK", pkid);
            return Ok(None);
        }

        self.outstanding.remove(&pkid);
        self.events.push_back(Notification::Subscribe {
            mid: pkid,
            granted_qos: suback.return_codes,
        });
        Ok(None)
    }

    fn handle_incoming_unsuback(
        &mut self,
        unsuback: UnsubAck,
    ) -> Result<Option<Packet>, StateError> {
        let pkid = unsuback.pkid;
        if !self.is_awaiting_direction(pkid, Direction::Unsubscribe) {
            self.unsolicited("UNSUBACK", pkid);
            return Ok(None);
        }

        self.outstanding.remove(&pkid);
        self.events.push_back(Notification::Unsubscribe { mid: pkid });
        Ok(None)
    }

    fn is_awaiting(&self, pkid: u16, direction: Direction, qos: QoS, state: AckState) -> bool {
        match self.outstanding.get(&pkid) {
            Some(m) => m.direction == direction && m.qos == qos && m.state == state,
            None => false,
        }
    }

    fn is_awaiting_direction(&self, pkid: u16, direction: Direction) -> bool {
        match self.outstanding.get(&pkid) {
            Some(m) => m.direction == direction,
            None => false,
        }
    }

    fn unsolicited(&mut self, name: &str, pkid: u16) {
        warn!("Unsolicited {}, pkid = {}", name, pkid);
        self.log(
            LogLevel::Warning,
            format!("Client {} received {name} for unknown mid {pkid}, ignoring", self.client_id),
        );
    }

    /// Housekeeping that depends only on time. Fails when the broker stops
    /// answering pings or doesn't answer a connect in time. Returns the
    /// packets that are due: pingreq, retransmissions after a reconnect,
    /// queued publishes that fit the inflight window and retries
    pub fn misc(&mut self, now: Instant) -> Result<Vec<Packet>, StateError> {
        match self.status {
            ConnectionStatus::Connecting => {
                if now.duration_since(self.connect_started) >= self.connection_timeout {
                    return Err(StateError::AwaitConnAck);
                }

                Ok(Vec::new())
            }
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting => {
                let mut packets = Vec::new();
                if let Some(ping) = self.check_keep_alive(now)? {
                    packets.push(ping);
                }

                if self.status == ConnectionStatus::Connected {
                    packets.extend(self.retransmits(now));
                }

                Ok(packets)
            }
            ConnectionStatus::Disconnected => Ok(Vec::new()),
        }
    }

    fn check_keep_alive(&mut self, now: Instant) -> Result<Option<Packet>, StateError> {
        if self.keep_alive.is_zero() {
            return Ok(None);
        }

        if self.await_pingresp {
            if now.duration_since(self.last_ping) >= self.keep_alive {
                return Err(StateError::AwaitPingResp);
            }

            return Ok(None);
        }

        let idle_out = now.duration_since(self.last_outgoing);
        let idle_in = now.duration_since(self.last_incoming);
        if idle_out >= self.keep_alive || idle_in >= self.keep_alive {
            return Ok(Some(Packet::PingReq));
        }

        Ok(None)
    }

    /// Packets to write again or for the first time now that the
    /// connection allows it, in issue order
    fn retransmits(&mut self, now: Instant) -> Vec<Packet> {
        let mut due: Vec<&mut OutstandingMessage> = Vec::new();
        let retry = self.message_retry;

        // window freed up by acks
        while self.max_inflight == 0 || self.inflight < self.max_inflight {
            let pkid = match self.queued.pop_front() {
                Some(pkid) => pkid,
                None => break,
            };

            if let Some(message) = self.outstanding.get_mut(&pkid) {
                message.state = AckState::Sent;
                message.pending = true;
                self.inflight += 1;
            }
        }

        for message in self.outstanding.values_mut() {
            let timed_out = match message.sent_at {
                Some(_) if message.direction != Direction::Publish => false,
                Some(sent_at) => !retry.is_zero() && now.duration_since(sent_at) >= retry,
                None => false,
            };

            if message.state != AckState::Queued && (message.pending || timed_out) {
                due.push(message);
            }
        }

        due.sort_by_key(|m| m.seq);
        due.into_iter()
            .map(|message| {
                if let Packet::Publish(publish) = &mut message.packet {
                    publish.dup = message.sent_at.is_some();
                }

                message.pending = false;
                message.sent_at = Some(now);
                message.packet.clone()
            })
            .collect()
    }

    /// Time until `misc` has something to do, capped at `max`
    pub fn next_timeout(&self, now: Instant, max: Duration) -> Duration {
        let mut deadlines = Vec::new();
        match self.status {
            ConnectionStatus::Connecting => {
                deadlines.push(self.connect_started + self.connection_timeout);
            }
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting => {
                if !self.keep_alive.is_zero() {
                    let last = match self.await_pingresp {
                        true => self.last_ping,
                        false => self.last_outgoing.min(self.last_incoming),
                    };

                    deadlines.push(last + self.keep_alive);
                }

                if !self.message_retry.is_zero() {
                    let oldest = self
                        .outstanding
                        .values()
                        .filter(|m| m.state != AckState::Queued && m.direction == Direction::Publish)
                        .filter_map(|m| m.sent_at)
                        .min();

                    if let Some(oldest) = oldest {
                        deadlines.push(oldest + self.message_retry);
                    }
                }
            }
            ConnectionStatus::Disconnected => {}
        }

        deadlines
            .into_iter()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(max, Duration::min)
    }

    /// Next free packet id. Ids wrap around at 16 bits, 0 is never used
    /// and ids that are still waiting for acks are skipped
    fn next_pkid(&mut self) -> Result<u16, StateError> {
        for _ in 0..u16::MAX {
            self.last_pkid = match self.last_pkid.wrapping_add(1) {
                0 => 1,
                pkid => pkid,
            };

            if !self.outstanding.contains_key(&self.last_pkid) {
                return Ok(self.last_pkid);
            }
        }

        Err(StateError::PacketIdsExhausted)
    }
}
