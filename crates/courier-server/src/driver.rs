//! Server driver.
//!
//! Ties together the lifecycle manager (sockets, sessions, heartbeats), the
//! delivery queue, the pub/sub fabric and the room and presence directory.
//! The driver performs no I/O: the runtime turns transport activity into
//! [`ServerEvent`]s and executes the returned [`ServerAction`]s, so the same
//! code runs under QUIC in production and under the simulation harness.
//!
//! Client mistakes never surface as errors from [`ServerDriver::process_event`];
//! they are answered with an error frame. An `Err` means the server could not
//! encode one of its own frames.

use std::{collections::BTreeSet, net::IpAddr, time::Duration};

use courier_core::{Environment, QueueError, QueueMessage, SessionError};
use courier_proto::{
    ErrorPayload, Frame, FrameHeader, MessageType, ModerationKind, Payload, PresenceStatus,
    Priority, ProtocolError, TargetType,
    payloads::{
        moderation::{ModerationAction, ModerationRequest},
        presence::{PresenceUpdate, TypingUpdate},
        queue::{Delivery, MessageAck, MessageFailed, QueueEnqueued, QueueSend},
        room::{MemberUpdate, RoomCreate, RoomJoined},
        session::{ConnectionEstablished, Goodbye, Heartbeat, Hello},
    },
};

use crate::{
    broker::{Broker, mailbox_key, presence_key},
    config::CourierConfig,
    directory::{Directory, DirectoryEvent, RoomRecord},
    error::DriverError,
    fabric::{Channel, Fabric, FabricEvent, FabricMessage, Inbound, PublishOptions},
    lifecycle::{Detached, Established, LifecycleEvent, LifecycleManager},
    metrics::{LaneDepths, MetricsSnapshot},
    queue::{AckOutcome, DeliveryQueue, Dispatch, FailureNotice, Recipients},
};

/// Events that the server driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique socket ID assigned by the runtime
        socket_id: u64,
        /// Peer address, for admission limits
        addr: IpAddr,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Socket that sent the frame
        socket_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Socket that was closed
        socket_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Heartbeats, timers, fabric health and housekeeping
    Tick,

    /// One delivery batch and a fabric poll
    QueueTick,
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send a frame to a specific socket
    SendToSocket {
        /// Target socket
        socket_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Close a connection
    CloseConnection {
        /// Socket to close
        socket_id: u64,
        /// Reason for closing
        reason: String,
    },

    /// Reconnection probes ran out; the session is gone
    SessionFailed {
        /// Socket the session was bound to
        socket_id: u64,
        /// Destroyed session
        session_id: String,
        /// Its owner
        user_id: String,
    },

    /// Log a message
    Log {
        /// Severity
        level: LogLevel,
        /// Text
        message: String,
    },
}

/// Log level for server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level message
    Debug,
    /// Informational message
    Info,
    /// Warning message
    Warn,
    /// Error message
    Error,
}

/// Actions collected while handling one event.
#[derive(Debug, Default)]
struct Outbox {
    actions: Vec<ServerAction>,
}

impl Outbox {
    fn push(&mut self, action: ServerAction) {
        self.actions.push(action);
    }

    fn frame(&mut self, socket_id: u64, frame: Frame) {
        self.push(ServerAction::SendToSocket { socket_id, frame });
    }

    fn send(&mut self, socket_id: u64, payload: Payload) -> Result<(), ProtocolError> {
        let frame = payload.to_frame()?;
        self.frame(socket_id, frame);
        Ok(())
    }

    /// Answer a client frame, echoing its request id.
    fn reply(
        &mut self,
        socket_id: u64,
        request_id: u32,
        payload: Payload,
    ) -> Result<(), ProtocolError> {
        let mut header = FrameHeader::new(payload.opcode());
        header.set_request_id(request_id);
        let frame = payload.into_frame(header)?;
        self.frame(socket_id, frame);
        Ok(())
    }

    /// Send one payload to many sockets, encoding it once.
    fn fanout(&mut self, sockets: Vec<u64>, payload: Payload) -> Result<usize, ProtocolError> {
        if sockets.is_empty() {
            return Ok(0);
        }
        let frame = payload.to_frame()?;
        let count = sockets.len();
        for socket_id in sockets {
            self.frame(socket_id, frame.clone());
        }
        Ok(count)
    }

    fn close(&mut self, socket_id: u64, reason: impl Into<String>) {
        self.push(ServerAction::CloseConnection { socket_id, reason: reason.into() });
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.push(ServerAction::Log { level, message: message.into() });
    }
}

/// Who a delivery reached on this instance.
#[derive(Debug, Default)]
struct LocalReach {
    sockets: usize,
    buffered: usize,
    /// User recipients with neither a socket nor a detached session here
    absent: Vec<String>,
}

/// Disjoint borrows of the driver, usable while the queue is mutably borrowed
/// by its processing tick.
struct Router<'a, E: Environment, B: Broker> {
    lifecycle: &'a mut LifecycleManager<E::Instant>,
    directory: &'a mut Directory<E::Instant>,
    fabric: &'a mut Fabric<E, B>,
    broker: &'a B,
    config: &'a CourierConfig,
    now_ms: u64,
}

impl<E: Environment, B: Broker> Router<'_, E, B> {
    /// Deliver a dequeued message: local sockets first, then the fabric for
    /// every other instance.
    fn dispatch(&mut self, message: &QueueMessage, out: &mut Outbox) -> Result<Dispatch, QueueError> {
        let target_type = message.routing.target_type;
        let channel = Channel::for_message(message.message_type, target_type);
        let ttl = message
            .metadata
            .expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(self.now_ms)));
        let options = PublishOptions { priority: message.priority, ttl, ..PublishOptions::default() };

        let delivery = message.to_delivery();
        let fanouts: Vec<(Vec<String>, Delivery)> = if target_type == TargetType::Room {
            message
                .routing
                .to
                .iter()
                .map(|room_id| {
                    let mut delivery = delivery.clone();
                    delivery.room_id = Some(room_id.clone());
                    (vec![room_id.clone()], delivery)
                })
                .collect()
        } else {
            vec![(message.routing.to.clone(), delivery)]
        };

        let mut reached = 0;
        for (to, delivery) in fanouts {
            let reach = self
                .deliver_local(target_type, &to, &delivery, out)
                .map_err(|e| QueueError::Codec(e.to_string()))?;
            reached += reach.sockets + reach.buffered;
            for user in &reach.absent {
                self.park_offline(user, &delivery, out);
            }

            let envelope = FabricMessage::Deliver { target_type, to, delivery };
            if let Err(e) = self.fabric.publish(channel, &envelope, options) {
                out.log(LogLevel::Warn, format!("message {} not published: {e}", message.id));
            }
        }
        Ok(Dispatch { reached, recipients: self.recipients(message) })
    }

    /// Users who may acknowledge this attempt. Room and server members are
    /// taken as known right now, local or remote; the sender is never one.
    fn recipients(&self, message: &QueueMessage) -> Recipients {
        let routing = &message.routing;
        let mut users: BTreeSet<String> = match routing.target_type {
            TargetType::User => return Recipients::users(routing.to.iter().cloned()),
            TargetType::Global => return Recipients::Anyone,
            TargetType::Room => {
                routing.to.iter().flat_map(|id| self.directory.room_members(id)).collect()
            },
            TargetType::Server => {
                routing.to.iter().flat_map(|id| self.directory.server_members(id)).collect()
            },
        };
        users.remove(&routing.from);
        Recipients::Users(users)
    }

    /// Push a delivery to the matching sockets of this instance. User
    /// recipients without a socket get it buffered on their detached session.
    fn deliver_local(
        &mut self,
        target_type: TargetType,
        to: &[String],
        delivery: &Delivery,
        out: &mut Outbox,
    ) -> Result<LocalReach, ProtocolError> {
        let mut reach = LocalReach::default();
        let payload = Payload::MessageDeliver(delivery.clone());

        match target_type {
            TargetType::User => {
                let frame = payload.to_frame()?;
                let users: BTreeSet<&String> = to.iter().collect();
                for user in users {
                    let sockets = self.lifecycle.sockets_for_user(user);
                    if sockets.is_empty() {
                        let buffered = self.lifecycle.buffer_for_user(user, &frame);
                        if buffered == 0 {
                            reach.absent.push(user.clone());
                        }
                        reach.buffered += buffered;
                        continue;
                    }
                    reach.sockets += sockets.len();
                    for socket_id in sockets {
                        out.frame(socket_id, frame.clone());
                    }
                }
            },
            TargetType::Room => {
                for room_id in to {
                    reach.sockets += out.fanout(self.directory.room_sockets(room_id), payload.clone())?;
                    if delivery.message_type == MessageType::Chat {
                        self.directory.record_history(room_id, delivery.clone(), self.now_ms);
                    }
                }
            },
            TargetType::Server => {
                let sockets: BTreeSet<u64> =
                    to.iter().flat_map(|id| self.directory.server_sockets(id)).collect();
                reach.sockets += out.fanout(sockets.into_iter().collect(), payload)?;
            },
            TargetType::Global => {
                let sockets = self
                    .lifecycle
                    .socket_ids()
                    .into_iter()
                    .filter(|socket_id| self.lifecycle.identity(*socket_id).is_some())
                    .collect();
                reach.sockets += out.fanout(sockets, payload)?;
            },
        }
        Ok(reach)
    }

    /// Append to the recipient's offline mailbox unless a presence marker
    /// shows them connected to another instance.
    fn park_offline(&self, user: &str, delivery: &Delivery, out: &mut Outbox) {
        match self.broker.get(&presence_key(user), self.now_ms) {
            Ok(Some(_)) => return,
            Ok(None) => {},
            Err(e) => {
                out.log(LogLevel::Warn, format!("presence of {user} unknown, not parking: {e}"));
                return;
            },
        }

        let mut bytes = Vec::new();
        if let Err(e) = ciborium::into_writer(delivery, &mut bytes) {
            out.log(LogLevel::Error, format!("mailbox entry for {user} not encoded: {e}"));
            return;
        }
        let queue = &self.config.queue;
        let expires_at_ms = self.now_ms + queue.offline_mailbox_ttl_ms;
        match self.broker.push(&mailbox_key(user), &bytes, queue.offline_mailbox_len, Some(expires_at_ms))
        {
            Ok(waiting) => out.log(
                LogLevel::Debug,
                format!("message {} parked for {user}, {waiting} waiting", delivery.message_id),
            ),
            Err(e) => out.log(LogLevel::Warn, format!("mailbox of {user} unavailable: {e}")),
        }
    }
}

/// Server driver: the sans-IO core of one Courier instance.
pub struct ServerDriver<E: Environment, B: Broker> {
    env: E,
    broker: B,
    config: CourierConfig,
    lifecycle: LifecycleManager<E::Instant>,
    queue: DeliveryQueue<E::Instant>,
    fabric: Fabric<E, B>,
    directory: Directory<E::Instant>,
}

impl<E: Environment, B: Broker> ServerDriver<E, B> {
    /// Create a driver and subscribe it to every fabric channel.
    pub fn new(env: E, broker: B, config: CourierConfig) -> Self {
        let server_id = config.server.server_id.clone();
        let mut fabric =
            Fabric::new(env.clone(), broker.clone(), server_id.clone(), config.fabric.clone());
        fabric.subscribe_all();

        Self {
            lifecycle: LifecycleManager::new(config.lifecycle.clone()),
            queue: DeliveryQueue::new(server_id, config.queue.clone()),
            directory: Directory::new(config.directory.clone()),
            fabric,
            env,
            broker,
            config,
        }
    }

    /// Process an event and return the actions to execute.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        let mut out = Outbox::default();
        match event {
            ServerEvent::ConnectionAccepted { socket_id, addr } => {
                self.handle_accept(socket_id, addr, &mut out)?;
            },
            ServerEvent::FrameReceived { socket_id, frame } => {
                self.handle_frame(socket_id, &frame, &mut out)?;
            },
            ServerEvent::ConnectionClosed { socket_id, reason } => {
                self.handle_closed(socket_id, &reason, &mut out)?;
            },
            ServerEvent::Tick => self.handle_tick(&mut out)?,
            ServerEvent::QueueTick => self.handle_queue_tick(&mut out)?,
        }
        Ok(out.actions)
    }

    /// Reload unfinished guaranteed messages this instance persisted before a
    /// restart. Call once before serving traffic.
    pub fn recover(&mut self) -> Result<usize, DriverError> {
        let now_ms = self.env.wall_clock_ms();
        Ok(self.queue.recover(&self.broker, self.env.now(), now_ms)?)
    }

    /// Persist every session and say goodbye to every socket.
    ///
    /// Sessions stay restorable on any instance until `session_timeout`.
    pub fn shutdown(&mut self) -> Result<Vec<ServerAction>, DriverError> {
        let now_ms = self.env.wall_clock_ms();
        let mut out = Outbox::default();
        let persisted = self.lifecycle.persist_all(&self.broker, now_ms);

        let sockets = self.lifecycle.socket_ids();
        out.fanout(sockets.clone(), Payload::Goodbye(Goodbye { reason: "shutdown".to_string() }))?;
        for socket_id in sockets {
            out.close(socket_id, "server shutting down");
        }
        out.log(
            LogLevel::Info,
            format!(
                "shutdown: {persisted} sessions persisted, {} messages unfinished",
                self.queue.unfinished().count()
            ),
        );
        Ok(out.actions)
    }

    /// Point-in-time metrics.
    pub fn metrics(&mut self) -> MetricsSnapshot {
        let queue_breaker = self.queue.breaker_state(self.env.now());
        let presence = self.directory.presence();
        MetricsSnapshot {
            server_id: self.config.server.server_id.clone(),
            collected_at_ms: self.env.wall_clock_ms(),
            connections: self.lifecycle.connection_count(),
            users: self.lifecycle.user_count(),
            sessions: self.lifecycle.session_count(),
            detached_sessions: self.lifecycle.detached_count(),
            lane_depths: LaneDepths::from(self.queue.lane_depths()),
            in_flight: self.queue.in_flight(),
            retrying: self.queue.waiting(),
            dead_letters: self.queue.dead_letters().len(),
            dead_letters_purged: self.queue.dead_letters().purged(),
            queue_breaker,
            queue: self.queue.stats(),
            average_latency_ms: self.queue.average_latency_ms(),
            error_rate: self.queue.error_rate(),
            fabric_breaker: self.fabric.breaker_state(),
            fabric_offline: self.fabric.offline_len(),
            fabric: self.fabric.stats(),
            health: self.fabric.health(),
            rooms: self.directory.room_count(),
            memberships: self.directory.membership_count(),
            online_users: presence.online_count(),
            typing: presence.typing_count(),
        }
    }

    /// Instance id.
    pub fn server_id(&self) -> &str {
        &self.config.server.server_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Shared broker handle.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager<E::Instant> {
        &self.lifecycle
    }

    /// Delivery queue.
    pub fn queue(&self) -> &DeliveryQueue<E::Instant> {
        &self.queue
    }

    /// Room and presence directory.
    pub fn directory(&self) -> &Directory<E::Instant> {
        &self.directory
    }

    /// Pub/sub fabric.
    pub fn fabric(&self) -> &Fabric<E, B> {
        &self.fabric
    }

    /// Number of admitted sockets.
    pub fn connection_count(&self) -> usize {
        self.lifecycle.connection_count()
    }

    fn split(&mut self, now_ms: u64) -> (&mut DeliveryQueue<E::Instant>, Router<'_, E, B>) {
        let Self {
            ref broker,
            ref config,
            ref mut lifecycle,
            ref mut queue,
            ref mut fabric,
            ref mut directory,
            ..
        } = *self;
        (queue, Router { lifecycle, directory, fabric, broker, config, now_ms })
    }

    fn handle_accept(
        &mut self,
        socket_id: u64,
        addr: IpAddr,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        match self.lifecycle.admit(socket_id, addr, self.env.now()) {
            Ok(()) => out.log(LogLevel::Debug, format!("socket {socket_id} accepted from {addr}")),
            Err(e) => {
                out.send(socket_id, Payload::Error(e.to_payload()))?;
                out.close(socket_id, e.to_string());
                out.log(LogLevel::Warn, format!("socket {socket_id} from {addr} refused: {e}"));
            },
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_frame(
        &mut self,
        socket_id: u64,
        frame: &Frame,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        if !self.lifecycle.has_socket(socket_id) {
            out.log(LogLevel::Warn, format!("frame from unknown socket {socket_id}"));
            return Ok(());
        }

        let request_id = frame.header.request_id();
        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => {
                out.reply(socket_id, request_id, Payload::Error(ErrorPayload::protocol(e.to_string())))?;
                out.log(LogLevel::Debug, format!("undecodable frame on socket {socket_id}: {e}"));
                if self.lifecycle.identity(socket_id).is_none() {
                    self.lifecycle.release(socket_id);
                    out.close(socket_id, "undecodable frame before handshake");
                }
                return Ok(());
            },
        };

        let Some(user) = self.lifecycle.identity(socket_id).map(|i| i.user_id.clone()) else {
            if let Payload::Hello(hello) = payload {
                return self.handle_hello(socket_id, request_id, &hello, out);
            }
            let refusal = SessionError::HandshakeRequired(frame.header.opcode());
            out.reply(socket_id, request_id, Payload::Error(refusal.to_payload()))?;
            self.lifecycle.release(socket_id);
            out.close(socket_id, refusal.to_string());
            return Ok(());
        };

        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        self.lifecycle.touch(socket_id, now_ms);
        if let Some(status) = self.directory.touch_presence(&user, now) {
            self.announce_presence(&user, status, out)?;
        }

        match payload {
            Payload::Hello(hello) => self.handle_hello(socket_id, request_id, &hello, out)?,
            Payload::Goodbye(goodbye) => self.handle_goodbye(socket_id, goodbye, out)?,
            Payload::Ping(heartbeat) => {
                let pong = Heartbeat { timestamp_ms: heartbeat.timestamp_ms, latency_ms: None };
                out.reply(socket_id, request_id, Payload::Pong(pong))?;
            },
            Payload::Pong(_) => {
                if self.lifecycle.handle_pong(socket_id, &self.broker, now, now_ms) {
                    out.log(LogLevel::Info, format!("socket {socket_id} recovered"));
                }
                self.mark_present(&user, now_ms);
            },
            Payload::QueueSend(send) => self.handle_send(socket_id, request_id, user, send, out)?,
            Payload::MessageAck(ack) => self.handle_ack(socket_id, request_id, user, ack, out)?,
            Payload::RoomCreate(create) => {
                self.handle_room_create(socket_id, request_id, &user, create, out)?;
            },
            Payload::RoomJoin(join) => {
                let password = join.password.as_deref();
                self.join_room(socket_id, request_id, &user, &join.room_id, password, out)?;
            },
            Payload::RoomLeave(leave) => {
                self.handle_room_leave(socket_id, request_id, &user, &leave.room_id, out)?;
            },
            Payload::TypingStart(request) => {
                match self.directory.typing_start(&request.room_id, &user, now) {
                    Ok(true) => self.announce_typing(&request.room_id, &user, true, out)?,
                    Ok(false) => {},
                    Err(e) => {
                        out.reply(socket_id, request_id, Payload::RoomError(e.to_room_error("typing")))?;
                    },
                }
            },
            Payload::TypingStop(request) => {
                if self.directory.typing_stop(&request.room_id, &user) {
                    self.announce_typing(&request.room_id, &user, false, out)?;
                }
            },
            Payload::PresenceSet(set) => {
                if let Some(status) = self.directory.set_presence(&user, set.status, now) {
                    self.announce_presence(&user, status, out)?;
                }
                self.mark_present(&user, now_ms);
            },
            Payload::VoiceState(state) => match self.directory.voice_state(&user, state) {
                Ok(state) => {
                    let sockets = self.excluding_user(self.directory.room_sockets(&state.room_id), &user);
                    out.fanout(sockets, Payload::VoiceState(state.clone()))?;
                    self.publish(Channel::Presence, Priority::Normal, FabricMessage::Voice(state), out);
                },
                Err(e) => {
                    out.reply(socket_id, request_id, Payload::RoomError(e.to_room_error("voice")))?;
                },
            },
            Payload::Kick(request) => {
                self.handle_moderation(socket_id, request_id, &user, ModerationKind::Kick, request, out)?;
            },
            Payload::Mute(request) => {
                self.handle_moderation(socket_id, request_id, &user, ModerationKind::Mute, request, out)?;
            },
            Payload::Ban(request) => {
                self.handle_moderation(socket_id, request_id, &user, ModerationKind::Ban, request, out)?;
            },
            Payload::Unmute(request) => {
                self.handle_moderation(socket_id, request_id, &user, ModerationKind::Unmute, request, out)?;
            },
            Payload::Unban(request) => {
                self.handle_moderation(socket_id, request_id, &user, ModerationKind::Unban, request, out)?;
            },
            Payload::ConnectionEstablished(_)
            | Payload::QueueEnqueued(_)
            | Payload::QueueError(_)
            | Payload::MessageDeliver(_)
            | Payload::MessageFailed(_)
            | Payload::RoomJoined(_)
            | Payload::RoomError(_)
            | Payload::MemberUpdate(_)
            | Payload::TypingUpdate(_)
            | Payload::PresenceUpdate(_)
            | Payload::ModerationAction(_)
            | Payload::Error(_) => {
                let message = format!("unexpected opcode {:#06x}", frame.header.opcode());
                out.reply(socket_id, request_id, Payload::Error(ErrorPayload::protocol(message)))?;
            },
        }
        Ok(())
    }

    fn handle_hello(
        &mut self,
        socket_id: u64,
        request_id: u32,
        hello: &Hello,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        let fresh_id = self.env.new_id();

        let established =
            match self.lifecycle.establish(socket_id, hello, fresh_id, &self.broker, now, now_ms) {
                Ok(established) => established,
                Err(e) => {
                    out.reply(socket_id, request_id, Payload::Error(e.to_payload()))?;
                    if e.is_fatal() {
                        self.lifecycle.release(socket_id);
                        out.close(socket_id, e.to_string());
                    }
                    out.log(LogLevel::Warn, format!("handshake on socket {socket_id} refused: {e}"));
                    return Ok(());
                },
            };
        let Established { session, reconnection, superseded, pending } = established;
        let user = session.user_id.clone();

        let mut released = BTreeSet::new();
        if let Some(old) = superseded {
            released.extend(self.directory.release_socket(&user, old, now_ms));
            out.close(old, "session resumed on another connection");
        }

        let accepted = ConnectionEstablished {
            session_id: session.session_id.clone(),
            reconnection,
            heartbeat_interval_ms: self.config.lifecycle.heartbeat_interval_ms,
            server_id: self.config.server.server_id.clone(),
        };
        out.reply(socket_id, request_id, Payload::ConnectionEstablished(accepted))?;

        let mut rejoined = BTreeSet::new();
        for room_id in &session.rooms {
            self.load_room(room_id, now_ms);
            match self.directory.rejoin(room_id, &user, socket_id, now_ms) {
                Ok(joined) => {
                    if let Some(snapshot) = self.room_snapshot(room_id) {
                        out.send(socket_id, Payload::RoomJoined(snapshot))?;
                    }
                    if joined.newly_joined && !released.contains(room_id) {
                        self.announce_member(room_id, &user, true, out)?;
                    }
                    rejoined.insert(room_id.clone());
                },
                Err(e) => {
                    self.lifecycle.track_room(socket_id, room_id, false, &self.broker, now_ms);
                    out.log(
                        LogLevel::Info,
                        format!("session {} not restored into {room_id}: {e}", session.session_id),
                    );
                },
            }
        }
        for room_id in released.difference(&rejoined) {
            self.announce_member(room_id, &user, false, out)?;
        }

        for frame in pending {
            out.frame(socket_id, frame);
        }
        self.flush_mailbox(socket_id, &user, now_ms, out)?;

        if self.directory.presence().status(&user) == PresenceStatus::Offline
            && let Some(status) = self.directory.set_presence(&user, PresenceStatus::Online, now)
        {
            self.announce_presence(&user, status, out)?;
        }
        self.mark_present(&user, now_ms);

        out.log(
            LogLevel::Info,
            format!(
                "socket {socket_id} bound to session {} of {user} (reconnection: {reconnection})",
                session.session_id
            ),
        );
        Ok(())
    }

    fn handle_goodbye(
        &mut self,
        socket_id: u64,
        goodbye: Goodbye,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let detached = if goodbye.is_logout() {
            self.lifecycle.logout(socket_id, &self.broker)
        } else {
            self.lifecycle.disconnect(socket_id, &self.broker, self.env.now(), self.env.wall_clock_ms())
        };
        if let Some(detached) = detached {
            self.release_memberships(socket_id, &detached, out)?;
        }
        out.close(socket_id, goodbye.reason);
        Ok(())
    }

    fn handle_closed(
        &mut self,
        socket_id: u64,
        reason: &str,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        match self.lifecycle.disconnect(socket_id, &self.broker, now, now_ms) {
            Some(detached) => {
                self.release_memberships(socket_id, &detached, out)?;
                out.log(LogLevel::Debug, format!("socket {socket_id} closed: {reason}"));
            },
            None => self.lifecycle.release(socket_id),
        }
        Ok(())
    }

    /// Drop a departed socket from its rooms. The last socket of a user also
    /// takes their presence offline.
    fn release_memberships(
        &mut self,
        socket_id: u64,
        detached: &Detached,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        let user = detached.identity.user_id.as_str();
        let last_socket = detached.remaining_sockets == 0;

        let audience = if last_socket { self.directory.audience_of(user) } else { Vec::new() };
        for room_id in self.directory.release_socket(user, socket_id, now_ms) {
            self.announce_member(&room_id, user, false, out)?;
        }

        if last_socket && let Some(status) = self.directory.clear_presence(user, now) {
            let update = PresenceUpdate { user_id: user.to_string(), status };
            let sockets = audience.into_iter().filter(|s| *s != socket_id).collect();
            out.fanout(sockets, Payload::PresenceUpdate(update.clone()))?;
            self.publish(Channel::Presence, Priority::Normal, FabricMessage::Presence(update), out);
        }
        Ok(())
    }

    fn handle_send(
        &mut self,
        socket_id: u64,
        request_id: u32,
        user: String,
        send: QueueSend,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();

        if let Err(e) = self.queue.check_rate(&user, now) {
            out.reply(socket_id, request_id, Payload::QueueError(e.to_payload()))?;
            return Ok(());
        }

        if send.target_type == TargetType::Room {
            for room_id in &send.to {
                if self.directory.room(room_id).is_none() {
                    self.load_room(room_id, now_ms);
                }
                if let Err(e) = self.directory.can_send(room_id, &user) {
                    out.reply(socket_id, request_id, Payload::QueueError(e.to_payload()))?;
                    return Ok(());
                }
            }
        }

        let mut message = QueueMessage::from_send(
            self.env.new_id(),
            user,
            send,
            self.config.queue.delivery_defaults(),
            now_ms,
            &self.config.server.server_id,
        );
        if message.clamp(&self.config.queue.delivery_limits(), now_ms) {
            out.log(LogLevel::Debug, format!("send options of {} clamped", message.id));
        }
        let reply = match self.queue.enqueue(message, &self.broker, now, now_ms) {
            Ok(message_id) => Payload::QueueEnqueued(QueueEnqueued { message_id }),
            Err(e) => {
                out.log(LogLevel::Debug, format!("send on socket {socket_id} rejected: {e}"));
                Payload::QueueError(e.to_payload())
            },
        };
        out.reply(socket_id, request_id, reply)?;
        Ok(())
    }

    fn handle_ack(
        &mut self,
        socket_id: u64,
        request_id: u32,
        user: String,
        mut ack: MessageAck,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        ack.user_id = user;
        let outcome =
            self.queue.acknowledge(&ack, &self.broker, self.env.now(), self.env.wall_clock_ms());
        out.log(LogLevel::Debug, format!("ack {} from {}: {outcome:?}", ack.message_id, ack.user_id));
        match outcome {
            AckOutcome::NotRecipient => {
                let refusal = ErrorPayload::forbidden(format!(
                    "message {} was not sent to {}",
                    ack.message_id, ack.user_id
                ));
                out.reply(socket_id, request_id, Payload::Error(refusal))?;
                return Ok(());
            },
            AckOutcome::DeadLettered(notice) => self.notify_failure(notice, out)?,
            _ => {},
        }
        self.publish(Channel::Acks, Priority::Normal, FabricMessage::Ack(ack), out);
        Ok(())
    }

    fn handle_room_create(
        &mut self,
        socket_id: u64,
        request_id: u32,
        user: &str,
        create: RoomCreate,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now_ms = self.env.wall_clock_ms();
        let room_id = create.room_id.clone();

        // A room created on another instance is only known through the broker
        self.load_room(&room_id, now_ms);
        if let Err(e) = self.directory.create_room(user, create, now_ms).map(|_| ()) {
            out.reply(socket_id, request_id, Payload::RoomError(e.to_room_error("create")))?;
            return Ok(());
        }
        self.persist_room(&room_id, now_ms);
        out.log(LogLevel::Info, format!("{user} created room {room_id}"));

        self.join_room(socket_id, request_id, user, &room_id, None, out)
    }

    fn join_room(
        &mut self,
        socket_id: u64,
        request_id: u32,
        user: &str,
        room_id: &str,
        password: Option<&str>,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now_ms = self.env.wall_clock_ms();
        self.load_room(room_id, now_ms);

        let joined = match self.directory.join(room_id, user, socket_id, password, now_ms) {
            Ok(joined) => joined,
            Err(e) => {
                out.reply(socket_id, request_id, Payload::RoomError(e.to_room_error("join")))?;
                return Ok(());
            },
        };
        self.lifecycle.track_room(socket_id, room_id, true, &self.broker, now_ms);

        if let Some(snapshot) = self.room_snapshot(room_id) {
            out.reply(socket_id, request_id, Payload::RoomJoined(snapshot))?;
        }
        if joined.newly_joined {
            self.announce_member(room_id, user, true, out)?;
        }
        Ok(())
    }

    fn handle_room_leave(
        &mut self,
        socket_id: u64,
        request_id: u32,
        user: &str,
        room_id: &str,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now_ms = self.env.wall_clock_ms();
        match self.directory.leave(room_id, user, socket_id, now_ms) {
            Ok(left) => {
                self.lifecycle.track_room(socket_id, room_id, false, &self.broker, now_ms);
                let update = MemberUpdate {
                    room_id: room_id.to_string(),
                    user_id: user.to_string(),
                    joined: false,
                };
                out.reply(socket_id, request_id, Payload::MemberUpdate(update))?;
                if left {
                    self.announce_member(room_id, user, false, out)?;
                }
            },
            Err(e) => {
                out.reply(socket_id, request_id, Payload::RoomError(e.to_room_error("leave")))?;
            },
        }
        Ok(())
    }

    fn handle_moderation(
        &mut self,
        socket_id: u64,
        request_id: u32,
        actor: &str,
        kind: ModerationKind,
        request: ModerationRequest,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        self.load_room(&request.room_id, now_ms);

        let moderated = match self.directory.moderate(actor, kind, request, now) {
            Ok(moderated) => moderated,
            Err(e) => {
                let error = e.to_room_error(kind.as_str());
                out.reply(socket_id, request_id, Payload::RoomError(error))?;
                return Ok(());
            },
        };

        let mut touched: BTreeSet<&str> =
            moderated.evicted.iter().map(|(room_id, _)| room_id.as_str()).collect();
        touched.insert(moderated.action.room_id.as_str());
        for room_id in touched {
            self.persist_room(room_id, now_ms);
        }

        self.notify_moderation(&moderated.action, &moderated.evicted, Some(socket_id), out)?;
        out.log(
            LogLevel::Info,
            format!(
                "{actor} applied {} to {} in {}",
                kind.as_str(),
                moderated.action.target_user_id,
                moderated.action.room_id
            ),
        );
        self.publish(Channel::Moderation, Priority::High, FabricMessage::Moderation(moderated.action), out);
        Ok(())
    }

    /// Tell the room, the evicted sockets and the moderator about an action.
    fn notify_moderation(
        &mut self,
        action: &ModerationAction,
        evicted: &[(String, u64)],
        moderator: Option<u64>,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let now_ms = self.env.wall_clock_ms();
        let mut recipients: BTreeSet<u64> =
            self.directory.room_sockets(&action.room_id).into_iter().collect();
        recipients.extend(moderator);
        for (room_id, socket_id) in evicted {
            self.lifecycle.track_room(*socket_id, room_id, false, &self.broker, now_ms);
            recipients.insert(*socket_id);
        }
        out.fanout(recipients.into_iter().collect(), Payload::ModerationAction(action.clone()))?;
        Ok(())
    }

    fn handle_tick(&mut self, out: &mut Outbox) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();
        let ping = || Payload::Ping(Heartbeat { timestamp_ms: now_ms, latency_ms: None });

        for event in self.lifecycle.tick(&self.env, &self.broker) {
            match event {
                LifecycleEvent::Ping { socket_id } => out.send(socket_id, ping())?,
                LifecycleEvent::Reconnecting { socket_id, attempt } => {
                    out.send(socket_id, ping())?;
                    out.log(LogLevel::Debug, format!("socket {socket_id} unresponsive, probe {attempt}"));
                },
                LifecycleEvent::Degraded { socket_id, level } => {
                    out.log(LogLevel::Debug, format!("socket {socket_id} degradation now {level:?}"));
                },
                LifecycleEvent::Failed { socket_id, identity, attempts } => {
                    let failure =
                        SessionError::Failed { session_id: identity.session_id.clone(), attempts };
                    out.send(socket_id, Payload::Error(failure.to_payload()))?;

                    let remaining_sockets = self.lifecycle.sockets_for_user(&identity.user_id).len();
                    let detached = Detached { identity, remaining_sockets };
                    self.release_memberships(socket_id, &detached, out)?;

                    let Detached { identity, .. } = detached;
                    out.log(LogLevel::Warn, format!("session {} failed: {failure}", identity.session_id));
                    out.push(ServerAction::SessionFailed {
                        socket_id,
                        session_id: identity.session_id,
                        user_id: identity.user_id,
                    });
                    out.close(socket_id, "session failed");
                },
                LifecycleEvent::Evicted { session_id, user_id } => {
                    out.log(LogLevel::Debug, format!("session {session_id} of {user_id} evicted"));
                },
            }
        }

        for event in self.directory.tick(now) {
            match event {
                DirectoryEvent::TypingExpired { room_id, user_id } => {
                    self.announce_typing(&room_id, &user_id, false, out)?;
                },
                DirectoryEvent::MuteExpired { room_id, user_id } => {
                    self.persist_room(&room_id, now_ms);
                    out.log(LogLevel::Info, format!("mute of {user_id} in {room_id} expired"));
                },
                DirectoryEvent::PresenceOffline { user_id } => {
                    self.announce_presence(&user_id, PresenceStatus::Offline, out)?;
                },
            }
        }

        for event in self.fabric.tick() {
            match event {
                FabricEvent::LinkLost { reason } => {
                    out.log(LogLevel::Warn, format!("broker link lost: {reason}"));
                },
                FabricEvent::Reconnected { resubscribed, drained, expired } => out.log(
                    LogLevel::Info,
                    format!(
                        "broker link restored: {resubscribed} patterns, {drained} drained, {expired} expired"
                    ),
                ),
                FabricEvent::HealthChanged(health) => {
                    out.log(LogLevel::Info, format!("fabric health now {health:?}"));
                },
            }
        }

        let swept = self.directory.sweep_rooms(now_ms);
        if !swept.is_empty() {
            out.log(LogLevel::Debug, format!("swept {} idle rooms", swept.len()));
        }
        self.lifecycle.prune(now);
        self.queue.prune(now);
        Ok(())
    }

    fn handle_queue_tick(&mut self, out: &mut Outbox) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();

        let report = {
            let (queue, mut router) = self.split(now_ms);
            let broker = router.broker;
            queue.process_tick(now, now_ms, broker, |message| router.dispatch(message, out))
        };

        for notice in report.failed {
            self.notify_failure(notice, out)?;
        }
        if let Some(e) = report.error {
            out.log(LogLevel::Error, format!("queue tick ended early: {e}"));
        }

        for inbound in self.fabric.poll() {
            self.apply_inbound(inbound, out)?;
        }
        Ok(())
    }

    /// Tell the sender's local sockets a message will not be delivered.
    fn notify_failure(&self, notice: FailureNotice, out: &mut Outbox) -> Result<(), DriverError> {
        out.log(
            LogLevel::Warn,
            format!(
                "message {} from {} abandoned after {} attempts: {}",
                notice.message_id, notice.from, notice.attempts, notice.reason
            ),
        );
        let failed = MessageFailed {
            message_id: notice.message_id,
            reason: notice.reason,
            attempts: notice.attempts,
        };
        out.fanout(self.lifecycle.sockets_for_user(&notice.from), Payload::MessageFailed(failed))?;
        Ok(())
    }

    /// Apply a message published by another instance.
    fn apply_inbound(&mut self, inbound: Inbound, out: &mut Outbox) -> Result<(), DriverError> {
        let now = self.env.now();
        let now_ms = self.env.wall_clock_ms();

        match inbound.message {
            FabricMessage::Deliver { target_type, to, delivery } => {
                let (_, mut router) = self.split(now_ms);
                router.deliver_local(target_type, &to, &delivery, out)?;
            },
            FabricMessage::Ack(ack) => {
                let outcome = self.queue.acknowledge(&ack, &self.broker, now, now_ms);
                if outcome != AckOutcome::Unknown {
                    out.log(
                        LogLevel::Debug,
                        format!("ack {} relayed by {}: {outcome:?}", ack.message_id, inbound.origin),
                    );
                }
                if let AckOutcome::DeadLettered(notice) = outcome {
                    self.notify_failure(notice, out)?;
                }
            },
            FabricMessage::Member(update) => {
                self.directory.apply_remote_member(&update);
                let sockets = self.excluding_user(self.directory.room_sockets(&update.room_id), &update.user_id);
                out.fanout(sockets, Payload::MemberUpdate(update))?;
            },
            FabricMessage::Typing(update) => {
                let sockets = self.excluding_user(self.directory.room_sockets(&update.room_id), &update.user_id);
                out.fanout(sockets, Payload::TypingUpdate(update))?;
            },
            FabricMessage::Presence(update) => {
                let sockets = self.excluding_user(self.directory.audience_of(&update.user_id), &update.user_id);
                out.fanout(sockets, Payload::PresenceUpdate(update))?;
            },
            FabricMessage::Voice(state) => {
                let sockets = self.directory.room_sockets(&state.room_id);
                out.fanout(sockets, Payload::VoiceState(state))?;
            },
            FabricMessage::Moderation(action) => {
                let evicted = self.directory.apply_moderation(&action, now);
                self.notify_moderation(&action, &evicted, None, out)?;
            },
        }
        Ok(())
    }

    fn announce_member(
        &mut self,
        room_id: &str,
        user: &str,
        joined: bool,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let update = MemberUpdate { room_id: room_id.to_string(), user_id: user.to_string(), joined };
        let sockets = self.excluding_user(self.directory.room_sockets(room_id), user);
        out.fanout(sockets, Payload::MemberUpdate(update.clone()))?;
        self.publish(Channel::Rooms, Priority::Normal, FabricMessage::Member(update), out);
        Ok(())
    }

    fn announce_typing(
        &mut self,
        room_id: &str,
        user: &str,
        typing: bool,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let update = TypingUpdate { room_id: room_id.to_string(), user_id: user.to_string(), typing };
        let sockets = self.excluding_user(self.directory.room_sockets(room_id), user);
        out.fanout(sockets, Payload::TypingUpdate(update.clone()))?;
        self.publish(Channel::Presence, Priority::Low, FabricMessage::Typing(update), out);
        Ok(())
    }

    fn announce_presence(
        &mut self,
        user: &str,
        status: PresenceStatus,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let update = PresenceUpdate { user_id: user.to_string(), status };
        let sockets = self.excluding_user(self.directory.audience_of(user), user);
        out.fanout(sockets, Payload::PresenceUpdate(update.clone()))?;
        self.publish(Channel::Presence, Priority::Normal, FabricMessage::Presence(update), out);
        Ok(())
    }

    fn excluding_user(&self, sockets: Vec<u64>, user: &str) -> Vec<u64> {
        let own = self.lifecycle.sockets_for_user(user);
        sockets.into_iter().filter(|socket_id| !own.contains(socket_id)).collect()
    }

    fn publish(
        &mut self,
        channel: Channel,
        priority: Priority,
        message: FabricMessage,
        out: &mut Outbox,
    ) {
        let options = PublishOptions { priority, ..PublishOptions::default() };
        if let Err(e) = self.fabric.publish(channel, &message, options) {
            out.log(
                LogLevel::Warn,
                format!("{} not published on {}: {e}", message.kind(), channel.name(priority)),
            );
        }
    }

    fn room_snapshot(&self, room_id: &str) -> Option<RoomJoined> {
        self.directory.room(room_id).map(|room| RoomJoined {
            room: room.info(),
            members: room.member_infos(),
            recent_messages: room.history.iter().cloned().collect(),
        })
    }

    /// Refresh the local copy of a room from the shared record, if any.
    fn load_room(&mut self, room_id: &str, now_ms: u64) {
        match self.broker.get(&RoomRecord::key(room_id), now_ms) {
            Ok(Some(bytes)) => match RoomRecord::from_bytes(&bytes) {
                Ok(record) => self.directory.sync_record(record),
                Err(e) => tracing::warn!(room_id, error = %e, "unreadable room record"),
            },
            Ok(None) => {},
            Err(e) => tracing::warn!(room_id, error = %e, "room lookup failed, using local copy"),
        }
    }

    fn persist_room(&self, room_id: &str, now_ms: u64) {
        let Some(record) = self.directory.record(room_id) else {
            return;
        };
        let bytes = match record.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(room_id, error = %e, "room record not encoded");
                return;
            },
        };
        let expires_at_ms = now_ms + self.config.directory.room_ttl_ms;
        if let Err(e) = self.broker.set(&RoomRecord::key(room_id), &bytes, Some(expires_at_ms)) {
            tracing::warn!(room_id, error = %e, "room record not persisted");
        }
    }

    /// Write the presence marker other instances consult before parking
    /// messages offline.
    fn mark_present(&self, user: &str, now_ms: u64) {
        let status = self.directory.presence().status(user);
        let mut bytes = Vec::new();
        if let Err(e) = ciborium::into_writer(&status, &mut bytes) {
            tracing::error!(user_id = user, error = %e, "presence marker not encoded");
            return;
        }
        let expires_at_ms = now_ms + self.config.directory.presence_timeout_ms;
        if let Err(e) = self.broker.set(&presence_key(user), &bytes, Some(expires_at_ms)) {
            tracing::warn!(user_id = user, error = %e, "presence marker not written");
        }
    }

    fn flush_mailbox(
        &self,
        socket_id: u64,
        user: &str,
        now_ms: u64,
        out: &mut Outbox,
    ) -> Result<(), DriverError> {
        let parked = match self.broker.drain(&mailbox_key(user), now_ms) {
            Ok(parked) => parked,
            Err(e) => {
                out.log(LogLevel::Warn, format!("mailbox of {user} unavailable: {e}"));
                return Ok(());
            },
        };
        if parked.is_empty() {
            return Ok(());
        }

        let count = parked.len();
        for bytes in parked {
            match ciborium::from_reader::<Delivery, _>(bytes.as_slice()) {
                Ok(delivery) => out.send(socket_id, Payload::MessageDeliver(delivery))?,
                Err(e) => out.log(LogLevel::Warn, format!("unreadable mailbox entry for {user}: {e}")),
            }
        }
        out.log(LogLevel::Debug, format!("{count} parked messages flushed to socket {socket_id}"));
        Ok(())
    }
}
