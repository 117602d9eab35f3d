//! Multi-instance simulation.
//!
//! [`SimCluster`] runs several [`ServerDriver`]s against one shared broker
//! and one [`SimEnv`], and plays the runtime's part: it assigns socket ids,
//! feeds events in, and executes the resulting actions against in-memory
//! client inboxes. Nothing happens unless a test asks for it, so every
//! interleaving is explicit and reproducible.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    net::{IpAddr, Ipv4Addr},
};

use courier_proto::{ErrorPayload, Frame, Payload, ProtocolError, payloads::queue::Delivery};
use courier_server::{
    Broker, CourierConfig, DriverError, LogLevel, MemoryBroker, MetricsSnapshot, ServerAction,
    ServerDriver, ServerEvent,
};
use thiserror::Error;

use crate::{
    SimEnv, client,
    invariants::{ClusterSnapshot, InstanceSnapshot, Limits, SocketSnapshot},
};

/// Quiet queue rounds required before [`SimCluster::settle`] stops. Two,
/// because a message published late in one round is only polled by earlier
/// instances in the next.
const QUIET_ROUNDS: usize = 2;

/// Upper bound on settle rounds.
const MAX_SETTLE_ROUNDS: usize = 64;

/// Errors from driving the simulation.
#[derive(Error, Debug)]
pub enum SimError {
    /// The driver failed to process an event
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A payload could not be framed
    #[error("frame error: {0}")]
    Frame(#[from] ProtocolError),

    /// Socket id not issued by this cluster
    #[error("unknown socket {0}")]
    UnknownSocket(u64),

    /// The instance crashed or was shut down
    #[error("instance {0} is down")]
    InstanceDown(usize),

    /// The server closed the socket
    #[error("socket {socket_id} closed: {reason}")]
    Closed {
        /// Socket
        socket_id: u64,
        /// Close reason given by the server
        reason: String,
    },
}

/// Client-side view of one simulated connection.
#[derive(Debug, Clone)]
pub struct SimSocket {
    /// Instance the socket is connected to
    pub instance: usize,
    /// User named in the last handshake
    pub user_id: Option<String>,
    /// Session granted by the server
    pub session_id: Option<String>,
    /// Every payload received, oldest first
    pub inbox: Vec<Payload>,
    /// Close reason, once closed
    pub closed: Option<String>,
    /// Frames the server addressed to this socket after closing it
    pub frames_after_close: usize,
}

impl SimSocket {
    /// Whether the socket is still open.
    pub fn is_open(&self) -> bool {
        self.closed.is_none()
    }
}

/// A cluster of simulated Courier instances.
pub struct SimCluster<B: Broker = MemoryBroker> {
    env: SimEnv,
    broker: B,
    configs: Vec<CourierConfig>,
    instances: Vec<Option<ServerDriver<SimEnv, B>>>,
    sockets: BTreeMap<u64, SimSocket>,
    failed_sessions: Vec<String>,
    next_socket: u64,
}

impl SimCluster<MemoryBroker> {
    /// `instances` servers with default configuration.
    pub fn new(seed: u64, instances: usize) -> Self {
        Self::with_config(seed, instances, CourierConfig::default())
    }

    /// `instances` servers sharing `config`; each gets its own server id.
    pub fn with_config(seed: u64, instances: usize, config: CourierConfig) -> Self {
        Self::with_broker(SimEnv::with_seed(seed), MemoryBroker::new(), instances, config)
    }
}

impl<B: Broker> SimCluster<B> {
    /// Cluster over an explicit environment and broker.
    pub fn with_broker(env: SimEnv, broker: B, instances: usize, config: CourierConfig) -> Self {
        let configs: Vec<CourierConfig> = (0..instances)
            .map(|i| {
                let mut config = config.clone();
                config.server.server_id = format!("courier-{}", i + 1);
                config
            })
            .collect();
        let instances = configs
            .iter()
            .map(|config| Some(ServerDriver::new(env.clone(), broker.clone(), config.clone())))
            .collect();

        Self {
            env,
            broker,
            configs,
            instances,
            sockets: BTreeMap::new(),
            failed_sessions: Vec::new(),
            next_socket: 1,
        }
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared broker.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Number of instances, live or not.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the cluster has no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Driver of a live instance.
    pub fn driver(&self, instance: usize) -> Option<&ServerDriver<SimEnv, B>> {
        self.instances.get(instance).and_then(Option::as_ref)
    }

    /// Metrics of a live instance.
    pub fn metrics(&mut self, instance: usize) -> Option<MetricsSnapshot> {
        self.instances.get_mut(instance).and_then(Option::as_mut).map(ServerDriver::metrics)
    }

    /// Open a transport connection to `instance` without a handshake.
    ///
    /// Every socket gets its own address so per-address limits only apply
    /// when a test asks for them through [`SimCluster::open_from`].
    pub fn open(&mut self, instance: usize) -> Result<u64, SimError> {
        let addr = IpAddr::V4(Ipv4Addr::from(0x0A00_0000 | (self.next_socket as u32 & 0x00FF_FFFF)));
        self.open_from(instance, addr)
    }

    /// Open a connection from a specific address.
    pub fn open_from(&mut self, instance: usize, addr: IpAddr) -> Result<u64, SimError> {
        if self.driver(instance).is_none() {
            return Err(SimError::InstanceDown(instance));
        }
        let socket_id = self.next_socket;
        self.next_socket += 1;
        self.sockets.insert(
            socket_id,
            SimSocket {
                instance,
                user_id: None,
                session_id: None,
                inbox: Vec::new(),
                closed: None,
                frames_after_close: 0,
            },
        );
        self.run(instance, ServerEvent::ConnectionAccepted { socket_id, addr })?;
        Ok(socket_id)
    }

    /// Open a connection and complete a fresh handshake as `user`.
    pub fn connect(&mut self, instance: usize, user: &str) -> Result<u64, SimError> {
        let socket_id = self.open(instance)?;
        self.handshake(socket_id, user, None)?;
        Ok(socket_id)
    }

    /// Open a connection and resume `session_id`.
    pub fn resume(&mut self, instance: usize, user: &str, session_id: &str) -> Result<u64, SimError> {
        let socket_id = self.open(instance)?;
        self.handshake(socket_id, user, Some(session_id))?;
        Ok(socket_id)
    }

    fn handshake(
        &mut self,
        socket_id: u64,
        user: &str,
        session_id: Option<&str>,
    ) -> Result<(), SimError> {
        if let Some(socket) = self.sockets.get_mut(&socket_id) {
            socket.user_id = Some(user.to_string());
        }
        self.send(socket_id, client::hello(user, session_id))?;
        self.ensure_open(socket_id)
    }

    /// Deliver a payload from the client on `socket_id`.
    pub fn send(&mut self, socket_id: u64, payload: Payload) -> Result<(), SimError> {
        self.send_frame(socket_id, payload.to_frame()?)
    }

    /// Deliver a raw frame from the client on `socket_id`.
    pub fn send_frame(&mut self, socket_id: u64, frame: Frame) -> Result<(), SimError> {
        self.ensure_open(socket_id)?;
        let instance = self.socket(socket_id)?.instance;
        self.run(instance, ServerEvent::FrameReceived { socket_id, frame })
    }

    /// Drop the connection from the client side.
    pub fn disconnect(&mut self, socket_id: u64) -> Result<(), SimError> {
        self.ensure_open(socket_id)?;
        let instance = self.socket(socket_id)?.instance;
        let reason = "client disconnected".to_string();
        if let Some(socket) = self.sockets.get_mut(&socket_id) {
            socket.closed = Some(reason.clone());
        }
        self.run(instance, ServerEvent::ConnectionClosed { socket_id, reason })
    }

    /// One heartbeat tick on every live instance.
    pub fn tick(&mut self) -> Result<(), SimError> {
        self.each_live(|| ServerEvent::Tick)
    }

    /// One queue tick on every live instance.
    pub fn queue_tick(&mut self) -> Result<(), SimError> {
        self.each_live(|| ServerEvent::QueueTick)
    }

    /// Run queue ticks until the lanes are empty and the fabric is quiet.
    pub fn settle(&mut self) -> Result<(), SimError> {
        let mut quiet = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let before = self.received_total();
            self.queue_tick()?;
            let idle = self.received_total() == before
                && self.instances.iter().flatten().all(|d| d.queue().queued() == 0);
            quiet = if idle { quiet + 1 } else { 0 };
            if quiet >= QUIET_ROUNDS {
                break;
            }
        }
        Ok(())
    }

    /// Move virtual time forward, then tick and settle.
    pub fn advance_ms(&mut self, ms: u64) -> Result<(), SimError> {
        self.env.advance_ms(ms);
        self.tick()?;
        self.settle()
    }

    /// Kill an instance without shutdown. Its clients see their sockets
    /// closed; nothing it held in memory survives.
    pub fn crash(&mut self, instance: usize) {
        if let Some(slot) = self.instances.get_mut(instance) {
            *slot = None;
        }
        for socket in self.sockets.values_mut().filter(|s| s.instance == instance && s.is_open()) {
            socket.closed = Some("instance crashed".to_string());
        }
    }

    /// Start an instance again and recover its durable messages. A live
    /// instance is crashed first. Returns how many messages were recovered.
    pub fn restart(&mut self, instance: usize) -> Result<usize, SimError> {
        let config = self.configs.get(instance).cloned().ok_or(SimError::InstanceDown(instance))?;
        self.crash(instance);
        let mut driver = ServerDriver::new(self.env.clone(), self.broker.clone(), config);
        let recovered = driver.recover()?;
        self.instances[instance] = Some(driver);
        Ok(recovered)
    }

    /// Graceful shutdown: sessions are persisted and clients told goodbye.
    pub fn shutdown(&mut self, instance: usize) -> Result<(), SimError> {
        let driver = self
            .instances
            .get_mut(instance)
            .and_then(Option::as_mut)
            .ok_or(SimError::InstanceDown(instance))?;
        let actions = driver.shutdown()?;
        self.route(actions);
        self.instances[instance] = None;
        Ok(())
    }

    /// Client-side state of a socket.
    pub fn socket(&self, socket_id: u64) -> Result<&SimSocket, SimError> {
        self.sockets.get(&socket_id).ok_or(SimError::UnknownSocket(socket_id))
    }

    /// Session granted on `socket_id`.
    pub fn session_id(&self, socket_id: u64) -> Option<&str> {
        self.sockets.get(&socket_id).and_then(|s| s.session_id.as_deref())
    }

    /// Whether the socket is still open.
    pub fn is_open(&self, socket_id: u64) -> bool {
        self.sockets.get(&socket_id).is_some_and(SimSocket::is_open)
    }

    /// Everything received on `socket_id` so far.
    pub fn inbox(&self, socket_id: u64) -> &[Payload] {
        self.sockets.get(&socket_id).map_or(&[], |s| s.inbox.as_slice())
    }

    /// Take everything received on `socket_id` so far.
    pub fn take_inbox(&mut self, socket_id: u64) -> Vec<Payload> {
        self.sockets.get_mut(&socket_id).map(|s| std::mem::take(&mut s.inbox)).unwrap_or_default()
    }

    /// Messages delivered to `socket_id`, oldest first.
    pub fn deliveries(&self, socket_id: u64) -> Vec<Delivery> {
        self.inbox(socket_id)
            .iter()
            .filter_map(|p| match p {
                Payload::MessageDeliver(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Text of every chat delivered to `socket_id`.
    pub fn delivered_texts(&self, socket_id: u64) -> Vec<String> {
        self.deliveries(socket_id)
            .into_iter()
            .map(|d| String::from_utf8_lossy(&d.payload).into_owned())
            .collect()
    }

    /// Errors (including queue and room errors) received on `socket_id`.
    pub fn errors(&self, socket_id: u64) -> Vec<ErrorPayload> {
        self.inbox(socket_id)
            .iter()
            .filter_map(|p| match p {
                Payload::Error(e) | Payload::QueueError(e) => Some(e.clone()),
                Payload::RoomError(e) => {
                    Some(ErrorPayload::new(e.code, format!("{}: {}", e.action, e.reason)))
                },
                _ => None,
            })
            .collect()
    }

    /// Sessions reported failed so far.
    pub fn failed_sessions(&self) -> &[String] {
        &self.failed_sessions
    }

    /// Observable state for invariant checks.
    pub fn snapshot(&mut self) -> ClusterSnapshot {
        let users: BTreeSet<String> =
            self.sockets.values().filter_map(|s| s.user_id.clone()).collect();

        let mut instances = Vec::new();
        for (index, slot) in self.instances.iter_mut().enumerate() {
            let Some(driver) = slot.as_mut() else {
                continue;
            };
            let config = &self.configs[index];
            let limits = Limits {
                max_connections: config.lifecycle.max_connections,
                max_per_user: config.lifecycle.max_per_user,
                dead_letter_capacity: config.queue.dead_letter_capacity,
            };
            let user_sockets = users
                .iter()
                .map(|u| (u.clone(), driver.lifecycle().sockets_for_user(u).len()))
                .filter(|(_, n)| *n > 0)
                .collect();
            let bound_sessions = self
                .sockets
                .iter()
                .filter(|(_, s)| s.instance == index && s.is_open())
                .filter_map(|(id, _)| {
                    driver.lifecycle().session_for_socket(*id).map(|s| (*id, s.session_id.clone()))
                })
                .collect();
            instances.push(InstanceSnapshot {
                index,
                metrics: driver.metrics(),
                limits,
                user_sockets,
                bound_sessions,
            });
        }

        let sockets = self
            .sockets
            .iter()
            .map(|(id, s)| SocketSnapshot {
                socket_id: *id,
                instance: s.instance,
                instance_live: self.instances.get(s.instance).is_some_and(Option::is_some),
                open: s.is_open(),
                frames_after_close: s.frames_after_close,
            })
            .collect();

        ClusterSnapshot { instances, sockets }
    }

    fn ensure_open(&self, socket_id: u64) -> Result<(), SimError> {
        match &self.socket(socket_id)?.closed {
            Some(reason) => Err(SimError::Closed { socket_id, reason: reason.clone() }),
            None => Ok(()),
        }
    }

    fn each_live(&mut self, event: impl Fn() -> ServerEvent) -> Result<(), SimError> {
        for instance in 0..self.instances.len() {
            if self.instances[instance].is_some() {
                self.run(instance, event())?;
            }
        }
        Ok(())
    }

    fn received_total(&self) -> usize {
        self.sockets.values().map(|s| s.inbox.len()).sum()
    }

    /// Process `event` and every close it causes, as the runtime would.
    fn run(&mut self, instance: usize, event: ServerEvent) -> Result<(), SimError> {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let driver = self
                .instances
                .get_mut(instance)
                .and_then(Option::as_mut)
                .ok_or(SimError::InstanceDown(instance))?;
            let actions = driver.process_event(event)?;
            for (socket_id, reason) in self.route(actions) {
                events.push_back(ServerEvent::ConnectionClosed { socket_id, reason });
            }
        }
        Ok(())
    }

    /// Execute actions. Returns the sockets the server closed.
    fn route(&mut self, actions: Vec<ServerAction>) -> Vec<(u64, String)> {
        let mut closed = Vec::new();
        for action in actions {
            match action {
                ServerAction::SendToSocket { socket_id, frame } => {
                    let Some(socket) = self.sockets.get_mut(&socket_id) else {
                        tracing::warn!(socket_id, "frame for unknown socket");
                        continue;
                    };
                    if !socket.is_open() {
                        socket.frames_after_close += 1;
                        continue;
                    }
                    match Payload::from_frame(&frame) {
                        Ok(payload) => {
                            if let Payload::ConnectionEstablished(established) = &payload {
                                socket.session_id = Some(established.session_id.clone());
                            }
                            socket.inbox.push(payload);
                        },
                        Err(e) => tracing::warn!(socket_id, error = %e, "undecodable server frame"),
                    }
                },
                ServerAction::CloseConnection { socket_id, reason } => {
                    if let Some(socket) = self.sockets.get_mut(&socket_id)
                        && socket.is_open()
                    {
                        socket.closed = Some(reason.clone());
                        closed.push((socket_id, reason));
                    }
                },
                ServerAction::SessionFailed { session_id, .. } => {
                    self.failed_sessions.push(session_id);
                },
                ServerAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{message}"),
                    LogLevel::Info => tracing::info!("{message}"),
                    LogLevel::Warn => tracing::warn!("{message}"),
                    LogLevel::Error => tracing::error!("{message}"),
                },
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use courier_proto::TargetType;

    use super::*;

    #[test]
    fn connect_grants_a_session() {
        let mut cluster = SimCluster::new(1, 1);
        let socket = cluster.connect(0, "alice").unwrap();

        assert!(cluster.session_id(socket).is_some());
        assert_eq!(cluster.metrics(0).unwrap().connections, 1);
    }

    #[test]
    fn frames_before_handshake_close_the_socket() {
        let mut cluster = SimCluster::new(1, 1);
        let socket = cluster.open(0).unwrap();

        cluster.send(socket, client::chat(TargetType::User, &["bob"], "hi")).unwrap();

        assert!(!cluster.is_open(socket));
        assert_eq!(cluster.errors(socket)[0].code, ErrorPayload::PROTOCOL);
        assert_eq!(cluster.metrics(0).unwrap().connections, 0);
    }

    #[test]
    fn crashed_instance_refuses_connections() {
        let mut cluster = SimCluster::new(1, 2);
        let socket = cluster.connect(1, "alice").unwrap();

        cluster.crash(1);

        assert!(!cluster.is_open(socket));
        assert!(matches!(cluster.connect(1, "bob"), Err(SimError::InstanceDown(1))));
        assert!(cluster.connect(0, "bob").is_ok());
    }

    #[test]
    fn sending_on_a_closed_socket_fails() {
        let mut cluster = SimCluster::new(1, 1);
        let socket = cluster.connect(0, "alice").unwrap();
        cluster.disconnect(socket).unwrap();

        let err = cluster.send(socket, client::goodbye()).unwrap_err();
        assert!(matches!(err, SimError::Closed { .. }));
    }
}
