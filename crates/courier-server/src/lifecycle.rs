//! Connection lifecycle manager.
//!
//! Owns one [`Session`] per logical client, one [`ConnectionMonitor`] per
//! socket, admission control, and deferred eviction of detached sessions.
//! Sessions are persisted to the broker under `session:<id>` with a TTL of
//! `session_timeout`, so a client can restore its session on any instance.
//!
//! Broker failures never block admission: a failed session lookup is treated
//! as "not found" and a failed write is logged and skipped.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    net::IpAddr,
};

use courier_core::{
    AdmissionError, ConnectionMonitor, DegradationLevel, Environment, Instant, MonitorAction,
    Session, SessionError, TimerWheel, rate_limit::AdmissionLimiter,
};
use courier_proto::{ErrorPayload, Frame, FrameHeader, payloads::session::Hello};
use thiserror::Error;

use crate::{
    broker::Broker,
    config::LifecycleConfig,
    registry::{ConnectionRegistry, Identity},
};

/// Lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Connection refused
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Handshake or session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Socket was never admitted or is already closed
    #[error("unknown socket {0}")]
    UnknownSocket(u64),

    /// A second handshake on an established socket
    #[error("socket {0} already completed its handshake")]
    AlreadyEstablished(u64),
}

impl LifecycleError {
    /// Client-facing form.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Admission(e) => e.to_payload(),
            Self::Session(e) => e.to_payload(),
            Self::UnknownSocket(_) | Self::AlreadyEstablished(_) => {
                ErrorPayload::protocol(self.to_string())
            },
        }
    }

    /// Whether the connection should be closed after reporting the error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AlreadyEstablished(_))
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Established {
    /// The session now bound to the socket
    pub session: Session,
    /// True if an existing session was restored
    pub reconnection: bool,
    /// Socket that held the same session before; detached and must be closed
    pub superseded: Option<u64>,
    /// Frames buffered for the session while it was detached, oldest first
    pub pending: Vec<Frame>,
}

/// Result of a socket going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    /// Who the socket belonged to
    pub identity: Identity,
    /// Sockets the user still has on this instance
    pub remaining_sockets: usize,
}

/// Events produced by [`LifecycleManager::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Send a heartbeat ping
    Ping {
        /// Socket
        socket_id: u64,
    },
    /// Transport health changed
    Degraded {
        /// Socket
        socket_id: u64,
        /// New level
        level: DegradationLevel,
    },
    /// Reconnection probing started or advanced
    Reconnecting {
        /// Socket
        socket_id: u64,
        /// Probe number
        attempt: u32,
    },
    /// Probes exhausted; the socket is detached and the session destroyed
    Failed {
        /// Socket
        socket_id: u64,
        /// Owner of the failed session
        identity: Identity,
        /// Probes made
        attempts: u32,
    },
    /// A detached session outlived `session_timeout`
    Evicted {
        /// Session
        session_id: String,
        /// Owner
        user_id: String,
    },
}

/// Connection lifecycle manager for one instance.
#[derive(Debug)]
pub struct LifecycleManager<I: Instant> {
    config: LifecycleConfig,
    admission: AdmissionLimiter<I>,
    registry: ConnectionRegistry,
    monitors: HashMap<u64, ConnectionMonitor<I>>,
    /// Session ID → session, attached or detached
    sessions: HashMap<String, Session>,
    evictions: TimerWheel<I, String>,
    pending: HashMap<String, VecDeque<Frame>>,
}

impl<I: Instant> LifecycleManager<I> {
    /// Empty manager.
    pub fn new(config: LifecycleConfig) -> Self {
        let admission =
            AdmissionLimiter::new(config.admission_window(), config.admission_max_per_window);
        Self {
            config,
            admission,
            registry: ConnectionRegistry::new(),
            monitors: HashMap::new(),
            sessions: HashMap::new(),
            evictions: TimerWheel::new(),
            pending: HashMap::new(),
        }
    }

    /// Admit a new transport connection.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if `addr` opened too many connections this window
    /// - `CapacityExceeded` if the global or per-address ceiling is reached
    pub fn admit(&mut self, socket_id: u64, addr: IpAddr, now: I) -> Result<(), LifecycleError> {
        self.admission.check(&addr.to_string(), now).map_err(|retry_after| {
            AdmissionError::RateLimited { addr: addr.to_string(), retry_after }
        })?;

        if self.registry.socket_count() >= self.config.max_connections {
            return Err(AdmissionError::CapacityExceeded {
                scope: "global",
                limit: self.config.max_connections,
            }
            .into());
        }
        if self.registry.addr_count(addr) >= self.config.max_per_ip {
            return Err(
                AdmissionError::CapacityExceeded { scope: "ip", limit: self.config.max_per_ip }
                    .into(),
            );
        }

        if !self.registry.register(socket_id, addr) {
            return Err(LifecycleError::AlreadyEstablished(socket_id));
        }
        Ok(())
    }

    /// Complete the handshake on an admitted socket.
    ///
    /// Restores the session named in `hello` if it is known here or in the
    /// broker and belongs to the same user; otherwise starts a fresh session
    /// with `fresh_id`.
    ///
    /// # Errors
    ///
    /// - `UnknownSocket` if the socket was not admitted
    /// - `AlreadyEstablished` on a second handshake
    /// - `UnsupportedVersion` if the client speaks another protocol version
    /// - `CapacityExceeded` if the user is at the per-user ceiling
    pub fn establish<B: Broker>(
        &mut self,
        socket_id: u64,
        hello: &Hello,
        fresh_id: String,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> Result<Established, LifecycleError> {
        let socket = self.registry.socket(socket_id).ok_or(LifecycleError::UnknownSocket(socket_id))?;
        if socket.identity.is_some() {
            return Err(LifecycleError::AlreadyEstablished(socket_id));
        }
        if hello.version != FrameHeader::VERSION {
            return Err(SessionError::UnsupportedVersion(hello.version).into());
        }

        let restorable = hello
            .session_id
            .as_deref()
            .and_then(|id| self.lookup(id, broker, now_ms))
            .filter(|s| s.user_id == hello.user_id);

        let holder = restorable
            .as_ref()
            .and_then(|s| self.registry.socket_for_session(&s.session_id));
        let user_sockets = self
            .registry
            .user_socket_count(&hello.user_id)
            .saturating_sub(usize::from(holder.is_some()));
        if user_sockets >= self.config.max_per_user {
            return Err(
                AdmissionError::CapacityExceeded { scope: "user", limit: self.config.max_per_user }
                    .into(),
            );
        }

        let (mut session, reconnection) = match restorable {
            Some(mut session) => {
                session.restore(&hello.user_id, now_ms)?;
                (session, true)
            },
            None => {
                if let Some(id) = &hello.session_id {
                    tracing::debug!(session_id = %id, user_id = %hello.user_id, "session not restorable");
                }
                let session = Session::new(
                    fresh_id,
                    hello.user_id.clone(),
                    hello.device_id.clone(),
                    hello.device_type,
                    now_ms,
                );
                (session, false)
            },
        };
        session.device_id.clone_from(&hello.device_id);
        session.device_type = hello.device_type;

        let identity = Identity {
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            session_id: session.session_id.clone(),
        };
        let superseded = self.registry.bind(socket_id, identity);
        if let Some(old) = superseded {
            self.registry.unregister(old);
            self.monitors.remove(&old);
            tracing::info!(session_id = %session.session_id, socket_id = old, "socket superseded");
        }

        self.evictions.cancel(&session.session_id);
        self.monitors.insert(socket_id, ConnectionMonitor::new(now, self.config.monitor()));
        self.persist(&session, broker, now_ms);

        let pending = self.pending.remove(&session.session_id).map(Vec::from).unwrap_or_default();
        self.sessions.insert(session.session_id.clone(), session.clone());

        tracing::info!(
            socket_id,
            session_id = %session.session_id,
            user_id = %session.user_id,
            reconnection,
            reconnect_count = session.reconnect_count,
            "session established"
        );
        Ok(Established { session, reconnection, superseded, pending })
    }

    fn lookup<B: Broker>(&self, session_id: &str, broker: &B, now_ms: u64) -> Option<Session> {
        if let Some(session) = self.sessions.get(session_id) {
            return Some(session.clone());
        }
        match broker.get(&Session::key(session_id), now_ms) {
            Ok(Some(bytes)) => match Session::from_bytes(&bytes) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "unreadable session record");
                    None
                },
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "session lookup failed");
                None
            },
        }
    }

    fn persist<B: Broker>(&self, session: &Session, broker: &B, now_ms: u64) {
        let expires_at_ms = now_ms.saturating_add(self.config.session_timeout_ms);
        let result = session
            .to_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                broker
                    .set(&Session::key(&session.session_id), &bytes, Some(expires_at_ms))
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = result {
            tracing::warn!(session_id = %session.session_id, %error, "session persist failed");
        }
    }

    /// Run heartbeat monitors and deferred evictions.
    pub fn tick<E, B>(&mut self, env: &E, broker: &B) -> Vec<LifecycleEvent>
    where
        E: Environment<Instant = I>,
        B: Broker,
    {
        let now = env.now();
        let mut events = Vec::new();
        let mut failed = Vec::new();

        let mut socket_ids: Vec<u64> = self.monitors.keys().copied().collect();
        socket_ids.sort_unstable();

        for socket_id in socket_ids {
            let Some(monitor) = self.monitors.get_mut(&socket_id) else {
                continue;
            };
            if monitor.next_deadline().is_none_or(|due| now < due) {
                continue;
            }
            let actions = monitor.tick(now, env.random_unit());
            let mut session = self
                .registry
                .identity(socket_id)
                .and_then(|i| self.sessions.get_mut(&i.session_id));
            for action in actions {
                match action {
                    MonitorAction::SendPing => events.push(LifecycleEvent::Ping { socket_id }),
                    MonitorAction::Degraded(level) => {
                        if let Some(s) = session.as_deref_mut() {
                            s.state.degradation_level = level;
                        }
                        tracing::debug!(socket_id, ?level, "connection degraded");
                        events.push(LifecycleEvent::Degraded { socket_id, level });
                    },
                    MonitorAction::Reconnecting { attempt, delay } => {
                        if let Some(s) = session.as_deref_mut() {
                            s.state.is_reconnecting = true;
                            s.state.reconnect_attempts = attempt;
                        }
                        tracing::debug!(socket_id, attempt, ?delay, "probing connection");
                        events.push(LifecycleEvent::Reconnecting { socket_id, attempt });
                    },
                    MonitorAction::Failed { attempts } => failed.push((socket_id, attempts)),
                    MonitorAction::Recovered => {},
                }
            }
        }

        for (socket_id, attempts) in failed {
            if let Some(identity) = self.fail(socket_id, broker) {
                tracing::warn!(
                    socket_id,
                    session_id = %identity.session_id,
                    attempts,
                    "session failed"
                );
                events.push(LifecycleEvent::Failed { socket_id, identity, attempts });
            }
        }

        for session_id in self.evictions.poll_expired(now) {
            let attached = self.registry.socket_for_session(&session_id).is_some();
            if attached {
                continue;
            }
            self.pending.remove(&session_id);
            if let Some(session) = self.sessions.remove(&session_id) {
                tracing::debug!(session_id = %session_id, "detached session evicted");
                events.push(LifecycleEvent::Evicted { session_id, user_id: session.user_id });
            }
        }

        events
    }

    /// Destroy the session on a failed socket. The broker record goes too.
    fn fail<B: Broker>(&mut self, socket_id: u64, broker: &B) -> Option<Identity> {
        self.monitors.remove(&socket_id);
        let identity = self.registry.unregister(socket_id)?.identity?;
        self.destroy(&identity.session_id, broker);
        Some(identity)
    }

    fn destroy<B: Broker>(&mut self, session_id: &str, broker: &B) {
        self.sessions.remove(session_id);
        self.pending.remove(session_id);
        self.evictions.cancel(&session_id.to_string());
        if let Err(e) = broker.delete(&Session::key(session_id)) {
            tracing::warn!(session_id, error = %e, "session delete failed");
        }
    }

    /// Heartbeat reply on `socket_id`. Returns true if the link recovered
    /// from degradation.
    pub fn handle_pong<B: Broker>(
        &mut self,
        socket_id: u64,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> bool {
        let recovered = self
            .monitors
            .get_mut(&socket_id)
            .and_then(|m| m.handle_pong(now))
            .is_some_and(|a| a == MonitorAction::Recovered);

        let Some(session_id) = self.registry.identity(socket_id).map(|i| i.session_id.clone())
        else {
            return recovered;
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.record_heartbeat(now_ms);
            let session = session.clone();
            self.persist(&session, broker, now_ms);
        }
        if recovered {
            tracing::info!(socket_id, session_id = %session_id, "connection recovered");
        }
        recovered
    }

    /// Record inbound activity on `socket_id`.
    pub fn touch(&mut self, socket_id: u64, now_ms: u64) {
        if let Some(session) = self
            .registry
            .identity(socket_id)
            .and_then(|i| self.sessions.get_mut(&i.session_id))
        {
            session.touch(now_ms);
        }
    }

    /// Track a room join on the session of `socket_id`.
    pub fn track_room<B: Broker>(
        &mut self,
        socket_id: u64,
        room_id: &str,
        joined: bool,
        broker: &B,
        now_ms: u64,
    ) {
        let Some(session) = self
            .registry
            .identity(socket_id)
            .and_then(|i| self.sessions.get_mut(&i.session_id))
        else {
            return;
        };
        let changed = if joined {
            session.rooms.insert(room_id.to_string())
        } else {
            session.rooms.remove(room_id)
        };
        if changed {
            let session = session.clone();
            self.persist(&session, broker, now_ms);
        }
    }

    /// Socket closed without logout. The session is kept for restore and
    /// evicted after `session_timeout`.
    pub fn disconnect<B: Broker>(
        &mut self,
        socket_id: u64,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> Option<Detached> {
        self.monitors.remove(&socket_id);
        let identity = self.registry.unregister(socket_id)?.identity?;

        if let Some(session) = self.sessions.get_mut(&identity.session_id) {
            session.mark_inactive();
            session.touch(now_ms);
            let session = session.clone();
            self.persist(&session, broker, now_ms);
            self.evictions
                .schedule(identity.session_id.clone(), now + self.config.session_timeout());
        }

        let remaining_sockets = self.registry.user_socket_count(&identity.user_id);
        tracing::debug!(
            socket_id,
            session_id = %identity.session_id,
            remaining_sockets,
            "socket detached"
        );
        Some(Detached { identity, remaining_sockets })
    }

    /// Explicit logout: the session is destroyed now.
    pub fn logout<B: Broker>(&mut self, socket_id: u64, broker: &B) -> Option<Detached> {
        self.monitors.remove(&socket_id);
        let identity = self.registry.unregister(socket_id)?.identity?;
        self.destroy(&identity.session_id, broker);
        let remaining_sockets = self.registry.user_socket_count(&identity.user_id);
        tracing::info!(socket_id, session_id = %identity.session_id, "session logged out");
        Some(Detached { identity, remaining_sockets })
    }

    /// Drop an anonymous or refused socket.
    pub fn release(&mut self, socket_id: u64) {
        self.monitors.remove(&socket_id);
        self.registry.unregister(socket_id);
    }

    /// Buffer a frame for every detached session of `user_id` on this
    /// instance. Returns how many sessions took it.
    pub fn buffer_for_user(&mut self, user_id: &str, frame: &Frame) -> usize {
        let limit = self.config.pending_buffer;
        if limit == 0 {
            return 0;
        }
        let mut buffered = 0;
        for session in self.sessions.values() {
            if session.user_id != user_id || session.state.is_active {
                continue;
            }
            let queue = self.pending.entry(session.session_id.clone()).or_default();
            while queue.len() >= limit {
                queue.pop_front();
            }
            queue.push_back(frame.clone());
            buffered += 1;
        }
        buffered
    }

    /// Write every attached session back to the broker.
    pub fn persist_all<B: Broker>(&self, broker: &B, now_ms: u64) -> usize {
        let mut sessions: Vec<&Session> =
            self.sessions.values().filter(|s| s.state.is_active).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        for session in &sessions {
            self.persist(session, broker, now_ms);
        }
        sessions.len()
    }

    /// Drop expired admission windows.
    pub fn prune(&mut self, now: I) {
        self.admission.prune(now);
    }

    /// Session bound to `socket_id`.
    pub fn session_for_socket(&self, socket_id: u64) -> Option<&Session> {
        self.registry.identity(socket_id).and_then(|i| self.sessions.get(&i.session_id))
    }

    /// Session by id.
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Identity of a handshaken socket.
    pub fn identity(&self, socket_id: u64) -> Option<&Identity> {
        self.registry.identity(socket_id)
    }

    /// Whether a socket is admitted.
    pub fn has_socket(&self, socket_id: u64) -> bool {
        self.registry.has_socket(socket_id)
    }

    /// Live sockets of `user_id`.
    pub fn sockets_for_user(&self, user_id: &str) -> Vec<u64> {
        self.registry.sockets_for_user(user_id).collect()
    }

    /// Every admitted socket.
    pub fn socket_ids(&self) -> Vec<u64> {
        self.registry.socket_ids()
    }

    /// Degradation of a socket's link.
    pub fn degradation(&self, socket_id: u64) -> Option<DegradationLevel> {
        self.monitors.get(&socket_id).map(ConnectionMonitor::degradation)
    }

    /// Rooms the session on `socket_id` is tracked in.
    pub fn rooms_for_socket(&self, socket_id: u64) -> BTreeSet<String> {
        self.session_for_socket(socket_id).map(|s| s.rooms.clone()).unwrap_or_default()
    }

    /// Admitted sockets.
    pub fn connection_count(&self) -> usize {
        self.registry.socket_count()
    }

    /// Distinct connected users.
    pub fn user_count(&self) -> usize {
        self.registry.user_count()
    }

    /// Sessions held in memory, attached or detached.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions awaiting eviction.
    pub fn detached_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.state.is_active).count()
    }
}
