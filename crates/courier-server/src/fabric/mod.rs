//! Cross-instance pub/sub fabric.
//!
//! Makes local delivery decisions visible to every other instance through the
//! shared broker, and degrades instead of failing when the broker is gone:
//!
//! - Publishes go through a circuit breaker. While it is open, or when the
//!   broker reports itself unavailable, messages are parked in a bounded
//!   offline queue and the caller gets [`PublishOutcome::Deferred`].
//! - Inbound messages from this instance are dropped (loop prevention) and a
//!   bounded recent-key cache suppresses broker redeliveries.
//! - A periodic health probe detects recovery, re-registers every pattern
//!   and drains the offline queue, skipping entries that expired meanwhile.
//!
//! Health latency is tracked separately from the breaker: slow probes only
//! degrade the reported health, failed operations open the breaker.

mod envelope;

use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

use courier_core::{BreakerState, CircuitBreaker, Environment, RecentSet};
use courier_proto::{
    MessageType, Priority, TargetType,
    payloads::{
        moderation::ModerationAction,
        presence::{PresenceUpdate, TypingUpdate, VoiceState},
        queue::{Delivery, MessageAck},
        room::MemberUpdate,
    },
};
pub use envelope::{DedupeKey, Envelope};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    broker::{Broker, BrokerError},
    config::FabricConfig,
};

/// Fabric errors. Broker unavailability never surfaces here: it defers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    /// Envelope or body could not be encoded or decoded
    #[error("fabric codec error: {0}")]
    Codec(String),

    /// Non-transient broker failure
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl FabricError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Codec(_) => false,
            Self::Broker(e) => e.is_transient(),
        }
    }
}

/// Logical event category. Each maps to one broker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Chat traffic
    Chat,
    /// Notifications
    Notifications,
    /// Server-generated messages
    System,
    /// Moderation actions
    Moderation,
    /// Delivery acknowledgements
    Acks,
    /// Presence, typing and voice state
    Presence,
    /// Cluster-wide broadcasts
    Broadcast,
    /// Room membership changes
    Rooms,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Self; 8] = [
        Self::Chat,
        Self::Notifications,
        Self::System,
        Self::Moderation,
        Self::Acks,
        Self::Presence,
        Self::Broadcast,
        Self::Rooms,
    ];

    /// Base channel name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Notifications => "notifications",
            Self::System => "system",
            Self::Moderation => "moderation",
            Self::Acks => "acks",
            Self::Presence => "presence",
            Self::Broadcast => "broadcast",
            Self::Rooms => "rooms",
        }
    }

    /// Channel carrying queued messages of `message_type` to `target_type`.
    pub const fn for_message(message_type: MessageType, target_type: TargetType) -> Self {
        if matches!(target_type, TargetType::Global) {
            return Self::Broadcast;
        }
        match message_type {
            MessageType::Chat => Self::Chat,
            MessageType::Notification => Self::Notifications,
            MessageType::System => Self::System,
            MessageType::Moderation => Self::Moderation,
            MessageType::Presence | MessageType::Voice => Self::Presence,
        }
    }

    /// Concrete channel name for `priority`. Normal traffic carries no suffix.
    pub fn name(self, priority: Priority) -> String {
        match priority {
            Priority::Urgent | Priority::High => format!("{}:high", self.as_str()),
            Priority::Normal => self.as_str().to_string(),
            Priority::Low => format!("{}:low", self.as_str()),
        }
    }

    /// Subscription pattern covering every priority of this channel.
    pub fn pattern(self) -> String {
        format!("{}*", self.as_str())
    }
}

/// Everything instances tell each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricMessage {
    /// Deliver to matching local sockets
    Deliver {
        /// How `to` is interpreted
        target_type: TargetType,
        /// Recipients
        to: Vec<String>,
        /// Message as pushed to sockets
        delivery: Delivery,
    },
    /// A client acknowledged a message
    Ack(MessageAck),
    /// Room membership changed
    Member(MemberUpdate),
    /// Typing indicator changed
    Typing(TypingUpdate),
    /// Presence changed
    Presence(PresenceUpdate),
    /// Voice state changed
    Voice(VoiceState),
    /// A moderation action was applied
    Moderation(ModerationAction),
}

impl FabricMessage {
    /// Stable kind tag, part of the dedupe key.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Deliver { .. } => "deliver",
            Self::Ack(_) => "ack",
            Self::Member(_) => "member",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
            Self::Voice(_) => "voice",
            Self::Moderation(_) => "moderation",
        }
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Lane; selects the channel suffix
    pub priority: Priority,
    /// Receivers and the offline queue drop the message after this long
    pub ttl: Option<Duration>,
    /// Compress bodies above the configured threshold
    pub compress: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { priority: Priority::Normal, ttl: None, compress: true }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent to the broker
    Published {
        /// Subscribers reached, including this instance's own subscription
        receivers: usize,
    },
    /// Parked in the offline queue until the broker recovers
    Deferred,
}

/// A message received from another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Concrete channel
    pub channel: String,
    /// Publishing instance
    pub origin: String,
    /// Decoded body
    pub message: FabricMessage,
}

/// Reported fabric health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FabricHealth {
    /// Probes fast, breaker closed
    Healthy,
    /// Sustained slow probes; still operating
    Degraded,
    /// Broker unreachable or breaker open
    Unavailable,
}

/// Events surfaced by [`Fabric::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    /// Probe failed after the link had been up
    LinkLost {
        /// Broker error text
        reason: String,
    },
    /// Link restored: patterns re-registered and the offline queue drained
    Reconnected {
        /// Patterns re-registered
        resubscribed: usize,
        /// Offline messages published
        drained: usize,
        /// Offline messages skipped as expired
        expired: usize,
    },
    /// Health classification changed
    HealthChanged(FabricHealth),
}

/// Counters for the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Messages sent to the broker, including offline drains
    pub published: u64,
    /// Messages parked in the offline queue
    pub deferred: u64,
    /// Offline messages dropped on overflow
    pub offline_dropped: u64,
    /// Offline messages skipped as expired
    pub offline_expired: u64,
    /// Inbound messages handed to the caller
    pub received: u64,
    /// Inbound duplicates suppressed
    pub duplicates: u64,
    /// Inbound messages from this instance, ignored
    pub self_loops: u64,
    /// Inbound messages that failed to decode
    pub decode_errors: u64,
    /// Link recoveries
    pub reconnects: u64,
}

#[derive(Debug, Clone)]
struct Parked {
    channel: String,
    bytes: Vec<u8>,
    expires_at_ms: u64,
}

/// Pub/sub fabric for one instance.
pub struct Fabric<E: Environment, B: Broker> {
    env: E,
    broker: B,
    server_id: String,
    config: FabricConfig,
    breaker: CircuitBreaker<E::Instant>,
    offline: VecDeque<Parked>,
    seen: RecentSet<DedupeKey>,
    patterns: BTreeSet<String>,
    link_lost: bool,
    slow_streak: u32,
    last_latency: Duration,
    reported_health: FabricHealth,
    next_probe_at: Option<E::Instant>,
    stats: FabricStats,
}

impl<E: Environment, B: Broker> Fabric<E, B> {
    /// New fabric. Nothing is subscribed until [`Fabric::subscribe`] or
    /// [`Fabric::subscribe_all`].
    pub fn new(env: E, broker: B, server_id: impl Into<String>, config: FabricConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker());
        let seen = RecentSet::new(config.dedupe_capacity);
        Self {
            env,
            broker,
            server_id: server_id.into(),
            config,
            breaker,
            offline: VecDeque::new(),
            seen,
            patterns: BTreeSet::new(),
            link_lost: false,
            slow_streak: 0,
            last_latency: Duration::ZERO,
            reported_health: FabricHealth::Healthy,
            next_probe_at: None,
            stats: FabricStats::default(),
        }
    }

    /// This instance's identity on the fabric.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Shared broker handle.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Register interest in channels matching `pattern`. The registration
    /// persists across broker outages; if the broker is unreachable now it is
    /// applied on reconnect.
    pub fn subscribe(&mut self, pattern: &str) {
        self.patterns.insert(pattern.to_string());
        if self.link_lost {
            return;
        }
        if let Err(e) = self.broker.subscribe(&self.server_id, pattern) {
            tracing::warn!(pattern, error = %e, "subscribe failed, will retry on reconnect");
            self.on_broker_failure(&e);
        }
    }

    /// Subscribe to every [`Channel`].
    pub fn subscribe_all(&mut self) {
        for channel in Channel::ALL {
            self.subscribe(&channel.pattern());
        }
    }

    /// Drop a registration.
    pub fn unsubscribe(&mut self, pattern: &str) {
        if self.patterns.remove(pattern)
            && !self.link_lost
            && let Err(e) = self.broker.unsubscribe(&self.server_id, pattern)
        {
            self.on_broker_failure(&e);
        }
    }

    /// Registered patterns.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// Publish `message` on `channel`.
    ///
    /// Never loses a message to broker unavailability: it is parked and
    /// `Deferred` is returned instead.
    ///
    /// # Errors
    ///
    /// - `Codec` if the message cannot be encoded
    /// - `Broker` for non-transient broker failures
    pub fn publish(
        &mut self,
        channel: Channel,
        message: &FabricMessage,
        options: PublishOptions,
    ) -> Result<PublishOutcome, FabricError> {
        let now_ms = self.env.wall_clock_ms();
        let expires_at_ms = options.ttl.map(|ttl| now_ms + ttl.as_millis() as u64);
        let envelope = Envelope::seal(
            message,
            self.env.new_id(),
            self.server_id.clone(),
            now_ms,
            expires_at_ms,
            if options.compress { self.config.compress_above() } else { None },
        )?;
        let bytes = envelope.to_bytes()?;
        let name = channel.name(options.priority);
        let parked_expiry = expires_at_ms.unwrap_or(now_ms + self.config.default_ttl_ms);

        let now = self.env.now();
        if self.link_lost || self.breaker.try_acquire(now).is_err() {
            self.park(name, bytes, parked_expiry);
            return Ok(PublishOutcome::Deferred);
        }

        match self.broker.publish(&name, &bytes) {
            Ok(receivers) => {
                self.breaker.record_success(now);
                self.stats.published += 1;
                Ok(PublishOutcome::Published { receivers })
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(channel = %name, error = %e, "publish failed, parking offline");
                self.on_broker_failure(&e);
                self.park(name, bytes, parked_expiry);
                Ok(PublishOutcome::Deferred)
            },
            Err(e) => {
                self.breaker.record_failure(now);
                Err(e.into())
            },
        }
    }

    /// Take pending inbound messages, dropping self-published copies,
    /// duplicates and expired messages.
    pub fn poll(&mut self) -> Vec<Inbound> {
        if self.link_lost {
            return Vec::new();
        }
        let now = self.env.now();
        if self.breaker.is_open(now) {
            return Vec::new();
        }

        let batch = match self.broker.poll(&self.server_id, self.config.poll_batch) {
            Ok(batch) => {
                self.breaker.record_success(now);
                batch
            },
            Err(e) => {
                tracing::warn!(error = %e, "fabric poll failed");
                self.on_broker_failure(&e);
                return Vec::new();
            },
        };

        let now_ms = self.env.wall_clock_ms();
        let mut inbound = Vec::with_capacity(batch.len());
        for published in batch {
            let envelope = match Envelope::from_bytes(&published.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(channel = %published.channel, error = %e, "undecodable envelope");
                    self.stats.decode_errors += 1;
                    continue;
                },
            };

            if envelope.server_id == self.server_id {
                self.stats.self_loops += 1;
                continue;
            }
            if !self.seen.insert(envelope.dedupe_key(&published.channel)) {
                self.stats.duplicates += 1;
                continue;
            }
            if envelope.is_expired(now_ms) {
                continue;
            }

            match envelope.open() {
                Ok(message) => {
                    self.stats.received += 1;
                    inbound.push(Inbound {
                        channel: published.channel,
                        origin: envelope.server_id,
                        message,
                    });
                },
                Err(e) => {
                    tracing::debug!(kind = %envelope.kind, error = %e, "undecodable body");
                    self.stats.decode_errors += 1;
                },
            }
        }
        inbound
    }

    /// Run the health probe if due. On recovery re-registers every pattern and
    /// drains the offline queue.
    pub fn tick(&mut self) -> Vec<FabricEvent> {
        let now = self.env.now();
        if self.next_probe_at.is_some_and(|at| now < at) {
            return Vec::new();
        }
        self.next_probe_at = Some(now + Duration::from_millis(self.config.health_interval_ms));

        let mut events = Vec::new();
        if self.breaker.try_acquire(now).is_ok() {
            let started = self.env.now();
            match self.broker.ping() {
                Ok(()) => {
                    let latency = self.env.now() - started;
                    self.breaker.record_success(now);
                    self.record_latency(latency);
                    if self.link_lost {
                        events.extend(self.reconnect());
                    } else if !self.offline.is_empty() {
                        self.drain_offline();
                    }
                },
                Err(e) => {
                    let was_up = !self.link_lost;
                    self.on_broker_failure(&e);
                    if was_up {
                        tracing::warn!(error = %e, "broker link lost");
                        events.push(FabricEvent::LinkLost { reason: e.to_string() });
                    }
                },
            }
        }

        let health = self.health();
        if health != self.reported_health {
            self.reported_health = health;
            events.push(FabricEvent::HealthChanged(health));
        }
        events
    }

    /// Feed one probe latency into the health classification.
    pub fn record_latency(&mut self, latency: Duration) {
        self.last_latency = latency;
        if latency > Duration::from_millis(self.config.slow_threshold_ms) {
            self.slow_streak = self.slow_streak.saturating_add(1);
        } else {
            self.slow_streak = 0;
        }
    }

    /// Current health.
    pub fn health(&self) -> FabricHealth {
        if self.link_lost || self.breaker.current_state() == BreakerState::Open {
            FabricHealth::Unavailable
        } else if self.slow_streak >= self.config.degraded_after {
            FabricHealth::Degraded
        } else {
            FabricHealth::Healthy
        }
    }

    /// Breaker state without advancing time.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.current_state()
    }

    /// Messages waiting in the offline queue.
    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Whether the broker link is considered down.
    pub fn is_link_lost(&self) -> bool {
        self.link_lost
    }

    /// Last measured probe latency.
    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    /// Counters.
    pub fn stats(&self) -> FabricStats {
        self.stats
    }

    fn on_broker_failure(&mut self, error: &BrokerError) {
        self.breaker.record_failure(self.env.now());
        if matches!(error, BrokerError::Unavailable(_)) {
            self.link_lost = true;
        }
    }

    fn park(&mut self, channel: String, bytes: Vec<u8>, expires_at_ms: u64) {
        let capacity = self.config.offline_capacity.max(1);
        if self.offline.len() >= capacity {
            let evict = (capacity / 10).max(1).min(self.offline.len());
            self.offline.drain(..evict);
            self.stats.offline_dropped += evict as u64;
            tracing::warn!(evicted = evict, "offline queue full, dropped oldest");
        }
        self.offline.push_back(Parked { channel, bytes, expires_at_ms });
        self.stats.deferred += 1;
    }

    fn reconnect(&mut self) -> Option<FabricEvent> {
        let patterns: Vec<String> = self.patterns.iter().cloned().collect();
        for pattern in &patterns {
            if let Err(e) = self.broker.subscribe(&self.server_id, pattern) {
                tracing::warn!(pattern = %pattern, error = %e, "resubscribe failed");
                self.breaker.record_failure(self.env.now());
                return None;
            }
        }

        self.link_lost = false;
        self.stats.reconnects += 1;
        let (drained, expired) = self.drain_offline();
        tracing::info!(resubscribed = patterns.len(), drained, expired, "broker link restored");
        Some(FabricEvent::Reconnected { resubscribed: patterns.len(), drained, expired })
    }

    /// Publish parked messages oldest first. Stops at the first failure,
    /// leaving the rest parked.
    fn drain_offline(&mut self) -> (usize, usize) {
        let now_ms = self.env.wall_clock_ms();
        let mut drained = 0;
        let mut expired = 0;

        while let Some(parked) = self.offline.pop_front() {
            if now_ms >= parked.expires_at_ms {
                expired += 1;
                self.stats.offline_expired += 1;
                continue;
            }
            match self.broker.publish(&parked.channel, &parked.bytes) {
                Ok(_) => {
                    drained += 1;
                    self.stats.published += 1;
                },
                Err(e) => {
                    self.offline.push_front(parked);
                    self.on_broker_failure(&e);
                    break;
                },
            }
        }
        (drained, expired)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use courier_proto::{PresenceStatus, payloads::presence::PresenceUpdate};

    use super::*;
    use crate::broker::MemoryBroker;

    #[derive(Clone)]
    struct TestEnv {
        millis: Arc<AtomicU64>,
        ids: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { millis: Arc::new(AtomicU64::new(1_000)), ids: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, ms: u64) {
            self.millis.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.millis.load(Ordering::SeqCst))
        }

        fn wall_clock_ms(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let n = self.ids.fetch_add(1, Ordering::SeqCst).to_be_bytes();
            for (i, b) in buffer.iter_mut().enumerate() {
                *b = n[i % 8];
            }
        }
    }

    fn config() -> FabricConfig {
        FabricConfig {
            offline_capacity: 10,
            breaker_threshold: 2,
            breaker_recovery_ms: 1_000,
            health_interval_ms: 500,
            ..FabricConfig::default()
        }
    }

    fn presence(user: &str) -> FabricMessage {
        FabricMessage::Presence(PresenceUpdate {
            user_id: user.to_string(),
            status: PresenceStatus::Online,
        })
    }

    fn pair() -> (TestEnv, MemoryBroker, Fabric<TestEnv, MemoryBroker>, Fabric<TestEnv, MemoryBroker>)
    {
        let env = TestEnv::new();
        let broker = MemoryBroker::new();
        let mut a = Fabric::new(env.clone(), broker.clone(), "a", config());
        let mut b = Fabric::new(env.clone(), broker.clone(), "b", config());
        a.subscribe_all();
        b.subscribe_all();
        (env, broker, a, b)
    }

    #[test]
    fn channel_names_carry_priority_suffix() {
        assert_eq!(Channel::Chat.name(Priority::Urgent), "chat:high");
        assert_eq!(Channel::Chat.name(Priority::Normal), "chat");
        assert_eq!(Channel::Acks.name(Priority::Low), "acks:low");
        assert_eq!(Channel::for_message(MessageType::Chat, TargetType::Global), Channel::Broadcast);
    }

    #[test]
    fn own_messages_are_ignored() {
        let (_env, _broker, mut a, mut b) = pair();
        let outcome = a.publish(Channel::Presence, &presence("u"), PublishOptions::default());
        assert_eq!(outcome, Ok(PublishOutcome::Published { receivers: 2 }));

        assert!(a.poll().is_empty());
        assert_eq!(a.stats().self_loops, 1);

        let got = b.poll();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].origin, "a");
        assert_eq!(got[0].message, presence("u"));
    }

    #[test]
    fn redelivered_copies_are_suppressed() {
        let (env, broker, mut a, mut b) = pair();
        a.publish(Channel::Presence, &presence("u"), PublishOptions::default()).unwrap();

        // Replay the exact bytes as a broker redelivery would
        let copy = broker.poll("b", 10).unwrap();
        broker.publish(&copy[0].channel, &copy[0].payload).unwrap();
        broker.publish(&copy[0].channel, &copy[0].payload).unwrap();
        env.advance(1);

        assert_eq!(b.poll().len(), 1);
        assert_eq!(b.stats().duplicates, 1);
    }

    #[test]
    fn outage_parks_then_drains_on_reconnect() {
        let (env, broker, mut a, mut b) = pair();
        broker.set_available(false);

        let outcome = a.publish(Channel::Chat, &presence("u1"), PublishOptions::default());
        assert_eq!(outcome, Ok(PublishOutcome::Deferred));
        assert!(a.is_link_lost());
        assert_eq!(a.offline_len(), 1);

        let events = a.tick();
        assert!(events.contains(&FabricEvent::HealthChanged(FabricHealth::Unavailable)));

        b.tick();
        broker.set_available(true);
        env.advance(1_000);

        // b re-registers first so it is listening when a drains
        assert!(matches!(b.tick().first(), Some(FabricEvent::Reconnected { drained: 0, .. })));

        let events = a.tick();
        assert!(events.contains(&FabricEvent::Reconnected {
            resubscribed: Channel::ALL.len(),
            drained: 1,
            expired: 0
        }));
        assert_eq!(a.offline_len(), 0);
        assert_eq!(broker.subscriptions("a").len(), Channel::ALL.len());

        let got = b.poll();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, presence("u1"));
    }

    #[test]
    fn expired_offline_entries_are_skipped() {
        let (env, broker, mut a, _b) = pair();
        broker.set_available(false);
        let short = PublishOptions { ttl: Some(Duration::from_millis(100)), ..Default::default() };
        a.publish(Channel::Chat, &presence("u1"), short).unwrap();
        a.publish(Channel::Chat, &presence("u2"), PublishOptions::default()).unwrap();

        broker.set_available(true);
        env.advance(1_000);
        let events = a.tick();
        assert!(events.contains(&FabricEvent::Reconnected {
            resubscribed: Channel::ALL.len(),
            drained: 1,
            expired: 1
        }));
    }

    #[test]
    fn offline_overflow_drops_oldest_tenth() {
        let (_env, broker, mut a, _b) = pair();
        broker.set_available(false);
        for i in 0..11 {
            a.publish(Channel::Chat, &presence(&format!("u{i}")), PublishOptions::default())
                .unwrap();
        }
        assert_eq!(a.offline_len(), 10);
        assert_eq!(a.stats().offline_dropped, 1);
    }

    #[test]
    fn slow_probes_degrade_without_opening_breaker() {
        let (_env, _broker, mut a, _b) = pair();
        for _ in 0..3 {
            a.record_latency(Duration::from_secs(2));
        }
        assert_eq!(a.health(), FabricHealth::Degraded);
        assert_eq!(a.breaker_state(), BreakerState::Closed);

        a.record_latency(Duration::from_millis(5));
        assert_eq!(a.health(), FabricHealth::Healthy);
    }
}
