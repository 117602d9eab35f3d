//! Message delivery queue.
//!
//! Accepts validated messages into four strict-priority [`Lanes`], delivers
//! one lane batch per tick through a caller-supplied delivery function, and
//! tracks each attempt until it is acknowledged, retried, expired or
//! dead-lettered.
//!
//! Messages scheduled for later wait outside the lanes on a timer and enter
//! their lane when due, so a future message never holds up a lower lane.
//!
//! # Durability
//!
//! Messages with `guarantee_delivery` are written to the broker under
//! `message:<id>` before they enter a lane. The record is removed once the
//! message completes, rewritten with its terminal status on failure or
//! expiry, and kept until a `read` ack when `persist_until_read` is set.
//! [`DeliveryQueue::recover`] re-admits this instance's unfinished records
//! after a restart.
//!
//! # Acknowledgement
//!
//! Each attempt records the [`Recipients`] it was addressed to. Acks from
//! anyone else are refused and change nothing.
//!
//! # Failure handling
//!
//! A delivery function error counts toward the breaker, puts the batch back at
//! the head of its lane and ends the tick. While the breaker is open every
//! enqueue fails with `CircuitOpen`.

mod dead_letter;
mod lanes;

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    time::Duration,
};

use courier_core::{
    BreakerState, CircuitBreaker, Instant, MessageStatus, QueueError, QueueMessage, TimerWheel,
    backoff, rate_limit::SendRateLimiter,
};
use courier_proto::{AckStatus, MessageType, Priority, payloads::queue::MessageAck};
pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use lanes::Lanes;
use serde::Serialize;

use crate::{broker::Broker, config::QueueConfig};

/// Queue counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Admitted to a lane
    pub enqueued: u64,
    /// Successful delivery attempts
    pub sent: u64,
    /// Settled by a `delivered` ack
    pub delivered: u64,
    /// Settled by a `read` ack
    pub acknowledged: u64,
    /// Attempts scheduled again after a timeout or failed ack
    pub retried: u64,
    /// Ack windows that elapsed
    pub timeouts: u64,
    /// Dropped past their expiry
    pub expired: u64,
    /// Moved to the dead-letter store
    pub dead_lettered: u64,
    /// Delivery function errors
    pub errors: u64,
    /// Sends refused by the rate limiter
    pub rate_limited: u64,
    /// Enqueues refused by the open breaker
    pub rejected_open: u64,
    /// Enqueues refused as malformed
    pub rejected_invalid: u64,
    /// Acks for already settled messages
    pub duplicate_acks: u64,
    /// Acks from users the message was not addressed to
    pub foreign_acks: u64,
}

/// A message that will not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    /// Message
    pub message_id: String,
    /// Original sender
    pub from: String,
    /// Why
    pub reason: String,
    /// Attempts made
    pub attempts: u32,
    /// `Failed` or `Expired`
    pub status: MessageStatus,
}

/// Users allowed to acknowledge a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// These users only
    Users(BTreeSet<String>),
    /// Any user (cluster-wide broadcasts)
    Anyone,
}

impl Recipients {
    /// A fixed set of users.
    pub fn users<S: Into<String>>(users: impl IntoIterator<Item = S>) -> Self {
        Self::Users(users.into_iter().map(Into::into).collect())
    }

    /// Whether `user` may acknowledge.
    pub fn contains(&self, user: &str) -> bool {
        match self {
            Self::Users(users) => users.contains(user),
            Self::Anyone => true,
        }
    }
}

/// What one delivery attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Local sockets and detached sessions reached
    pub reached: usize,
    /// Who the attempt was addressed to
    pub recipients: Recipients,
}

/// What one processing tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Lane the batch came from
    pub lane: Option<Priority>,
    /// Messages taken from the lane
    pub taken: usize,
    /// Successful delivery attempts
    pub sent: usize,
    /// Attempts scheduled for retry
    pub retried: usize,
    /// Messages given up on
    pub failed: Vec<FailureNotice>,
    /// Error that ended the tick early
    pub error: Option<QueueError>,
}

/// Result of applying an ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The message settled with this status
    Settled(MessageStatus),
    /// Client reported failure; another attempt was scheduled
    Retrying,
    /// Client reported failure and retries are exhausted
    DeadLettered(FailureNotice),
    /// Already settled; nothing changed
    Duplicate,
    /// The acking user was not a recipient; nothing changed
    NotRecipient,
    /// Not tracked by this instance
    Unknown,
}

/// A settled message. Recipients are kept while a `read` ack may still
/// upgrade a `delivered` one.
#[derive(Debug, Clone)]
struct SettledEntry {
    status: MessageStatus,
    recipients: Option<Recipients>,
}

/// Recently settled messages, bounded.
#[derive(Debug, Clone)]
struct Settled {
    entries: HashMap<String, SettledEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Settled {
    fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn get(&self, id: &str) -> Option<&SettledEntry> {
        self.entries.get(id)
    }

    fn status(&self, id: &str) -> Option<MessageStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    fn insert(&mut self, id: String, status: MessageStatus, recipients: Option<Recipients>) {
        let entry = SettledEntry { status, recipients };
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Delivery queue for one instance.
#[derive(Debug)]
pub struct DeliveryQueue<I: Instant> {
    config: QueueConfig,
    server_id: String,
    lanes: Lanes,
    /// Not deliverable before their scheduled time
    scheduled: HashMap<String, QueueMessage>,
    schedule_timers: TimerWheel<I, String>,
    /// Sent, awaiting an ack
    in_flight: HashMap<String, QueueMessage>,
    ack_timers: TimerWheel<I, String>,
    /// Waiting out a retry delay
    waiting: HashMap<String, QueueMessage>,
    retry_timers: TimerWheel<I, String>,
    /// Addressees of the last attempt, for in-flight and waiting messages
    recipients: HashMap<String, Recipients>,
    settled: Settled,
    dead_letters: DeadLetterStore,
    breaker: CircuitBreaker<I>,
    limiter: SendRateLimiter<I>,
    latencies: VecDeque<u64>,
    stats: QueueStats,
}

impl<I: Instant> DeliveryQueue<I> {
    /// Empty queue owned by `server_id`.
    pub fn new(server_id: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            server_id: server_id.into(),
            lanes: Lanes::new(),
            scheduled: HashMap::new(),
            schedule_timers: TimerWheel::new(),
            in_flight: HashMap::new(),
            ack_timers: TimerWheel::new(),
            waiting: HashMap::new(),
            retry_timers: TimerWheel::new(),
            recipients: HashMap::new(),
            settled: Settled::new(config.dead_letter_capacity),
            dead_letters: DeadLetterStore::new(config.dead_letter_capacity),
            breaker: CircuitBreaker::new(config.breaker()),
            limiter: SendRateLimiter::new(config.send_limits()),
            latencies: VecDeque::new(),
            stats: QueueStats::default(),
            config,
        }
    }

    /// Count one send by `user_id` against its rate limits.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if the user is over a window or serving a penalty
    pub fn check_rate(&mut self, user_id: &str, now: I) -> Result<(), QueueError> {
        self.limiter.check(user_id, now).map_err(|retry_after| {
            self.stats.rate_limited += 1;
            tracing::debug!(user_id, ?retry_after, "send rate limited");
            QueueError::RateLimited { retry_after }
        })
    }

    /// Admit a message.
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` while the delivery breaker is open
    /// - `InvalidMessage` if a required field is missing
    /// - `Storage` if a guaranteed message could not be persisted
    pub fn enqueue<B: Broker>(
        &mut self,
        message: QueueMessage,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> Result<String, QueueError> {
        if self.breaker.is_open(now) {
            self.stats.rejected_open += 1;
            return Err(QueueError::CircuitOpen { retry_after: self.breaker.remaining_open(now) });
        }
        if let Err(e) = message.validate() {
            self.stats.rejected_invalid += 1;
            return Err(e);
        }

        if message.delivery.guarantee_delivery
            && let Err(e) = self.store(&message, broker, now_ms)
        {
            self.breaker.record_failure(now);
            return Err(e);
        }

        let id = message.id.clone();
        tracing::debug!(
            message_id = %id,
            priority = message.priority.as_str(),
            guaranteed = message.delivery.guarantee_delivery,
            scheduled_for_ms = message.metadata.scheduled_for_ms,
            "message enqueued"
        );
        self.admit(message, now, now_ms);
        self.stats.enqueued += 1;
        Ok(id)
    }

    /// Into its lane, or onto the schedule if it is not due yet.
    fn admit(&mut self, message: QueueMessage, now: I, now_ms: u64) {
        match message.metadata.scheduled_for_ms {
            Some(at) if at > now_ms => {
                let deadline = now + Duration::from_millis(at - now_ms);
                self.schedule_timers.schedule(message.id.clone(), deadline);
                self.scheduled.insert(message.id.clone(), message);
            },
            _ => self.lanes.push(message),
        }
    }

    fn record_ttl(&self, message: &QueueMessage) -> u64 {
        if message.delivery.persist_until_read && message.message_type == MessageType::Chat {
            self.config.persisted_chat_ttl_ms
        } else {
            self.config.message_ttl_ms
        }
    }

    fn store<B: Broker>(
        &self,
        message: &QueueMessage,
        broker: &B,
        now_ms: u64,
    ) -> Result<(), QueueError> {
        let bytes = message.to_bytes()?;
        let expires_at_ms = message.metadata.created_at_ms.max(now_ms) + self.record_ttl(message);
        broker
            .set(&QueueMessage::key(&message.id), &bytes, Some(expires_at_ms))
            .map_err(|e| QueueError::Storage(e.to_string()))
    }

    /// Best-effort record update; failures are logged.
    fn sync_record<B: Broker>(&self, message: &QueueMessage, broker: &B, now_ms: u64) {
        if !message.delivery.guarantee_delivery {
            return;
        }
        if let Err(e) = self.store(message, broker, now_ms) {
            tracing::warn!(message_id = %message.id, error = %e, "message record update failed");
        }
    }

    fn forget<B: Broker>(&self, message: &QueueMessage, broker: &B) {
        if !message.delivery.guarantee_delivery {
            return;
        }
        if let Err(e) = broker.delete(&QueueMessage::key(&message.id)) {
            tracing::warn!(message_id = %message.id, error = %e, "message record delete failed");
        }
    }

    /// Run one processing tick.
    ///
    /// Fires due schedule, ack and retry timers, then takes one batch from the
    /// highest non-empty lane and hands each message to `deliver`.
    pub fn process_tick<B, F>(
        &mut self,
        now: I,
        now_ms: u64,
        broker: &B,
        mut deliver: F,
    ) -> TickReport
    where
        B: Broker,
        F: FnMut(&QueueMessage) -> Result<Dispatch, QueueError>,
    {
        let mut report = TickReport::default();

        for id in self.ack_timers.poll_expired(now) {
            let Some(message) = self.in_flight.remove(&id) else {
                continue;
            };
            self.stats.timeouts += 1;
            let reason = QueueError::DeliveryTimeout { message_id: id }.to_string();
            match self.retry_or_fail(message, &reason, broker, now, now_ms) {
                Some(notice) => report.failed.push(notice),
                None => report.retried += 1,
            }
        }

        for id in self.retry_timers.poll_expired(now) {
            if let Some(message) = self.waiting.remove(&id) {
                self.lanes.push(message);
            }
        }

        for id in self.schedule_timers.poll_expired(now) {
            if let Some(message) = self.scheduled.remove(&id) {
                self.lanes.push(message);
            }
        }

        let Some((priority, batch)) = self.lanes.next_batch(self.config.batch_size) else {
            return report;
        };
        report.lane = Some(priority);
        report.taken = batch.len();

        let mut remaining = VecDeque::from(batch);
        while let Some(mut message) = remaining.pop_front() {
            if message.is_expired(now_ms) {
                self.expire(message, broker, now_ms, &mut report);
                continue;
            }
            if message.is_scheduled_later(now_ms) {
                self.admit(message, now, now_ms);
                continue;
            }

            match deliver(&message) {
                Ok(dispatch) => {
                    self.breaker.record_success(now);
                    self.on_sent(&mut message, dispatch, broker, now, now_ms);
                    report.sent += 1;
                },
                Err(e) => {
                    self.breaker.record_failure(now);
                    self.stats.errors += 1;
                    tracing::error!(
                        message_id = %message.id,
                        error = %e,
                        breaker = ?self.breaker.current_state(),
                        "delivery failed, ending tick"
                    );
                    remaining.push_front(message);
                    self.lanes.requeue_front(priority, Vec::from(remaining));
                    report.error = Some(e);
                    break;
                },
            }
        }
        report
    }

    fn on_sent<B: Broker>(
        &mut self,
        message: &mut QueueMessage,
        dispatch: Dispatch,
        broker: &B,
        now: I,
        now_ms: u64,
    ) {
        message.metadata.attempts += 1;
        if let Err(e) = message.transition(MessageStatus::Sent, now_ms, &self.server_id) {
            tracing::warn!(message_id = %message.id, error = %e, "unexpected status");
        }
        self.stats.sent += 1;
        tracing::trace!(
            message_id = %message.id,
            reached = dispatch.reached,
            attempt = message.metadata.attempts,
            "message sent"
        );

        if message.delivery.require_ack {
            let deadline = now + Duration::from_millis(message.delivery.timeout_ms);
            self.ack_timers.schedule(message.id.clone(), deadline);
            self.in_flight.insert(message.id.clone(), message.clone());
            self.recipients.insert(message.id.clone(), dispatch.recipients);
            return;
        }

        self.record_latency(now_ms.saturating_sub(message.metadata.created_at_ms));
        if message.delivery.persist_until_read {
            self.sync_record(message, broker, now_ms);
        } else {
            self.forget(message, broker);
        }
        self.settled.insert(message.id.clone(), MessageStatus::Sent, None);
    }

    fn expire<B: Broker>(
        &mut self,
        mut message: QueueMessage,
        broker: &B,
        now_ms: u64,
        report: &mut TickReport,
    ) {
        if let Err(e) = message.transition(MessageStatus::Expired, now_ms, &self.server_id) {
            tracing::warn!(message_id = %message.id, error = %e, "unexpected status");
        }
        self.stats.expired += 1;
        self.recipients.remove(&message.id);
        self.sync_record(&message, broker, now_ms);
        self.settled.insert(message.id.clone(), MessageStatus::Expired, None);
        tracing::debug!(message_id = %message.id, "message expired");
        report.failed.push(FailureNotice {
            message_id: message.id,
            from: message.routing.from,
            reason: "expired".to_string(),
            attempts: message.metadata.attempts,
            status: MessageStatus::Expired,
        });
    }

    /// Schedule another attempt, or dead-letter the message when its
    /// attempts are used up. Returns the failure notice in the latter case.
    fn retry_or_fail<B: Broker>(
        &mut self,
        mut message: QueueMessage,
        reason: &str,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> Option<FailureNotice> {
        if message.retries_exhausted() {
            if let Err(e) = message.transition(MessageStatus::Failed, now_ms, &self.server_id) {
                tracing::warn!(message_id = %message.id, error = %e, "unexpected status");
            }
            self.stats.dead_lettered += 1;
            self.recipients.remove(&message.id);
            self.sync_record(&message, broker, now_ms);
            self.settled.insert(message.id.clone(), MessageStatus::Failed, None);
            tracing::warn!(
                message_id = %message.id,
                attempts = message.metadata.attempts,
                reason,
                "message dead-lettered"
            );
            let notice = FailureNotice {
                message_id: message.id.clone(),
                from: message.routing.from.clone(),
                reason: reason.to_string(),
                attempts: message.metadata.attempts,
                status: MessageStatus::Failed,
            };
            self.dead_letters.push(DeadLetter {
                message,
                reason: reason.to_string(),
                failed_at_ms: now_ms,
            });
            return Some(notice);
        }

        if let Err(e) = message.transition(MessageStatus::Pending, now_ms, &self.server_id) {
            tracing::warn!(message_id = %message.id, error = %e, "unexpected status");
        }
        let delay = backoff::retry_delay(
            Duration::from_millis(message.delivery.retry_delay_ms),
            message.metadata.attempts,
        );
        self.retry_timers.schedule(message.id.clone(), now + delay);
        tracing::debug!(message_id = %message.id, attempts = message.metadata.attempts, ?delay, "retry scheduled");
        self.waiting.insert(message.id.clone(), message);
        self.stats.retried += 1;
        None
    }

    /// Apply a `message:ack` from `ack.user_id`. Idempotent: a repeated ack
    /// changes nothing, and neither does an ack from a user the message was
    /// not addressed to.
    pub fn acknowledge<B: Broker>(
        &mut self,
        ack: &MessageAck,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> AckOutcome {
        let id = ack.message_id.as_str();
        let user = ack.user_id.as_str();

        if let Some(entry) = self.settled.get(id) {
            let upgrade = entry.status == MessageStatus::Delivered && ack.status == AckStatus::Read;
            if !upgrade {
                self.stats.duplicate_acks += 1;
                return AckOutcome::Duplicate;
            }
            if !entry.recipients.as_ref().is_some_and(|r| r.contains(user)) {
                return self.refuse(id, user);
            }
            if let Err(e) = broker.delete(&QueueMessage::key(id)) {
                tracing::warn!(message_id = id, error = %e, "message record delete failed");
            }
            self.settled.insert(id.to_string(), MessageStatus::Acknowledged, None);
            self.stats.acknowledged += 1;
            return AckOutcome::Settled(MessageStatus::Acknowledged);
        }

        if !self.in_flight.contains_key(id) && !self.waiting.contains_key(id) {
            return AckOutcome::Unknown;
        }
        if !self.recipients.get(id).is_some_and(|r| r.contains(user)) {
            return self.refuse(id, user);
        }

        let message = if let Some(m) = self.in_flight.remove(id) {
            self.ack_timers.cancel(&ack.message_id);
            m
        } else if let Some(m) = self.waiting.remove(id) {
            self.retry_timers.cancel(&ack.message_id);
            m
        } else {
            return AckOutcome::Unknown;
        };

        match ack.status {
            AckStatus::Failed => {
                let reason = ack.error.clone().unwrap_or_else(|| "client reported failure".into());
                match self.retry_or_fail(message, &reason, broker, now, now_ms) {
                    Some(notice) => AckOutcome::DeadLettered(notice),
                    None => AckOutcome::Retrying,
                }
            },
            AckStatus::Delivered => {
                self.settle(message, MessageStatus::Delivered, broker, now_ms);
                AckOutcome::Settled(MessageStatus::Delivered)
            },
            AckStatus::Read => {
                self.settle(message, MessageStatus::Acknowledged, broker, now_ms);
                AckOutcome::Settled(MessageStatus::Acknowledged)
            },
        }
    }

    fn refuse(&mut self, id: &str, user: &str) -> AckOutcome {
        self.stats.foreign_acks += 1;
        tracing::debug!(message_id = id, user_id = user, "ack from non-recipient ignored");
        AckOutcome::NotRecipient
    }

    fn settle<B: Broker>(
        &mut self,
        mut message: QueueMessage,
        status: MessageStatus,
        broker: &B,
        now_ms: u64,
    ) {
        if let Err(e) = message.transition(status, now_ms, &self.server_id) {
            tracing::warn!(message_id = %message.id, error = %e, "unexpected status");
        }
        self.record_latency(now_ms.saturating_sub(message.metadata.created_at_ms));

        let keep = status == MessageStatus::Delivered && message.delivery.persist_until_read;
        if keep {
            self.sync_record(&message, broker, now_ms);
        } else {
            self.forget(&message, broker);
        }

        match status {
            MessageStatus::Acknowledged => self.stats.acknowledged += 1,
            _ => self.stats.delivered += 1,
        }
        tracing::debug!(message_id = %message.id, ?status, "message settled");
        let recipients = self.recipients.remove(&message.id);
        let recipients = if status == MessageStatus::Delivered { recipients } else { None };
        self.settled.insert(message.id, status, recipients);
    }

    /// Re-admit this instance's unfinished durable records.
    ///
    /// Pending and sent records go back to their lanes as pending, or onto the
    /// schedule if not due yet; delivered and terminal records are left alone.
    ///
    /// # Errors
    ///
    /// - `Storage` if the broker cannot list records
    pub fn recover<B: Broker>(
        &mut self,
        broker: &B,
        now: I,
        now_ms: u64,
    ) -> Result<usize, QueueError> {
        let mut keys = broker
            .keys("message:", now_ms)
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        keys.sort();

        let mut recovered = 0;
        for key in keys {
            let bytes = match broker.get(&key, now_ms) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => return Err(QueueError::Storage(e.to_string())),
            };
            let mut message = match QueueMessage::from_bytes(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(key, error = %e, "unreadable message record");
                    continue;
                },
            };
            if message.metadata.server_id != self.server_id || self.is_tracked(&message.id) {
                continue;
            }
            match message.metadata.status {
                MessageStatus::Pending => {},
                MessageStatus::Sent => {
                    if let Err(e) =
                        message.transition(MessageStatus::Pending, now_ms, &self.server_id)
                    {
                        tracing::warn!(key, error = %e, "unexpected status");
                        continue;
                    }
                },
                _ => continue,
            }
            self.admit(message, now, now_ms);
            self.stats.enqueued += 1;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(recovered, "durable messages re-admitted");
        }
        Ok(recovered)
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
            || self.waiting.contains_key(id)
            || self.scheduled.contains_key(id)
            || self.settled.get(id).is_some()
            || self.lanes.contains(id)
    }

    fn record_latency(&mut self, ms: u64) {
        if self.config.latency_samples == 0 {
            return;
        }
        while self.latencies.len() >= self.config.latency_samples {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    /// A message that is in flight, waiting out a retry or scheduled.
    pub fn get(&self, message_id: &str) -> Option<&QueueMessage> {
        self.in_flight
            .get(message_id)
            .or_else(|| self.waiting.get(message_id))
            .or_else(|| self.scheduled.get(message_id))
    }

    /// Status of a message this instance tracks.
    pub fn status(&self, message_id: &str) -> Option<MessageStatus> {
        match self.get(message_id) {
            Some(m) => Some(m.metadata.status),
            None => self.settled.status(message_id),
        }
    }

    /// Counters.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Depth of each lane, urgent first.
    pub fn lane_depths(&self) -> [usize; 4] {
        self.lanes.depths()
    }

    /// Messages queued in any lane.
    pub fn queued(&self) -> usize {
        self.lanes.len()
    }

    /// Messages awaiting an ack.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Messages waiting out a retry delay.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Messages waiting for their scheduled time.
    pub fn scheduled(&self) -> usize {
        self.scheduled.len()
    }

    /// Dead-letter store.
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Delivery breaker state at `now`.
    pub fn breaker_state(&mut self, now: I) -> BreakerState {
        self.breaker.state(now)
    }

    /// Mean of the recent delivery latency samples.
    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64
    }

    /// Delivery function errors over all attempts.
    pub fn error_rate(&self) -> f64 {
        let attempts = self.stats.sent + self.stats.errors;
        if attempts == 0 {
            return 0.0;
        }
        self.stats.errors as f64 / attempts as f64
    }

    /// Drop stale rate-limit windows.
    pub fn prune(&mut self, now: I) {
        self.limiter.prune(now);
    }

    /// Sent-and-unacked, retrying and scheduled messages.
    pub fn unfinished(&self) -> impl Iterator<Item = &QueueMessage> {
        self.in_flight.values().chain(self.waiting.values()).chain(self.scheduled.values())
    }
}

#[cfg(test)]
mod tests {
    use courier_core::DeliveryOptions;
    use courier_proto::{
        TargetType,
        payloads::queue::{QueueSend, SendOptions},
    };

    use super::*;
    use crate::broker::MemoryBroker;

    type T = Duration;

    fn ms(v: u64) -> T {
        Duration::from_millis(v)
    }

    fn queue() -> DeliveryQueue<T> {
        DeliveryQueue::new("s1", QueueConfig::default())
    }

    fn message(id: &str, priority: Priority, options: SendOptions) -> QueueMessage {
        let send = QueueSend {
            message_type: MessageType::Chat,
            payload: b"hi".to_vec(),
            to: vec!["bob".into()],
            target_type: TargetType::User,
            priority: Some(priority),
            options: Some(options),
        };
        QueueMessage::from_send(
            id.into(),
            "alice".into(),
            send,
            QueueConfig::default().delivery_defaults(),
            0,
            "s1",
        )
    }

    fn acked() -> SendOptions {
        SendOptions { require_ack: Some(true), ..SendOptions::default() }
    }

    fn guaranteed() -> SendOptions {
        SendOptions {
            require_ack: Some(true),
            guarantee_delivery: Some(true),
            ..SendOptions::default()
        }
    }

    fn ack(id: &str, status: AckStatus) -> MessageAck {
        ack_from("bob", id, status)
    }

    fn ack_from(user: &str, id: &str, status: AckStatus) -> MessageAck {
        MessageAck { message_id: id.into(), user_id: user.into(), status, error: None }
    }

    /// Delivery function reaching bob once.
    fn to_bob(_: &QueueMessage) -> Result<Dispatch, QueueError> {
        Ok(Dispatch { reached: 1, recipients: Recipients::users(["bob"]) })
    }

    #[test]
    fn one_lane_per_tick() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        for (i, p) in Priority::ALL.iter().enumerate() {
            q.enqueue(message(&format!("m{i}"), *p, SendOptions::default()), &broker, ms(0), 0)
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let report = q.process_tick(ms(0), 0, &broker, |m| {
                seen.push(m.id.clone());
                to_bob(m)
            });
            assert_eq!(report.sent, 1);
        }
        assert_eq!(seen, ["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn ack_timeout_retries_then_dead_letters() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Normal, acked()), &broker, ms(0), 0).unwrap();

        let mut now = 0;
        let mut attempts = 0;
        let mut failed = Vec::new();
        for _ in 0..200 {
            let report = q.process_tick(ms(now), now, &broker, |m| {
                attempts += 1;
                to_bob(m)
            });
            failed.extend(report.failed);
            now += 1_000;
        }

        assert_eq!(attempts, 3);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(q.status("m"), Some(MessageStatus::Failed));
        assert_eq!(q.dead_letters().len(), 1);
        assert_eq!(q.stats().timeouts, 3);
    }

    #[test]
    fn duplicate_ack_changes_nothing() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Normal, acked()), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);

        let first = q.acknowledge(&ack("m", AckStatus::Read), &broker, ms(5), 5);
        assert_eq!(first, AckOutcome::Settled(MessageStatus::Acknowledged));
        let stats = q.stats();

        let second = q.acknowledge(&ack("m", AckStatus::Read), &broker, ms(6), 6);
        assert_eq!(second, AckOutcome::Duplicate);
        assert_eq!(q.status("m"), Some(MessageStatus::Acknowledged));
        assert_eq!(q.stats().acknowledged, stats.acknowledged);
        assert_eq!(q.in_flight(), 0);

        // The ack timer was cancelled with the ack
        let report = q.process_tick(ms(60_000), 60_000, &broker, to_bob);
        assert!(report.failed.is_empty());
        assert_eq!(report.retried, 0);
    }

    #[test]
    fn delivered_then_read() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let options = SendOptions { persist_until_read: Some(true), ..guaranteed() };
        q.enqueue(message("m", Priority::Normal, options), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);

        assert_eq!(
            q.acknowledge(&ack("m", AckStatus::Delivered), &broker, ms(1), 1),
            AckOutcome::Settled(MessageStatus::Delivered)
        );
        assert!(broker.get(&QueueMessage::key("m"), 1).unwrap().is_some());

        assert_eq!(
            q.acknowledge(&ack("m", AckStatus::Read), &broker, ms(2), 2),
            AckOutcome::Settled(MessageStatus::Acknowledged)
        );
        assert!(broker.get(&QueueMessage::key("m"), 2).unwrap().is_none());
    }

    #[test]
    fn failed_ack_schedules_backoff_retry() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Normal, acked()), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);

        let outcome = q.acknowledge(&ack("m", AckStatus::Failed), &broker, ms(10), 10);
        assert_eq!(outcome, AckOutcome::Retrying);
        assert_eq!(q.waiting(), 1);

        // First retry waits retry_delay * 2^0
        let report = q.process_tick(ms(1_009), 1_009, &broker, to_bob);
        assert_eq!(report.sent, 0);
        let report = q.process_tick(ms(1_010), 1_010, &broker, to_bob);
        assert_eq!(report.sent, 1);
    }

    #[test]
    fn failed_ack_on_last_attempt_reports_failure() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let options = SendOptions { max_retries: Some(1), ..acked() };
        q.enqueue(message("m", Priority::Normal, options), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);

        let mut failed = ack("m", AckStatus::Failed);
        failed.error = Some("storage full".into());
        let AckOutcome::DeadLettered(notice) = q.acknowledge(&failed, &broker, ms(5), 5) else {
            panic!("expected dead letter");
        };
        assert_eq!(notice.from, "alice");
        assert_eq!(notice.reason, "storage full");
        assert_eq!(notice.attempts, 1);
        assert_eq!(notice.status, MessageStatus::Failed);
        assert_eq!(q.dead_letters().len(), 1);
    }

    #[test]
    fn acks_from_non_recipients_change_nothing() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Normal, guaranteed()), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);

        for status in [AckStatus::Read, AckStatus::Delivered, AckStatus::Failed] {
            let outcome = q.acknowledge(&ack_from("eve", "m", status), &broker, ms(1), 1);
            assert_eq!(outcome, AckOutcome::NotRecipient);
        }
        assert_eq!(q.status("m"), Some(MessageStatus::Sent));
        assert_eq!(q.in_flight(), 1);
        assert!(broker.get(&QueueMessage::key("m"), 1).unwrap().is_some());
        assert_eq!(q.stats().foreign_acks, 3);

        assert_eq!(
            q.acknowledge(&ack("m", AckStatus::Read), &broker, ms(2), 2),
            AckOutcome::Settled(MessageStatus::Acknowledged)
        );
    }

    #[test]
    fn read_upgrade_needs_a_recipient() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let options = SendOptions { persist_until_read: Some(true), ..guaranteed() };
        q.enqueue(message("m", Priority::Normal, options), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);
        q.acknowledge(&ack("m", AckStatus::Delivered), &broker, ms(1), 1);

        let forged = q.acknowledge(&ack_from("eve", "m", AckStatus::Read), &broker, ms(2), 2);
        assert_eq!(forged, AckOutcome::NotRecipient);
        assert_eq!(q.status("m"), Some(MessageStatus::Delivered));
        assert!(broker.get(&QueueMessage::key("m"), 2).unwrap().is_some());
    }

    #[test]
    fn broadcast_accepts_any_ack() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Normal, acked()), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, |_| {
            Ok(Dispatch { reached: 3, recipients: Recipients::Anyone })
        });
        assert_eq!(
            q.acknowledge(&ack_from("carol", "m", AckStatus::Delivered), &broker, ms(1), 1),
            AckOutcome::Settled(MessageStatus::Delivered)
        );
    }

    #[test]
    fn expired_messages_dropped_without_attempt() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let options = SendOptions { expires_at_ms: Some(100), ..SendOptions::default() };
        q.enqueue(message("m", Priority::Normal, options), &broker, ms(0), 0).unwrap();

        let report = q.process_tick(ms(100), 100, &broker, to_bob);
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed[0].status, MessageStatus::Expired);
        assert_eq!(q.stats().expired, 1);
    }

    #[test]
    fn scheduled_messages_wait() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let options = SendOptions { scheduled_for_ms: Some(500), ..SendOptions::default() };
        q.enqueue(message("m", Priority::Normal, options), &broker, ms(0), 0).unwrap();

        assert_eq!(q.process_tick(ms(0), 0, &broker, to_bob).sent, 0);
        assert_eq!(q.queued(), 0);
        assert_eq!(q.scheduled(), 1);
        assert_eq!(q.process_tick(ms(500), 500, &broker, to_bob).sent, 1);
        assert_eq!(q.scheduled(), 0);
    }

    #[test]
    fn future_urgent_message_does_not_hold_up_lower_lanes() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let hour = 60 * 60 * 1_000;
        let later = SendOptions { scheduled_for_ms: Some(hour), ..SendOptions::default() };
        q.enqueue(message("later", Priority::Urgent, later), &broker, ms(0), 0).unwrap();
        q.enqueue(message("now", Priority::Normal, SendOptions::default()), &broker, ms(0), 0)
            .unwrap();

        let mut sent = Vec::new();
        for tick in 0..50 {
            q.process_tick(ms(tick), tick, &broker, |m| {
                sent.push(m.id.clone());
                to_bob(m)
            });
        }
        assert_eq!(sent, ["now"]);
        assert_eq!(q.lane_depths(), [0, 0, 0, 0]);

        q.process_tick(ms(hour), hour, &broker, |m| {
            sent.push(m.id.clone());
            to_bob(m)
        });
        assert_eq!(sent, ["now", "later"]);
    }

    #[test]
    fn delivery_errors_open_breaker_and_requeue() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("a", Priority::High, SendOptions::default()), &broker, ms(0), 0).unwrap();
        q.enqueue(message("b", Priority::High, SendOptions::default()), &broker, ms(0), 0).unwrap();

        for i in 0..5 {
            let report = q.process_tick(ms(i), i, &broker, |_| {
                Err(QueueError::Storage("fanout failed".into()))
            });
            assert!(report.error.is_some());
            assert_eq!(q.queued(), 2);
        }

        let refused = q.enqueue(message("c", Priority::Low, SendOptions::default()), &broker, ms(5), 5);
        assert!(matches!(refused, Err(QueueError::CircuitOpen { .. })));
        assert_eq!(q.breaker_state(ms(5)), BreakerState::Open);

        // After recovery one probe succeeds and closes the breaker
        let report = q.process_tick(ms(30_005), 30_005, &broker, to_bob);
        assert_eq!(report.sent, 2);
        assert_eq!(q.breaker_state(ms(30_005)), BreakerState::Closed);
    }

    #[test]
    fn invalid_message_rejected() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        let mut m = message("m", Priority::Normal, SendOptions::default());
        m.routing.to.clear();
        assert!(matches!(
            q.enqueue(m, &broker, ms(0), 0),
            Err(QueueError::InvalidMessage(_))
        ));
        assert_eq!(q.queued(), 0);
    }

    #[test]
    fn guaranteed_message_survives_restart() {
        let broker = MemoryBroker::new();
        let mut q = queue();
        q.enqueue(message("m", Priority::Urgent, guaranteed()), &broker, ms(0), 0).unwrap();
        q.process_tick(ms(0), 0, &broker, to_bob);
        drop(q);

        let mut restarted = queue();
        assert_eq!(restarted.recover(&broker, ms(0), 10).unwrap(), 1);
        let mut delivered = Vec::new();
        restarted.process_tick(ms(0), 10, &broker, |m| {
            delivered.push(m.id.clone());
            to_bob(m)
        });
        assert_eq!(delivered, ["m"]);

        // Another instance's records are not touched
        let mut other = DeliveryQueue::<T>::new("s2", QueueConfig::default());
        assert_eq!(other.recover(&broker, ms(0), 10).unwrap(), 0);
    }

    #[test]
    fn guaranteed_enqueue_fails_when_broker_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let mut q = queue();
        let result = q.enqueue(message("m", Priority::Normal, guaranteed()), &broker, ms(0), 0);
        assert!(matches!(result, Err(QueueError::Storage(_))));
        assert_eq!(q.queued(), 0);

        // Best-effort messages never touch the broker
        let plain = DeliveryOptions::default();
        let mut m = message("n", Priority::Normal, SendOptions::default());
        m.delivery = plain;
        assert!(q.enqueue(m, &broker, ms(0), 0).is_ok());
    }

    #[test]
    fn rate_limit_penalty() {
        let mut q = queue();
        for _ in 0..10 {
            q.check_rate("alice", ms(0)).unwrap();
        }
        let err = q.check_rate("alice", ms(0)).unwrap_err();
        let QueueError::RateLimited { retry_after } = err else {
            panic!("expected rate limit, got {err:?}");
        };
        assert_eq!(retry_after, ms(30_000));
        assert!(q.check_rate("alice", ms(29_999)).is_err());
        assert!(q.check_rate("alice", ms(30_000)).is_ok());
    }
}
