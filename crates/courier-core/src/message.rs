//! Queued message model.
//!
//! A [`QueueMessage`] is the unit of routed work. Its status only moves
//! forward, with one exception: an unacknowledged message is re-queued to
//! `Pending` for another attempt. Terminal states are never reopened.

use courier_proto::{
    MessageType, Priority, TargetType,
    payloads::queue::{Delivery, QueueSend},
};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting in a lane
    Pending,
    /// Pushed to at least one socket or published to peers
    Sent,
    /// Receipt confirmed by a client
    Delivered,
    /// Fully acknowledged. Terminal.
    Acknowledged,
    /// Retries exhausted or rejected. Terminal.
    Failed,
    /// Passed its expiry before delivery. Terminal.
    Expired,
}

impl MessageStatus {
    /// Whether the status can never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed | Self::Expired)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Acknowledged | Self::Failed | Self::Expired => 3,
        }
    }

    /// Whether `self -> next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            // Re-queue after an ack timeout
            Self::Pending => matches!(self, Self::Sent | Self::Delivered),
            _ => next.rank() > self.rank(),
        }
    }
}

/// Who sends to whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    /// Sending user
    pub from: String,
    /// Recipients (users, rooms or servers depending on `target_type`)
    pub to: Vec<String>,
    /// How `to` is interpreted
    pub target_type: TargetType,
}

/// Delivery guarantees requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Persist before admitting
    pub guarantee_delivery: bool,
    /// Arm an ack timer per attempt
    pub require_ack: bool,
    /// Attempts before dead-lettering
    pub max_retries: u32,
    /// Base redelivery delay (millis), doubled per attempt
    pub retry_delay_ms: u64,
    /// Ack window per attempt (millis)
    pub timeout_ms: u64,
    /// Keep the stored copy until a `read` ack
    pub persist_until_read: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            guarantee_delivery: false,
            require_ack: false,
            max_retries: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 30_000,
            persist_until_read: false,
        }
    }
}

/// Ceilings on what a client may request for its own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryLimits {
    /// Highest lane a client may use; higher requests are downgraded
    pub priority_ceiling: Priority,
    /// Delivery attempts
    pub max_retries: u32,
    /// Base retry delay (millis)
    pub max_retry_delay_ms: u64,
    /// Ack window bounds (millis)
    pub min_timeout_ms: u64,
    /// Ack window bounds (millis)
    pub max_timeout_ms: u64,
    /// How far ahead a message may be scheduled (millis)
    pub max_schedule_ahead_ms: u64,
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self {
            priority_ceiling: Priority::High,
            max_retries: 10,
            max_retry_delay_ms: 60_000,
            min_timeout_ms: 1_000,
            max_timeout_ms: 5 * 60 * 1_000,
            max_schedule_ahead_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// One step in a message's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// When (Unix millis)
    pub at_ms: u64,
    /// Instance that recorded it
    pub server_id: String,
    /// Status entered
    pub status: MessageStatus,
}

/// Lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Enqueue time (Unix millis)
    pub created_at_ms: u64,
    /// Not deliverable before this time
    pub scheduled_for_ms: Option<u64>,
    /// Dropped as expired after this time
    pub expires_at_ms: Option<u64>,
    /// Delivery attempts made
    pub attempts: u32,
    /// Current status
    pub status: MessageStatus,
    /// Instance that owns delivery
    pub server_id: String,
    /// Status history
    pub trace: Vec<TraceEntry>,
}

/// Unit of routed work.
///
/// # Invariants
///
/// - `metadata.attempts <= delivery.max_retries` while the message is live;
///   exceeding it moves the message to the dead-letter store.
/// - Status transitions follow [`MessageStatus::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique id
    pub id: String,
    /// Category
    pub message_type: MessageType,
    /// Lane
    pub priority: Priority,
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// Addressing
    pub routing: Routing,
    /// Guarantees
    pub delivery: DeliveryOptions,
    /// Bookkeeping
    pub metadata: Metadata,
}

impl QueueMessage {
    /// Build a message from a client `queue:send`, applying `defaults` to
    /// unset options.
    #[must_use]
    pub fn from_send(
        id: String,
        from: String,
        send: QueueSend,
        defaults: DeliveryOptions,
        now_ms: u64,
        server_id: &str,
    ) -> Self {
        let options = send.options.unwrap_or_default();
        let delivery = DeliveryOptions {
            guarantee_delivery: options.guarantee_delivery.unwrap_or(defaults.guarantee_delivery),
            require_ack: options.require_ack.unwrap_or(defaults.require_ack),
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_ms: options.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            timeout_ms: options.timeout_ms.unwrap_or(defaults.timeout_ms),
            persist_until_read: options.persist_until_read.unwrap_or(defaults.persist_until_read),
        };

        Self {
            id,
            message_type: send.message_type,
            priority: send.priority.unwrap_or_default(),
            payload: send.payload,
            routing: Routing { from, to: send.to, target_type: send.target_type },
            delivery,
            metadata: Metadata {
                created_at_ms: now_ms,
                scheduled_for_ms: options.scheduled_for_ms,
                expires_at_ms: options.expires_at_ms,
                attempts: 0,
                status: MessageStatus::Pending,
                server_id: server_id.to_string(),
                trace: vec![TraceEntry {
                    at_ms: now_ms,
                    server_id: server_id.to_string(),
                    status: MessageStatus::Pending,
                }],
            },
        }
    }

    /// Bring client-chosen options within `limits`. Returns true if anything
    /// changed.
    pub fn clamp(&mut self, limits: &DeliveryLimits, now_ms: u64) -> bool {
        let before = (self.priority, self.delivery, self.metadata.scheduled_for_ms);

        self.priority = self.priority.max(limits.priority_ceiling);
        let delivery = &mut self.delivery;
        delivery.max_retries = delivery.max_retries.clamp(1, limits.max_retries.max(1));
        delivery.retry_delay_ms = delivery.retry_delay_ms.min(limits.max_retry_delay_ms);
        delivery.timeout_ms = delivery
            .timeout_ms
            .clamp(limits.min_timeout_ms, limits.max_timeout_ms.max(limits.min_timeout_ms));
        let latest = now_ms.saturating_add(limits.max_schedule_ahead_ms);
        if let Some(at) = self.metadata.scheduled_for_ms.as_mut() {
            *at = (*at).min(latest);
        }

        before != (self.priority, self.delivery, self.metadata.scheduled_for_ms)
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// - `InvalidMessage` if `id`, `routing.from` or `routing.to` is empty
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.id.is_empty() {
            return Err(QueueError::InvalidMessage("missing id".into()));
        }
        if self.routing.from.is_empty() {
            return Err(QueueError::InvalidMessage("missing routing.from".into()));
        }
        if self.routing.to.is_empty() || self.routing.to.iter().any(String::is_empty) {
            return Err(QueueError::InvalidMessage("missing routing.to".into()));
        }
        Ok(())
    }

    /// Move to `next`, recording a trace entry.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the transition is not allowed
    pub fn transition(
        &mut self,
        next: MessageStatus,
        now_ms: u64,
        server_id: &str,
    ) -> Result<(), QueueError> {
        let from = self.metadata.status;
        if !from.can_transition_to(next) {
            return Err(QueueError::InvalidTransition { from, to: next });
        }
        self.metadata.status = next;
        self.metadata.trace.push(TraceEntry {
            at_ms: now_ms,
            server_id: server_id.to_string(),
            status: next,
        });
        Ok(())
    }

    /// Past `expires_at_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.metadata.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    /// Scheduled for a later time.
    #[must_use]
    pub fn is_scheduled_later(&self, now_ms: u64) -> bool {
        self.metadata.scheduled_for_ms.is_some_and(|at| at > now_ms)
    }

    /// Retries left before dead-lettering.
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.metadata.attempts >= self.delivery.max_retries
    }

    /// Wire form pushed to a recipient socket.
    #[must_use]
    pub fn to_delivery(&self) -> Delivery {
        Delivery {
            message_id: self.id.clone(),
            message_type: self.message_type,
            priority: self.priority,
            from: self.routing.from.clone(),
            room_id: match self.routing.target_type {
                TargetType::Room => self.routing.to.first().cloned(),
                _ => None,
            },
            payload: self.payload.clone(),
            created_at_ms: self.metadata.created_at_ms,
            require_ack: self.delivery.require_ack,
        }
    }

    /// Serialize for the broker.
    ///
    /// # Errors
    ///
    /// - `Codec` if CBOR serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| QueueError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a broker record.
    ///
    /// # Errors
    ///
    /// - `Codec` if the bytes are not a message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        ciborium::de::from_reader(bytes).map_err(|e| QueueError::Codec(e.to_string()))
    }

    /// Broker key for a message id.
    #[must_use]
    pub fn key(id: &str) -> String {
        format!("message:{id}")
    }
}

#[cfg(test)]
mod tests {
    use courier_proto::payloads::queue::SendOptions;

    use super::*;

    fn send(to: Vec<&str>) -> QueueSend {
        QueueSend {
            message_type: MessageType::Chat,
            payload: b"hello".to_vec(),
            to: to.into_iter().map(String::from).collect(),
            target_type: TargetType::Room,
            priority: None,
            options: Some(SendOptions {
                require_ack: Some(true),
                max_retries: Some(5),
                ..SendOptions::default()
            }),
        }
    }

    fn message() -> QueueMessage {
        QueueMessage::from_send(
            "m1".into(),
            "alice".into(),
            send(vec!["general"]),
            DeliveryOptions::default(),
            1_000,
            "srv-a",
        )
    }

    #[test]
    fn options_override_defaults() {
        let m = message();
        assert!(m.delivery.require_ack);
        assert_eq!(m.delivery.max_retries, 5);
        assert_eq!(m.delivery.timeout_ms, DeliveryOptions::default().timeout_ms);
        assert_eq!(m.priority, Priority::Normal);
        assert_eq!(m.to_delivery().room_id.as_deref(), Some("general"));
    }

    #[test]
    fn validate_rejects_missing_recipients() {
        let mut m = message();
        m.routing.to.clear();
        assert!(matches!(m.validate(), Err(QueueError::InvalidMessage(_))));

        let mut m = message();
        m.routing.from.clear();
        assert!(matches!(m.validate(), Err(QueueError::InvalidMessage(_))));
    }

    #[test]
    fn requeue_allowed_terminal_is_final() {
        let mut m = message();
        m.transition(MessageStatus::Sent, 2, "srv-a").expect("pending -> sent");
        m.transition(MessageStatus::Pending, 3, "srv-a").expect("requeue");
        m.transition(MessageStatus::Sent, 4, "srv-a").expect("resend");
        m.transition(MessageStatus::Acknowledged, 5, "srv-a").expect("ack");

        for next in [MessageStatus::Pending, MessageStatus::Sent, MessageStatus::Failed] {
            assert!(m.transition(next, 6, "srv-a").is_err());
        }
        assert_eq!(m.metadata.trace.len(), 5);
    }

    #[test]
    fn no_backwards_moves_except_requeue() {
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Pending.can_transition_to(MessageStatus::Pending));
        assert!(MessageStatus::Pending.can_transition_to(MessageStatus::Expired));
        assert!(MessageStatus::Delivered.can_transition_to(MessageStatus::Acknowledged));
    }

    #[test]
    fn clamp_bounds_client_options() {
        let mut m = message();
        m.priority = Priority::Urgent;
        m.delivery.max_retries = u32::MAX;
        m.delivery.retry_delay_ms = u64::MAX;
        m.delivery.timeout_ms = u64::MAX;
        m.metadata.scheduled_for_ms = Some(u64::MAX);

        let limits = DeliveryLimits::default();
        assert!(m.clamp(&limits, 1_000));
        assert_eq!(m.priority, Priority::High);
        assert_eq!(m.delivery.max_retries, limits.max_retries);
        assert_eq!(m.delivery.retry_delay_ms, limits.max_retry_delay_ms);
        assert_eq!(m.delivery.timeout_ms, limits.max_timeout_ms);
        assert_eq!(m.metadata.scheduled_for_ms, Some(1_000 + limits.max_schedule_ahead_ms));

        m.delivery.timeout_ms = 0;
        m.delivery.max_retries = 0;
        m.clamp(&limits, 1_000);
        assert_eq!(m.delivery.timeout_ms, limits.min_timeout_ms);
        assert_eq!(m.delivery.max_retries, 1);
    }

    #[test]
    fn clamp_leaves_reasonable_options_alone() {
        let mut m = message();
        m.priority = Priority::Low;
        m.metadata.scheduled_for_ms = Some(2_000);
        assert!(!m.clamp(&DeliveryLimits::default(), 1_000));
        assert_eq!(m.priority, Priority::Low);
        assert_eq!(m.delivery.max_retries, 5);
    }

    #[test]
    fn expiry_and_schedule() {
        let mut m = message();
        m.metadata.expires_at_ms = Some(5_000);
        m.metadata.scheduled_for_ms = Some(3_000);
        assert!(m.is_scheduled_later(2_000));
        assert!(!m.is_scheduled_later(3_000));
        assert!(!m.is_expired(4_999));
        assert!(m.is_expired(5_000));
    }
}
