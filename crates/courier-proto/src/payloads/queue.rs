//! Message queue payloads: send, enqueue confirmation, delivery, ack.

use serde::{Deserialize, Serialize};

use crate::types::{AckStatus, MessageType, Priority, TargetType};

/// `queue:send`, a client asks the server to route a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSend {
    /// Message category
    pub message_type: MessageType,
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// Recipients: user ids, room ids or server ids depending on `target_type`
    pub to: Vec<String>,
    /// How `to` is interpreted
    pub target_type: TargetType,
    /// Lane; `Normal` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Delivery overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SendOptions>,
}

/// Per-message delivery overrides. Unset fields take the server defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Persist before admitting so a crash cannot lose the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guarantee_delivery: Option<bool>,
    /// Expect a `message:ack` from each recipient socket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    /// Retries before dead-lettering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Base retry delay; doubled per attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Ack window per attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Keep the stored copy until a `read` ack arrives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_until_read: Option<bool>,
    /// Do not deliver before this wall-clock time (Unix millis)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for_ms: Option<u64>,
    /// Drop instead of delivering after this wall-clock time (Unix millis)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

/// `queue:enqueued`, the message was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnqueued {
    /// Server-assigned message id
    pub message_id: String,
}

/// A routed message pushed to a recipient socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Message id, echoed in `message:ack`
    pub message_id: String,
    /// Message category
    pub message_type: MessageType,
    /// Lane it was delivered from
    pub priority: Priority,
    /// Sending user
    pub from: String,
    /// Room the message was addressed to, for room-targeted messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// When the message was enqueued (Unix millis)
    pub created_at_ms: u64,
    /// Whether the server is waiting for an ack
    pub require_ack: bool,
}

/// `message:ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Message being acknowledged
    pub message_id: String,
    /// Acknowledging user
    pub user_id: String,
    /// Delivery outcome on the client
    pub status: AckStatus,
    /// Client-side error, when `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `message:failed`, delivery was abandoned after exhausting retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailed {
    /// Failed message
    pub message_id: String,
    /// Why delivery stopped
    pub reason: String,
    /// Attempts made
    pub attempts: u32,
}
