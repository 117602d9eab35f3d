//! Room payloads.

use serde::{Deserialize, Serialize};

use super::{presence::VoiceState, queue::Delivery};
use crate::types::RoomKind;

/// `room:create`. The sender becomes the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreate {
    /// Requested room id
    pub room_id: String,
    /// Room kind
    pub kind: RoomKind,
    /// Private rooms require explicit read permission to join
    #[serde(default)]
    pub private: bool,
    /// Enclosing room (community) for channels and threads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Join password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `room:join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoin {
    /// Room to join
    pub room_id: String,
    /// Password for protected rooms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `room:joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoined {
    /// Room summary
    pub room: RoomInfo,
    /// Current members
    pub members: Vec<MemberInfo>,
    /// Most recent chat messages routed to the room, oldest first
    pub recent_messages: Vec<Delivery>,
}

/// Room summary sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room id
    pub room_id: String,
    /// Room kind
    pub kind: RoomKind,
    /// Whether joining requires read permission
    pub private: bool,
    /// Owning user
    pub owner_id: String,
    /// Enclosing room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// One member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member user id
    pub user_id: String,
    /// Role ids
    pub roles: Vec<String>,
    /// Whether the member is muted
    pub muted: bool,
    /// Voice state, for voice and video rooms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

/// `room:leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomLeave {
    /// Room to leave
    pub room_id: String,
}

/// `room:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomError {
    /// Action that failed (`join`, `create`, `leave`, ...)
    pub action: String,
    /// Human-readable reason
    pub reason: String,
    /// Error code (see [`super::ErrorPayload`] constants)
    pub code: u16,
}

/// Membership change broadcast to the other members of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    /// Room
    pub room_id: String,
    /// Member that joined or left
    pub user_id: String,
    /// True on join, false on leave
    pub joined: bool,
}
