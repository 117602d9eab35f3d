//! Enumerations shared between wire payloads and server state.

use serde::{Deserialize, Serialize};

/// Application-level category of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// User chat message
    Chat,
    /// Out-of-band notification
    Notification,
    /// Server-generated message
    System,
    /// Moderation event
    Moderation,
    /// Presence change
    Presence,
    /// Voice channel event
    Voice,
}

/// Delivery priority. Lower lanes are drained only when higher lanes are
/// empty.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drained first
    Urgent,
    /// Ahead of normal traffic
    High,
    /// Default priority
    #[default]
    Normal,
    /// Drained last
    Low,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Self; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    /// Position in drain order (0 is drained first).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Lowercase name, used in channel and key names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Routing target kind for a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// A single user (all of their sockets)
    User,
    /// Members of a room
    Room,
    /// Every socket in a server (community)
    Server,
    /// Every connected socket cluster-wide
    Global,
}

/// Status reported by a client in `message:ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Client received the message
    Delivered,
    /// User has seen the message
    Read,
    /// Client could not process the message
    Failed,
}

/// User presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively connected
    Online,
    /// Connected but inactive
    Idle,
    /// Do not disturb
    Dnd,
    /// Connected but shown as offline to others
    Invisible,
    /// Not connected
    Offline,
}

/// Kind of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Public community channel
    Community,
    /// Direct message
    Dm,
    /// Voice channel
    Voice,
    /// Video channel
    Video,
    /// Thread under another room
    Thread,
    /// Read-mostly announcement channel
    Announcement,
}

impl RoomKind {
    /// Whether members of this room carry voice state.
    #[must_use]
    pub const fn has_voice(self) -> bool {
        matches!(self, Self::Voice | Self::Video)
    }
}

/// Client device class, reported in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Browser client
    Web,
    /// Desktop application
    Desktop,
    /// Mobile application
    Mobile,
    /// Anything else
    Unknown,
}

/// Moderation action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationKind {
    /// Remove from the room, may rejoin
    Kick,
    /// Silence in the room
    Mute,
    /// Remove and blacklist
    Ban,
    /// Lift a mute early
    Unmute,
    /// Lift a ban
    Unban,
}

impl ModerationKind {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kick => "kick",
            Self::Mute => "mute",
            Self::Ban => "ban",
            Self::Unmute => "unmute",
            Self::Unban => "unban",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_drain_order_matches_ord() {
        let mut sorted = Priority::ALL;
        sorted.sort();
        assert_eq!(sorted, Priority::ALL);
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }
}
