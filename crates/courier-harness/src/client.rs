//! Payload builders for simulated clients.

use courier_proto::{
    AckStatus, DeviceType, FrameHeader, MessageType, Payload, Priority, RoomKind, TargetType,
    payloads::{
        moderation::ModerationRequest,
        queue::{MessageAck, QueueSend, SendOptions},
        room::{RoomCreate, RoomJoin, RoomLeave},
        session::{Goodbye, Hello},
    },
};

/// Handshake for `user`, optionally resuming `session_id`.
pub fn hello(user: &str, session_id: Option<&str>) -> Payload {
    Payload::Hello(Hello {
        version: FrameHeader::VERSION,
        user_id: user.to_string(),
        device_id: format!("{user}-sim"),
        device_type: DeviceType::Desktop,
        session_id: session_id.map(str::to_string),
    })
}

/// Chat message to one or more targets.
pub fn chat(target_type: TargetType, to: &[&str], text: &str) -> Payload {
    send(target_type, to, text, None, None)
}

/// Chat message with explicit priority and delivery options.
pub fn send(
    target_type: TargetType,
    to: &[&str],
    text: &str,
    priority: Option<Priority>,
    options: Option<SendOptions>,
) -> Payload {
    Payload::QueueSend(QueueSend {
        message_type: MessageType::Chat,
        payload: text.as_bytes().to_vec(),
        to: to.iter().map(|t| (*t).to_string()).collect(),
        target_type,
        priority,
        options,
    })
}

/// Options for a message that must survive an instance crash.
pub fn guaranteed() -> SendOptions {
    SendOptions { guarantee_delivery: Some(true), ..SendOptions::default() }
}

/// Public community room.
pub fn create_room(room_id: &str) -> Payload {
    Payload::RoomCreate(RoomCreate {
        room_id: room_id.to_string(),
        kind: RoomKind::Community,
        private: false,
        parent_id: None,
        password: None,
    })
}

/// Join without a password.
pub fn join(room_id: &str) -> Payload {
    Payload::RoomJoin(RoomJoin { room_id: room_id.to_string(), password: None })
}

/// Leave a room.
pub fn leave(room_id: &str) -> Payload {
    Payload::RoomLeave(RoomLeave { room_id: room_id.to_string() })
}

/// Permanent ban.
pub fn ban(room_id: &str, user: &str) -> Payload {
    Payload::Ban(moderation(room_id, user, None))
}

/// Lift a ban.
pub fn unban(room_id: &str, user: &str) -> Payload {
    Payload::Unban(moderation(room_id, user, None))
}

/// Lift a mute.
pub fn unmute(room_id: &str, user: &str) -> Payload {
    Payload::Unmute(moderation(room_id, user, None))
}

/// Kick.
pub fn kick(room_id: &str, user: &str) -> Payload {
    Payload::Kick(moderation(room_id, user, None))
}

/// Mute for `duration_ms`.
pub fn mute(room_id: &str, user: &str, duration_ms: u64) -> Payload {
    Payload::Mute(moderation(room_id, user, Some(duration_ms)))
}

fn moderation(room_id: &str, user: &str, duration_ms: Option<u64>) -> ModerationRequest {
    ModerationRequest {
        room_id: room_id.to_string(),
        target_user_id: user.to_string(),
        reason: None,
        duration_ms,
    }
}

/// Acknowledge a delivery. The server fills in the user.
pub fn ack(message_id: &str, status: AckStatus) -> Payload {
    Payload::MessageAck(MessageAck {
        message_id: message_id.to_string(),
        user_id: String::new(),
        status,
        error: None,
    })
}

/// Polite disconnect keeping the session restorable.
pub fn goodbye() -> Payload {
    Payload::Goodbye(Goodbye { reason: "client closing".to_string() })
}

/// Logout destroying the session.
pub fn logout() -> Payload {
    Payload::Goodbye(Goodbye { reason: Goodbye::LOGOUT.to_string() })
}
