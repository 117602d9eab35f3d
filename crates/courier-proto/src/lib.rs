//! Courier wire protocol.
//!
//! Every message between a client and a Courier server is a [`Frame`]: a fixed
//! 16-byte binary [`FrameHeader`] followed by a CBOR-encoded payload. The
//! header carries the [`Opcode`] so the server can dispatch without decoding
//! the payload, and the [`Payload`] enum maps each opcode to exactly one
//! payload struct.
//!
//! Shared enums that appear both on the wire and in server state
//! ([`MessageType`], [`Priority`], [`TargetType`], ...) live in [`types`].

pub mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;
pub mod types;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::{FrameFlags, FrameHeader};
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};
pub use types::{
    AckStatus, DeviceType, MessageType, ModerationKind, PresenceStatus, Priority, RoomKind,
    TargetType,
};

/// ALPN protocol identifier negotiated during the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"courier/1";
