//! Fabric wire envelope.
//!
//! Every message crossing the broker is wrapped in an [`Envelope`] tagged with
//! the publishing instance, a unique id and a wall-clock timestamp. Bodies
//! above the compression threshold are zlib-compressed.

use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Deserialize, Serialize};

use super::{FabricError, FabricMessage};

/// Upper bound on a decompressed body.
const MAX_BODY: u64 = 16 * 1024 * 1024;

/// Identity of one published message for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    /// Concrete channel the message arrived on
    pub channel: String,
    /// Message kind
    pub kind: String,
    /// Publisher wall clock (Unix millis)
    pub timestamp_ms: u64,
    /// Publishing instance
    pub server_id: String,
    /// Envelope id
    pub id: String,
}

/// Tagged, optionally compressed fabric message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per publish
    pub id: String,
    /// Publishing instance
    pub server_id: String,
    /// Publish time (Unix millis)
    pub timestamp_ms: u64,
    /// [`FabricMessage::kind`] of the body
    pub kind: String,
    /// Body is zlib-compressed
    pub compressed: bool,
    /// CBOR-encoded [`FabricMessage`]
    pub body: Vec<u8>,
    /// Receivers drop the message after this time (Unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl Envelope {
    /// Wrap `message`, compressing the body when it exceeds
    /// `compress_threshold` bytes. A threshold of `None` disables compression.
    pub fn seal(
        message: &FabricMessage,
        id: String,
        server_id: String,
        timestamp_ms: u64,
        expires_at_ms: Option<u64>,
        compress_threshold: Option<usize>,
    ) -> Result<Self, FabricError> {
        let mut body = Vec::new();
        ciborium::into_writer(message, &mut body).map_err(|e| FabricError::Codec(e.to_string()))?;

        let compressed = compress_threshold.is_some_and(|threshold| body.len() > threshold);
        if compressed {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(&body).map_err(|e| FabricError::Codec(e.to_string()))?;
            body = encoder.finish().map_err(|e| FabricError::Codec(e.to_string()))?;
        }

        Ok(Self {
            id,
            server_id,
            timestamp_ms,
            kind: message.kind().to_string(),
            compressed,
            body,
            expires_at_ms,
        })
    }

    /// Decode the body.
    pub fn open(&self) -> Result<FabricMessage, FabricError> {
        if !self.compressed {
            return ciborium::from_reader(self.body.as_slice())
                .map_err(|e| FabricError::Codec(e.to_string()));
        }

        let mut plain = Vec::new();
        ZlibDecoder::new(self.body.as_slice())
            .take(MAX_BODY + 1)
            .read_to_end(&mut plain)
            .map_err(|e| FabricError::Codec(e.to_string()))?;
        if plain.len() as u64 > MAX_BODY {
            return Err(FabricError::Codec("decompressed body too large".to_string()));
        }
        ciborium::from_reader(plain.as_slice()).map_err(|e| FabricError::Codec(e.to_string()))
    }

    /// Past its expiry at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    /// Duplicate-suppression key for a copy received on `channel`.
    pub fn dedupe_key(&self, channel: &str) -> DedupeKey {
        DedupeKey {
            channel: channel.to_string(),
            kind: self.kind.clone(),
            timestamp_ms: self.timestamp_ms,
            server_id: self.server_id.clone(),
            id: self.id.clone(),
        }
    }

    /// Broker payload bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FabricError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| FabricError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Parse broker payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FabricError> {
        ciborium::from_reader(bytes).map_err(|e| FabricError::Codec(e.to_string()))
    }
}
