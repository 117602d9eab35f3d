//! Frame header with zero-copy parsing.
//!
//! The header is a fixed 16-byte big-endian structure. The server reads the
//! opcode from it to dispatch a frame before touching the CBOR payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 16-byte frame header (big-endian).
///
/// Fields are stored as byte arrays so the struct has alignment 1 and every
/// 16-byte pattern is a valid value. Validation of magic, version and payload
/// size happens in [`FrameHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],                   // "CRER"
    version: u8,                      // 0x01
    flags: u8,                        // FrameFlags bitfield
    opcode: [u8; 2],                  // u16 operation code
    request_id: [u8; 4],              // u32 client nonce, echoed in replies
    pub(crate) payload_size: [u8; 4], // u32 payload length
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 16;

    /// Magic number: "CRER" in ASCII.
    pub const MAGIC: u32 = 0x4352_4552;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Create a header for `opcode` with no flags, request id 0 and an empty
    /// payload.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            flags: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            request_id: [0; 4],
            payload_size: [0; 4],
        }
    }

    /// Parse a header from the front of `bytes` without copying.
    ///
    /// Checks are ordered cheapest first: length, magic, version, then the
    /// payload size limit.
    ///
    /// # Errors
    ///
    /// - `FrameTooShort` if fewer than [`Self::SIZE`] bytes are available
    /// - `InvalidMagic` / `UnsupportedVersion` for foreign or future traffic
    /// - `PayloadTooLarge` if the declared payload exceeds the limit
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() }
        })?;

        let magic = u32::from_be_bytes(header.magic);
        if magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame flags.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Client-assigned nonce for request/response correlation.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Set the client request nonce.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }

    pub(crate) fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode.to_u16().to_be_bytes();
    }

    #[cfg(test)]
    pub(crate) fn set_opcode_raw(&mut self, opcode: u16) {
        self.opcode = opcode.to_be_bytes();
    }

    /// Replace the frame flags.
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.to_byte();
    }
}

// Manual Debug and PartialEq: packed repr prevents deriving them
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("request_id", &self.request_id())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Delivery of this frame carries urgent priority. Clients may surface it
    /// ahead of anything already buffered.
    pub const URGENT: Self = Self(0b0000_0001);

    /// The server expects a `message:ack` for this frame.
    pub const ACK_REQUESTED: Self = Self(0b0000_0010);

    /// Wrap a raw flag byte. Unknown bits are preserved.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw flag byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// True if every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for FrameHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<[u8; 2]>(), any::<u8>(), any::<u32>(), 0u32..=Self::MAX_PAYLOAD_SIZE)
                .prop_map(|(opcode, flags, request_id, payload_size)| Self {
                    magic: Self::MAGIC.to_be_bytes(),
                    version: Self::VERSION,
                    flags,
                    opcode,
                    request_id: request_id.to_be_bytes(),
                    payload_size: payload_size.to_be_bytes(),
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<FrameHeader>()) {
            let bytes = header.to_bytes();
            let parsed = FrameHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = FrameHeader::from_bytes(&bytes);
        }
    }

    #[test]
    fn new_header_carries_opcode() {
        let header = FrameHeader::new(Opcode::RoomJoin);
        assert_eq!(header.opcode_enum(), Some(Opcode::RoomJoin));
        assert_eq!(header.magic(), FrameHeader::MAGIC);
        assert_eq!(header.payload_size(), 0);
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 10]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 16, actual: 10 }));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&[0xFF; 4]);
        buf[4] = FrameHeader::VERSION;

        let result = FrameHeader::from_bytes(&buf);
        assert_eq!(result, Err(ProtocolError::InvalidMagic(0xFFFF_FFFF)));
    }

    #[test]
    fn reject_invalid_version() {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = 0x7F;

        let result = FrameHeader::from_bytes(&buf);
        assert_eq!(result, Err(ProtocolError::UnsupportedVersion(0x7F)));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = FrameHeader::VERSION;
        buf[12..16].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());

        let result = FrameHeader::from_bytes(&buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn flags_compose() {
        let flags = FrameFlags::URGENT.with(FrameFlags::ACK_REQUESTED);
        assert!(flags.contains(FrameFlags::URGENT));
        assert!(flags.contains(FrameFlags::ACK_REQUESTED));
        assert!(!FrameFlags::NONE.contains(FrameFlags::URGENT));
    }
}
