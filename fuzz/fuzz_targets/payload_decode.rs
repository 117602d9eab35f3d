//! Fuzz target for `Payload::from_frame`.
//!
//! Runs the same bytes through every client and server opcode: malformed
//! CBOR, payloads of the wrong type and oversized collections must all be
//! rejected without panicking.

#![no_main]

use courier_proto::{Frame, FrameHeader, Opcode, Payload};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for value in 0..=u16::MAX {
        let Some(opcode) = Opcode::from_u16(value) else {
            continue;
        };
        let frame = Frame::new(FrameHeader::new(opcode), data.to_vec());
        if let Ok(payload) = Payload::from_frame(&frame) {
            let again = payload.to_frame().expect("decoded payload re-encodes");
            assert_eq!(again.header.opcode(), opcode.to_u16());
        }
    }
});
