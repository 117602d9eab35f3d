//! Fuzz target for `Frame::decode`.
//!
//! Arbitrary bytes from the wire must decode or fail with an error. A frame
//! that decodes must re-encode to the bytes it came from.

#![no_main]

use courier_proto::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        let encoded = frame.to_vec().expect("decoded frame re-encodes");
        assert_eq!(encoded.as_slice(), &data[..encoded.len()]);
    }
});
