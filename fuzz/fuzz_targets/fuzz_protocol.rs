//! Fuzz target for control-frame classification.
//!
//! Tests that arbitrary bytes read off the session socket don't cause
//! panics when classified.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sess::protocol::{classify, Frame};

fuzz_target!(|data: &[u8]| {
    // Classification must never panic, whatever a client sends.
    match classify(data) {
        // Opaque input passes through verbatim.
        Frame::Data(passed) => assert_eq!(passed, data),
        // Control frames only come from exact ASCII lines.
        Frame::Disconnect => assert_eq!(data, b"DISCONNECT\n"),
        Frame::Ping => assert_eq!(data, b"PING\n"),
        Frame::Resize { .. } => assert!(data.starts_with(b"RESIZE ")),
    }
});
