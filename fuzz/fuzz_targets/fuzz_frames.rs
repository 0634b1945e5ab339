//! Fuzz target for frame formatting.
//!
//! Uses arbitrary to generate structured frames and verify the formatter
//! and the classifier agree.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sess::protocol::{classify, resize_frame, Frame};

/// Fuzzable frame shapes a client can produce.
#[derive(Debug, Arbitrary)]
enum FuzzFrame {
    Resize { rows: u16, cols: u16 },
    Data(Vec<u8>),
}

fuzz_target!(|frame: FuzzFrame| {
    match frame {
        FuzzFrame::Resize { rows, cols } => {
            // A formatted frame classifies back to the same size.
            let wire = resize_frame(rows, cols);
            assert_eq!(classify(&wire), Frame::Resize { rows, cols });
        }
        FuzzFrame::Data(bytes) => {
            // A chunk that happens to spell a control frame may classify
            // as one; everything else passes through untouched.
            if let Frame::Data(passed) = classify(&bytes) {
                assert_eq!(passed, bytes.as_slice());
            }
        }
    }
});
