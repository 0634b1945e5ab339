//! Control frames on the session socket.
//!
//! The wire is mostly opaque PTY bytes. A handful of newline-terminated
//! ASCII frames carry control traffic; the daemon classifies each read
//! chunk with an exact match, so clients must send every control frame as
//! an isolated write, never batched with keystrokes.

/// Server greeting sent to the one accepted client.
pub const READY: &[u8] = b"READY\n";

/// Keepalive probe from the client.
pub const PING: &[u8] = b"PING\n";

/// Keepalive reply from the daemon.
pub const PONG: &[u8] = b"PONG\n";

/// Client is detaching; the daemon closes the connection and keeps the
/// session alive.
pub const DISCONNECT: &[u8] = b"DISCONNECT\n";

/// Rejection line sent when the attachment slot is taken.
pub const BUSY: &[u8] = b"ERROR: Session already has an active connection\n";

const RESIZE_PREFIX: &[u8] = b"RESIZE ";

/// One classified read chunk from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Detach request.
    Disconnect,
    /// Keepalive probe; answer with [`PONG`].
    Ping,
    /// Apply a new window size to the PTY.
    Resize { rows: u16, cols: u16 },
    /// Opaque input bytes for the PTY master.
    Data(&'a [u8]),
}

/// Classify one read chunk. Control frames match exactly; everything
/// else, including a control frame batched with other bytes, is opaque
/// input for the PTY.
#[must_use]
pub fn classify(chunk: &[u8]) -> Frame<'_> {
    if chunk == DISCONNECT {
        return Frame::Disconnect;
    }
    if chunk == PING {
        return Frame::Ping;
    }
    if chunk.starts_with(RESIZE_PREFIX) {
        if let Some((rows, cols)) = parse_resize(chunk) {
            return Frame::Resize { rows, cols };
        }
    }
    Frame::Data(chunk)
}

/// Parse `RESIZE <rows> <cols>`. Unparsable dimensions fall back to zero,
/// which the PTY accepts as-is.
fn parse_resize(chunk: &[u8]) -> Option<(u16, u16)> {
    let text = std::str::from_utf8(chunk).ok()?;
    let mut fields = text.split_whitespace();
    fields.next()?; // "RESIZE"
    let rows = fields.next()?.parse().unwrap_or(0);
    let cols = fields.next()?.parse().unwrap_or(0);
    Some((rows, cols))
}

/// Format a `RESIZE` frame for the given window size.
#[must_use]
pub fn resize_frame(rows: u16, cols: u16) -> Vec<u8> {
    format!("RESIZE {rows} {cols}\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exact_control_frames() {
        assert_eq!(classify(b"DISCONNECT\n"), Frame::Disconnect);
        assert_eq!(classify(b"PING\n"), Frame::Ping);
        assert_eq!(
            classify(b"RESIZE 24 80\n"),
            Frame::Resize { rows: 24, cols: 80 }
        );
    }

    #[test]
    fn test_classify_requires_isolated_frames() {
        // A control frame batched with a keystroke is plain input.
        assert_eq!(classify(b"DISCONNECT\nx"), Frame::Data(b"DISCONNECT\nx"));
        assert_eq!(classify(b"PING\nPING\n"), Frame::Data(b"PING\nPING\n"));
        assert_eq!(classify(b"DISCONNECT"), Frame::Data(b"DISCONNECT"));
    }

    #[test]
    fn test_classify_data_passthrough() {
        assert_eq!(classify(b"ls -la\n"), Frame::Data(b"ls -la\n"));
        assert_eq!(classify(b"\x1b[A"), Frame::Data(b"\x1b[A"));
        assert_eq!(classify(b""), Frame::Data(b""));
    }

    #[test]
    fn test_classify_resize_zero_applies_as_is() {
        assert_eq!(
            classify(b"RESIZE 0 0\n"),
            Frame::Resize { rows: 0, cols: 0 }
        );
    }

    #[test]
    fn test_classify_resize_unparsable_dimensions() {
        // Non-numeric fields degrade to zero rather than being dropped.
        assert_eq!(
            classify(b"RESIZE x 80\n"),
            Frame::Resize { rows: 0, cols: 80 }
        );
    }

    #[test]
    fn test_classify_resize_missing_fields_is_data() {
        assert_eq!(classify(b"RESIZE 24\n"), Frame::Data(b"RESIZE 24\n"));
        assert_eq!(classify(b"RESIZE \n"), Frame::Data(b"RESIZE \n"));
    }

    #[test]
    fn test_classify_resize_non_utf8_is_data() {
        let chunk: &[u8] = b"RESIZE \xff\xfe";
        assert_eq!(classify(chunk), Frame::Data(chunk));
    }

    #[test]
    fn test_resize_frame_roundtrip() {
        let frame = resize_frame(52, 211);
        assert_eq!(frame, b"RESIZE 52 211\n");
        assert_eq!(
            classify(&frame),
            Frame::Resize {
                rows: 52,
                cols: 211
            }
        );
    }
}
