//! Line framing for console traffic.
//!
//! Every message travels as one LF-terminated UTF-8 line:
//!
//! ```text
//! Frame: <escaped text>\n
//!
//! Example:
//! Message: say "hi"\nthen wait
//! Frame:   say "hi"\\nthen wait\n
//! ```
//!
//! Messages may contain line terminators, so the payload is escaped before
//! it is written: `\` becomes `\\`, LF becomes `\n` and CR becomes `\r`.
//! Plain text without those characters is sent verbatim, which keeps the
//! protocol usable from `nc` or `telnet`. A CR directly before the LF is
//! ignored so CRLF peers work too.
//!
//! There is no message-type discriminator: a line sent by `echo` and the
//! question half of a `prompt` look the same on the wire.
//!
//! The one exception is the heartbeat, a bare `__HB__` line. A message whose
//! text is exactly `__HB__` is written as `\__HB__` so it never collides
//! with it.

use bytes::{BufMut, BytesMut};

/// Reserved liveness line. Readers drop it instead of queueing it.
pub const HEARTBEAT: &str = "__HB__";

/// Heartbeat as written on the wire. `encode` never produces this frame.
pub const HEARTBEAT_FRAME: &[u8] = b"__HB__\n";

/// Default upper bound for a single frame, terminator included.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full message and the number of bytes it occupied in the input.
    Complete(String, usize),
    /// A heartbeat line and the number of bytes it occupied.
    Heartbeat(usize),
    /// No line terminator yet.
    Incomplete,
    /// The stream can not be decoded.
    Invalid(FrameError),
}

/// Why a frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload is not valid UTF-8.
    Utf8,
    /// No terminator within the allowed line length.
    TooLong,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Utf8 => write!(f, "line is not valid UTF-8"),
            FrameError::TooLong => write!(f, "line exceeds maximum length"),
        }
    }
}

/// Parse one frame from the front of `input`.
pub fn parse(input: &[u8], max_line_length: usize) -> ParseResult {
    parse_from(input, 0, max_line_length)
}

/// Like [`parse`], but skips the first `scanned` bytes when looking for the
/// terminator. Callers pass the length of a buffer that was `Incomplete`
/// before more bytes were appended.
pub fn parse_from(input: &[u8], scanned: usize, max_line_length: usize) -> ParseResult {
    let start = scanned.min(input.len());
    let line_end = match input[start..].iter().position(|&b| b == b'\n') {
        Some(pos) => start + pos,
        None if input.len() >= max_line_length => {
            return ParseResult::Invalid(FrameError::TooLong)
        }
        None => return ParseResult::Incomplete,
    };

    if line_end + 1 > max_line_length {
        return ParseResult::Invalid(FrameError::TooLong);
    }

    let mut line = &input[..line_end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    if line == HEARTBEAT.as_bytes() {
        return ParseResult::Heartbeat(line_end + 1);
    }

    match std::str::from_utf8(line) {
        Ok(text) => ParseResult::Complete(unescape(text), line_end + 1),
        Err(_) => ParseResult::Invalid(FrameError::Utf8),
    }
}

/// Append the frame for `message` to `output`.
pub fn encode_into(message: &str, output: &mut BytesMut) {
    output.reserve(message.len() + 2);
    if message == HEARTBEAT {
        output.put_u8(b'\\');
    }
    for b in message.bytes() {
        match b {
            b'\\' => output.put_slice(b"\\\\"),
            b'\n' => output.put_slice(b"\\n"),
            b'\r' => output.put_slice(b"\\r"),
            other => output.put_u8(other),
        }
    }
    output.put_u8(b'\n');
}

/// Frame `message` into a fresh buffer.
pub fn encode(message: &str) -> BytesMut {
    let mut output = BytesMut::with_capacity(message.len() + 2);
    encode_into(message, &mut output);
    output
}

fn unescape(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('_') => out.push('_'),
            // Unknown escapes pass through untouched
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
