//! Envelope framing: one JSON-encoded envelope per newline-terminated line.

use crate::envelope::Envelope;
use crate::error::ProtocolDecodeError;

/// Largest accepted frame, newline included.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Encode an envelope as a single line (trailing newline included).
///
/// JSON string escaping guarantees payload newlines never split the frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(envelope)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame; surrounding whitespace and the line terminator are ignored.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, ProtocolDecodeError> {
    if frame.len() > MAX_LINE_BYTES {
        return Err(ProtocolDecodeError::LineTooLarge(frame.len()));
    }
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolDecodeError::NotUtf8)?;
    Ok(serde_json::from_str(text.trim())?)
}
