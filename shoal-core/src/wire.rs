//! Framing: one JSON object per line, UTF-8, `\n` terminated.

use crate::protocol::Message;

/// Encode a message as its single-line JSON form. The caller appends the
/// newline when writing.
pub fn encode_line(msg: &Message) -> Result<String, LineEncodeError> {
    serde_json::to_string(msg).map_err(LineEncodeError::Json)
}

/// Error encoding a message into a line.
#[derive(Debug, thiserror::Error)]
pub enum LineEncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one line into a message. Malformed JSON, an unknown command and
/// a missing required field all fail here; the caller treats any failure
/// as a protocol violation.
pub fn decode_line(line: &str) -> Result<Message, LineDecodeError> {
    serde_json::from_str(line).map_err(LineDecodeError::Json)
}

/// Error decoding a line into a message.
#[derive(Debug, thiserror::Error)]
pub enum LineDecodeError {
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
}
