//! JSON text framing for relay connections.
//!
//! Wire format: one [`Frame`] per WebSocket text message.

use crate::error::{RelayError, RelayResult};
use crate::messages::Frame;
use serde_json::Value;

/// Encode a frame as JSON text.
pub fn encode_frame(frame: &Frame) -> RelayResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one frame from JSON text.
pub fn decode_frame(text: &str) -> RelayResult<Frame> {
    serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(format!("bad frame: {e}")))
}

/// Unwrap one level of string-encoded JSON.
///
/// Daemons may answer with JSON text instead of a JSON value (the plaintext of
/// their encryption layer). A string that parses as JSON is replaced by the
/// parsed value; anything else, including a string that does not parse, is
/// returned unchanged. Never recurses: a string that decodes to another string
/// stays a string.
pub fn unwrap_json_string(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}
