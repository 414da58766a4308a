use serde_json::Value;
use thiserror::Error;

use crate::shared::constants::DECODE_EXCERPT_LIMIT;

/// A payload that could not be turned into a structured value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (payload: {excerpt:?})")]
pub struct DecodeError {
    pub reason: String,
    /// Leading part of the offending input, at most `DECODE_EXCERPT_LIMIT` characters
    pub excerpt: String,
}

impl DecodeError {
    fn new(reason: impl Into<String>, text: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: excerpt(text),
        }
    }
}

/// Decode raw message bytes as UTF-8 JSON
pub fn decode(raw: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|e| {
        DecodeError::new(
            format!("payload is not valid UTF-8: {}", e),
            &String::from_utf8_lossy(raw),
        )
    })?;

    serde_json::from_str(text).map_err(|e| DecodeError::new(format!("invalid JSON: {}", e), text))
}

/// Truncate to `DECODE_EXCERPT_LIMIT` characters, never splitting a character
fn excerpt(text: &str) -> String {
    match text.char_indices().nth(DECODE_EXCERPT_LIMIT) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
