use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::shared::constants::PAYLOAD_KEY_PREFIX;

/// Derives the identity under which rate limiting is tracked
pub trait ThrottleKeyExtractor: Send + Sync {
    fn key(&self, topic: &str, payload: &Value) -> String;
}

/// How throttle keys are derived from an incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleKeyStrategy {
    /// One throttle window per topic
    Topic,
    /// One throttle window per device id found at this top-level payload field.
    /// Messages without a usable value fall back to their topic.
    PayloadField(String),
}

impl ThrottleKeyExtractor for ThrottleKeyStrategy {
    fn key(&self, topic: &str, payload: &Value) -> String {
        match self {
            ThrottleKeyStrategy::Topic => topic.to_string(),
            ThrottleKeyStrategy::PayloadField(field) => match payload.get(field) {
                Some(Value::String(id)) if !id.is_empty() => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => topic.to_string(),
            },
        }
    }
}

impl FromStr for ThrottleKeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "topic" {
            return Ok(ThrottleKeyStrategy::Topic);
        }
        match s.strip_prefix(PAYLOAD_KEY_PREFIX) {
            Some(field) if !field.is_empty() => Ok(ThrottleKeyStrategy::PayloadField(field.to_string())),
            _ => Err(format!(
                "expected 'topic' or '{}<field>', got '{}'",
                PAYLOAD_KEY_PREFIX, s
            )),
        }
    }
}

impl fmt::Display for ThrottleKeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleKeyStrategy::Topic => write!(f, "topic"),
            ThrottleKeyStrategy::PayloadField(field) => write!(f, "{}{}", PAYLOAD_KEY_PREFIX, field),
        }
    }
}
