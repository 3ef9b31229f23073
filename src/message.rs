//! Outbound payloads and inbound messages
//!
//! The broker bridge publishes text. Anything handed to
//! [`crate::ConnectionManager::publish`] is coerced to a text payload first.

use bytes::Bytes;
use std::borrow::Cow;

/// Text payload for a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Bytes are decoded as UTF-8; invalid sequences become U+FFFD
impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self(String::from_utf8_lossy(value).into_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        match String::from_utf8(value) {
            Ok(text) => Self(text),
            Err(e) => Self(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        // Strings publish bare, not JSON-quoted
        match value {
            serde_json::Value::String(text) => Self(text),
            other => Self(other.to_string()),
        }
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
