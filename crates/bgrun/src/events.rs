//! Producer output: raw emissions from a generator and the sequenced events
//! the adapter persists.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Source recorded when a generator does not name one.
pub const SYSTEM_SOURCE: &str = "system";

/// Content of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Empty payloads are dropped by the adapter, never stored.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.trim().is_empty(),
            Payload::Structured(value) => match value {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                Value::Bool(_) | Value::Number(_) => false,
            },
        }
    }

    /// Plain-text rendering used by search and the CLI.
    pub fn as_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Structured(Value::String(s)) => s.clone(),
            Payload::Structured(value) => value.to_string(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

/// One item yielded by a generator, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    #[serde(default)]
    pub source: String,
    pub content: Payload,
}

impl Emission {
    pub fn new(source: impl Into<String>, content: impl Into<Payload>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
        }
    }

    pub fn text(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(source, Payload::Text(content.into()))
    }
}

/// An immutable, sequenced unit of producer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub source: String,
    pub payload: Payload,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
}

impl Event {
    /// Wrap an emission. A blank source becomes [`SYSTEM_SOURCE`].
    pub fn from_emission(sequence: u64, emission: Emission) -> Self {
        let source = if emission.source.trim().is_empty() {
            SYSTEM_SOURCE.to_string()
        } else {
            emission.source
        };
        Self {
            sequence,
            source,
            payload: emission.content,
            emitted_at: OffsetDateTime::now_utc(),
        }
    }
}
