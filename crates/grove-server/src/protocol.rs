//! Client-to-server control messages on the push channel.
//!
//! Viewers only ever send `{"action": "ping", "data": {"timestamp": ...}}`.
//! Anything else is answered in-band with an `error` event and the channel
//! stays open.

use grove_core::events::INVALID_JSON_MESSAGE;
use grove_core::Event;
use serde_json::Value;

/// A parsed inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Ping { timestamp: Option<Value> },
    /// A JSON object whose action is not understood. `None` when the action
    /// is missing or not a string.
    Unrecognized { action: Option<String> },
    /// Not a JSON object.
    Malformed,
}

impl Inbound {
    pub fn parse(text: &str) -> Self {
        let Ok(Value::Object(message)) = serde_json::from_str::<Value>(text) else {
            return Self::Malformed;
        };

        match message.get("action").and_then(Value::as_str) {
            Some("ping") => {
                let timestamp = message
                    .get("data")
                    .and_then(|data| data.get("timestamp"))
                    .or_else(|| message.get("timestamp"))
                    .cloned();
                Self::Ping { timestamp }
            }
            Some(other) => Self::Unrecognized {
                action: Some(other.to_string()),
            },
            None => Self::Unrecognized { action: None },
        }
    }

    /// The single event sent back to the originating channel.
    pub fn reply(&self) -> Event {
        match self {
            Self::Ping { timestamp } => Event::pong(timestamp.clone()),
            Self::Unrecognized { action } => Event::error(format!(
                "Unrecognized action: {}",
                action.as_deref().unwrap_or("null")
            )),
            Self::Malformed => Event::error(INVALID_JSON_MESSAGE),
        }
    }
}
