//! Wire contract: backbone names and client-facing event frames.
//!
//! Backbone (shared by every instance, must match exactly):
//! ```text
//! key      chat:connection-count          integer counter
//! channel  chat:connection-count-updated  "42"          (decimal string)
//! channel  chat:new-message               "hello"       (raw text, no envelope)
//! ```
//!
//! Clients (WebSocket text frames, JSON):
//! ```text
//! ┌─────────────────────────────┬──────────────────────────────────────┐
//! │ event                       │ data                                 │
//! ├─────────────────────────────┼──────────────────────────────────────┤
//! │ chat:connection-count-updated │ { count }                          │
//! │ chat:new-message            │ { message, id, createdAt, port }     │
//! └─────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Inbound chat frames reuse the `chat:new-message` event name with a
//! `{ message }` payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Storage key of the shared connection counter.
pub const CONNECTION_COUNT_KEY: &str = "chat:connection-count";
/// Pub/sub channel carrying count snapshots.
pub const CONNECTION_COUNT_UPDATED_CHANNEL: &str = "chat:connection-count-updated";
/// Pub/sub channel carrying raw chat text.
pub const NEW_MESSAGE_CHANNEL: &str = "chat:new-message";

/// The two channels every instance subscribes to.
pub const FANOUT_CHANNELS: [&str; 2] = [CONNECTION_COUNT_UPDATED_CHANNEL, NEW_MESSAGE_CHANNEL];

/// Snapshot of the shared counter after one increment/decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountUpdate {
    pub count: i64,
}

impl CountUpdate {
    /// Backbone form: the decimal string of the count.
    pub fn to_payload(self) -> String {
        self.count.to_string()
    }

    /// Parse a backbone payload.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        payload
            .trim()
            .parse()
            .map(|count| Self { count })
            .map_err(|_| ProtocolError::InvalidCount(payload.to_string()))
    }
}

/// A chat message as delivered to local connections.
///
/// `id`, `created_at` and `origin_port` are delivery metadata stamped by the
/// instance doing the fan-out, not by the instance that received the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub id: Uuid,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "port")]
    pub origin_port: u16,
}

impl ChatMessage {
    /// Stamp a fresh id and the current time onto `message`.
    pub fn stamped(message: impl Into<String>, origin_port: u16) -> Self {
        Self {
            message: message.into(),
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            origin_port,
        }
    }
}

/// Chat payload sent by a client. `message` may be any JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundChat {
    #[serde(default)]
    pub message: Option<Value>,
}

impl InboundChat {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(Value::String(message.into())),
        }
    }

    /// Text to publish, or `None` when the message is absent or falsy
    /// (`null`, `false`, `0`, `""`).
    pub fn text(&self) -> Option<String> {
        match self.message.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::Bool(true) => Some("true".to_string()),
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) if n.as_f64() == Some(0.0) => None,
            Value::Number(n) => Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => i.to_string(),
                (_, Some(u), _) => u.to_string(),
                // `Display` for f64 drops a trailing `.0`, as JavaScript does.
                (_, _, Some(f)) => f.to_string(),
                _ => n.to_string(),
            }),
            other => Some(other.to_string()),
        }
    }
}

/// Event broadcast to every local connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "chat:connection-count-updated")]
    CountUpdated(CountUpdate),
    #[serde(rename = "chat:new-message")]
    NewMessage(ChatMessage),
}

impl OutboundEvent {
    /// Client-facing event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CountUpdated(_) => CONNECTION_COUNT_UPDATED_CHANNEL,
            Self::NewMessage(_) => NEW_MESSAGE_CHANNEL,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Chat(InboundChat),
    /// Any event this relay does not handle.
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;

        if envelope.event != NEW_MESSAGE_CHANNEL {
            return Ok(Self::Unknown(envelope.event));
        }

        // Non-object payloads carry no `message` key.
        let chat = match envelope.data {
            Value::Object(mut map) => InboundChat {
                message: map.remove("message"),
            },
            _ => InboundChat::default(),
        };
        Ok(Self::Chat(chat))
    }

    /// Encode a chat frame the way a client sends it.
    pub fn encode_chat(chat: &InboundChat) -> Result<String, ProtocolError> {
        let data = serde_json::to_value(chat)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        serde_json::to_string(&serde_json::json!({
            "event": NEW_MESSAGE_CHANNEL,
            "data": data,
        }))
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidCount(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidCount(p) => write!(f, "Invalid count payload: {p:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
