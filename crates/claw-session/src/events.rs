//! Session event types.

use serde_json::{Value, json};

use crate::error::TransportError;
use crate::transport::CloseInfo;

/// Events delivered to every registered handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection established.
    Connected,
    /// Parsed inbound message.
    Message(Value),
    /// Connection closed, by either side.
    Disconnected(CloseInfo),
    /// Transport reported an error. State is unchanged; a disconnect follows.
    Error(TransportError),
}

impl ConnectionEvent {
    /// Short event kind, as used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Message(_) => "message",
            Self::Disconnected(_) => "disconnected",
            Self::Error(_) => "error",
        }
    }

    /// JSON rendering with an `event` field holding [`Self::kind`].
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Connected => json!({ "event": self.kind() }),
            Self::Message(data) => json!({ "event": self.kind(), "data": data }),
            Self::Disconnected(info) => json!({ "event": self.kind(), "close": info }),
            Self::Error(err) => json!({ "event": self.kind(), "error": err.to_string() }),
        }
    }
}
