//! Wire Conversion
//!
//! Turns drained queue messages into server-sent-event frames:
//!
//! ```text
//! Ping          -> "event: ping\n\n"
//! anything else -> "data: {json}\n\n"
//! ```

use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::events::{Event, QueueMessage};

/// Errors converting a message to a wire frame
#[derive(Debug, Error)]
pub enum WireError {
    /// The message could not be serialized
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One outgoing frame
#[derive(Clone, Debug, PartialEq)]
pub enum WireEvent {
    /// Keep-alive
    Ping,
    /// JSON-encoded message
    Data(serde_json::Value),
}

impl WireEvent {
    /// Convert a drained message
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn from_message(message: &QueueMessage) -> Result<Self, WireError> {
        if message.event == Event::Ping {
            return Ok(Self::Ping);
        }
        Ok(Self::Data(serde_json::to_value(message)?))
    }

    /// Render as a server-sent-event frame
    #[must_use]
    pub fn to_sse(&self) -> String {
        match self {
            Self::Ping => "event: ping\n\n".to_string(),
            Self::Data(value) => format!("data: {value}\n\n"),
        }
    }
}

impl Serialize for WireEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Ping => serializer.serialize_str("ping"),
            Self::Data(value) => value.serialize(serializer),
        }
    }
}

/// Convert a stream of drained messages into wire frames
pub fn to_wire<S>(messages: S) -> impl Stream<Item = Result<WireEvent, WireError>> + Send + 'static
where
    S: Stream<Item = QueueMessage> + Send + 'static,
{
    messages.map(|message| WireEvent::from_message(&message))
}
