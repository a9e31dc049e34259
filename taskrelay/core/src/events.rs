//! Task Events
//!
//! Everything that flows through a task channel. Producers publish [`Event`]s;
//! the channel wraps each one in a [`QueueMessage`] carrying the routing
//! context the consumer needs.
//!
//! # Payload Safety
//!
//! A payload must be plain data. A [`RowHandle`] is a lazily-loaded row proxy
//! bound to the database session of the thread that created it; dereferencing
//! it from the consuming side races that session. [`Event::validate`] walks the
//! payload tree and refuses any handle before it reaches the queue.

use std::collections::BTreeMap;

use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

use crate::tasks::{Route, Task, TaskId};

// ============================================================================
// Payloads
// ============================================================================

/// Unloaded database row proxy, bound to the session that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowHandle {
    /// Table the row lives in
    pub table: String,
    /// Primary key of the row
    pub key: String,
}

impl RowHandle {
    /// Create a handle for a row
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

/// Event payload tree
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Payload {
    /// No value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Number
    Number(serde_json::Number),
    /// String
    Text(String),
    /// Sequence
    List(Vec<Payload>),
    /// String-keyed map
    Map(BTreeMap<String, Payload>),
    /// Live row handle; never allowed on a channel
    Row(RowHandle),
}

impl Payload {
    /// Build a map payload from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a text payload
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Path of the first live row handle in this tree, if any
    ///
    /// Paths use `$` for the root, `.key` for map entries and `[i]` for list
    /// items.
    #[must_use]
    pub fn find_live_handle(&self) -> Option<String> {
        self.find_live_handle_at("$".to_string())
    }

    fn find_live_handle_at(&self, path: String) -> Option<String> {
        match self {
            Self::Row(_) => Some(path),
            Self::Map(entries) => entries
                .iter()
                .find_map(|(key, value)| value.find_live_handle_at(format!("{path}.{key}"))),
            Self::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, value)| value.find_live_handle_at(format!("{path}[{i}]"))),
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::Text(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<RowHandle> for Payload {
    fn from(value: RowHandle) -> Self {
        Self::Row(value)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::Text(s) => serializer.serialize_str(s),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Self::Row(row) => Err(S::Error::custom(format!(
                "cannot serialize live row handle {}:{}",
                row.table, row.key
            ))),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Why a task stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The owner requested a stop
    UserManual,
    /// The task exceeded its maximum execution time
    Timeout,
}

/// Failure classes surfaced to the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credentials rejected by the model provider
    Unauthorized,
    /// Malformed configuration or input
    ValidationFailed,
    /// Anything else; details stay in the logs
    Unknown,
}

/// Error description carried by a terminal [`Event::Error`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Consumer-facing message
    pub message: String,
}

impl TaskFailure {
    /// Create a failure description
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Error when an event cannot be placed on a channel
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("payload carries a live row handle at {path}; detach it before publishing")]
pub struct LiveHandleError {
    /// Location of the handle inside the payload
    pub path: String,
}

/// An event flowing through a task channel
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Event {
    /// Keep-alive, synthesized by the draining side
    Ping,
    /// The task was stopped (terminal)
    Stop {
        /// Why the task stopped
        reason: StopReason,
    },
    /// The task failed (terminal)
    Error {
        /// What went wrong
        error: TaskFailure,
    },
    /// Incremental domain output
    Message {
        /// Domain payload
        payload: Payload,
    },
    /// Domain completion (terminal)
    End {
        /// Final domain payload
        payload: Payload,
    },
}

impl Event {
    /// Incremental output event
    pub fn message(payload: impl Into<Payload>) -> Self {
        Self::Message {
            payload: payload.into(),
        }
    }

    /// Completion event
    pub fn end(payload: impl Into<Payload>) -> Self {
        Self::End {
            payload: payload.into(),
        }
    }

    /// Failure event
    #[must_use]
    pub fn error(error: TaskFailure) -> Self {
        Self::Error { error }
    }

    /// Stop event
    #[must_use]
    pub fn stop(reason: StopReason) -> Self {
        Self::Stop { reason }
    }

    /// Whether this event ends the task's stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error { .. } | Self::End { .. })
    }

    /// Event name as it appears on the wire
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Stop { .. } => "stop",
            Self::Error { .. } => "error",
            Self::Message { .. } => "message",
            Self::End { .. } => "end",
        }
    }

    /// Reject payloads that carry live row handles
    ///
    /// # Errors
    ///
    /// Returns [`LiveHandleError`] naming the first offending path.
    pub fn validate(&self) -> Result<(), LiveHandleError> {
        let payload = match self {
            Self::Message { payload } | Self::End { payload } => payload,
            Self::Ping | Self::Stop { .. } | Self::Error { .. } => return Ok(()),
        };
        match payload.find_live_handle() {
            Some(path) => Err(LiveHandleError { path }),
            None => Ok(()),
        }
    }
}

/// Who is publishing an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishFrom {
    /// The producer unit of work
    ApplicationManager,
    /// The draining side (heartbeats, synthetic stops)
    TaskPipeline,
}

// ============================================================================
// Queue Envelope
// ============================================================================

/// An event wrapped with the routing context of its task
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueMessage {
    /// Task that emitted the event
    pub task_id: TaskId,
    /// Conversation, for message-oriented tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Message, for message-oriented tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Application mode, for message-oriented tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_mode: Option<String>,
    /// The event itself
    #[serde(flatten)]
    pub event: Event,
}

impl QueueMessage {
    /// Wrap an event with the routing context of `task`
    #[must_use]
    pub fn new(task: &Task, event: Event) -> Self {
        let (conversation_id, message_id, app_mode) = match &task.route {
            Route::Task => (None, None, None),
            Route::Message {
                conversation_id,
                message_id,
                app_mode,
            } => (
                Some(conversation_id.clone()),
                Some(message_id.clone()),
                Some(app_mode.clone()),
            ),
        };
        Self {
            task_id: task.id.clone(),
            conversation_id,
            message_id,
            app_mode,
            event,
        }
    }
}
