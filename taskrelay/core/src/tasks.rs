//! Task Identity Types
//!
//! Identifiers and ownership records for generation tasks. A task has no
//! persistent record: it exists while its channel is open, and the only trace
//! it leaves elsewhere is the TTL'd ownership entry in the shared store.
//!
//! # Ownership
//!
//! Callers come in two disjoint classes whose identifiers may collide, so an
//! [`Owner`] always carries its [`PrincipalKind`] and is compared on both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new globally unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission identifier handed out by a concurrency limiter
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Sentinel returned by a disabled limiter; releasing it is a no-op
    pub const UNLIMITED: &'static str = "unlimited_request_id";

    /// Create a request ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new globally unique request ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The "unlimited" sentinel
    #[must_use]
    pub fn unlimited() -> Self {
        Self(Self::UNLIMITED.to_string())
    }

    /// Whether this is the "unlimited" sentinel
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.0 == Self::UNLIMITED
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surface a request came in through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeSource {
    /// Public service API, authenticated by app key
    ServiceApi,
    /// Published web app
    WebApp,
    /// Workspace explore page
    Explore,
    /// Builder debugger
    Debugger,
}

impl InvokeSource {
    /// Principal class of callers arriving through this surface
    #[must_use]
    pub fn principal_kind(self) -> PrincipalKind {
        match self {
            Self::Explore | Self::Debugger => PrincipalKind::Account,
            Self::ServiceApi | Self::WebApp => PrincipalKind::EndUser,
        }
    }
}

/// Canonical principal class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalKind {
    /// Workspace members
    Account,
    /// Anonymous or app-scoped end users
    EndUser,
}

impl PrincipalKind {
    /// Prefix used in the stored ownership record
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::EndUser => "end-user",
        }
    }
}

/// Error when an owner cannot be constructed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("user is required")]
pub struct MissingUserError;

/// The principal that started a task and may stop it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Principal class
    pub kind: PrincipalKind,
    /// Principal identifier within its class
    pub id: String,
}

impl Owner {
    /// Create an owner of an explicit class
    ///
    /// # Errors
    ///
    /// Returns [`MissingUserError`] if `id` is empty.
    pub fn new(kind: PrincipalKind, id: impl Into<String>) -> Result<Self, MissingUserError> {
        let id = id.into();
        if id.is_empty() {
            return Err(MissingUserError);
        }
        Ok(Self { kind, id })
    }

    /// Create an owner from the surface the request came in through
    ///
    /// # Errors
    ///
    /// Returns [`MissingUserError`] if `id` is empty.
    pub fn from_source(source: InvokeSource, id: impl Into<String>) -> Result<Self, MissingUserError> {
        Self::new(source.principal_kind(), id)
    }

    /// Canonical string stored in the ownership record
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}-{}", self.kind.prefix(), self.id)
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Routing context attached to every event of a task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Route {
    /// Task not tied to a conversation (e.g. a workflow run)
    #[default]
    Task,
    /// Message-oriented task
    Message {
        /// Conversation the message belongs to
        conversation_id: String,
        /// Message being generated
        message_id: String,
        /// Application mode, passed through to the consumer
        app_mode: String,
    },
}

/// One generation run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Principal that started the task
    pub owner: Owner,
    /// Routing context for emitted events
    pub route: Route,
    /// When the task was admitted
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a freshly generated ID
    #[must_use]
    pub fn new(owner: Owner, route: Route) -> Self {
        Self::with_id(TaskId::generate(), owner, route)
    }

    /// Create a task with a caller-assigned ID
    #[must_use]
    pub fn with_id(id: TaskId, owner: Owner, route: Route) -> Self {
        Self {
            id,
            owner,
            route,
            created_at: Utc::now(),
        }
    }
}
