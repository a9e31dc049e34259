//! Producer Contract
//!
//! A [`Runner`] is the unit of work that produces a task's domain events:
//! model inference, tool calls, workflow nodes. The core never looks inside
//! it. It hands the runner a [`RunContext`] and pumps the returned stream into
//! the task channel.
//!
//! # Failure Kinds
//!
//! A runner reports failure through [`TaskError`] and nothing else:
//!
//! | Variant            | Consumer sees                    | Logged            |
//! |--------------------|----------------------------------|-------------------|
//! | `Cancelled`        | nothing (stop already delivered) | debug             |
//! | `Unauthorized`     | `Error{unauthorized}`            | warn              |
//! | `ValidationFailed` | `Error{validation_failed}`       | only in debug mode|
//! | `Unknown`          | generic `Error{unknown}`         | error, full detail|

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::PublishError;
use crate::events::{Event, FailureKind};
use crate::tasks::{Task, TaskId};

/// Stream of domain events produced by a runner
pub type EventStream = BoxStream<'static, Result<Event, TaskError>>;

/// Ways a producer can end other than success
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was stopped or its consumer went away
    #[error("task was cancelled")]
    Cancelled,

    /// The model provider rejected the credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed configuration or input
    #[error("{0}")]
    ValidationFailed(String),

    /// Anything else
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl TaskError {
    /// Failure class reported to the consumer, if any
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Cancelled => None,
            Self::Unauthorized(_) => Some(FailureKind::Unauthorized),
            Self::ValidationFailed(_) => Some(FailureKind::ValidationFailed),
            Self::Unknown(_) => Some(FailureKind::Unknown),
        }
    }
}

impl From<PublishError> for TaskError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Closed | PublishError::Stopped => Self::Cancelled,
            other => Self::Unknown(anyhow::Error::new(other)),
        }
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Request-scoped ambient context, captured at admission
///
/// The producer runs on its own task and does not inherit the admitting
/// request's context, so everything it needs is copied here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tenant (workspace) the task runs for
    pub tenant_id: Option<String>,
    /// Principal that started the task
    pub user_id: Option<String>,
    /// Correlation ID for logs across processes
    pub trace_id: String,
    /// Anything else the runner needs
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Snapshot the caller's context
    ///
    /// A fresh trace ID is generated when the caller has none.
    #[must_use]
    pub fn capture(tenant_id: Option<String>, user_id: Option<String>, trace_id: Option<String>) -> Self {
        Self {
            tenant_id,
            user_id,
            trace_id: trace_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            extras: BTreeMap::new(),
        }
    }

    /// Attach an extra value
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Span the producer runs inside
    #[must_use]
    pub fn span(&self, task_id: &TaskId) -> tracing::Span {
        tracing::info_span!(
            "task",
            task_id = %task_id,
            tenant_id = self.tenant_id.as_deref().unwrap_or("-"),
            user_id = self.user_id.as_deref().unwrap_or("-"),
            trace_id = %self.trace_id,
        )
    }
}

// ============================================================================
// Task Scope
// ============================================================================

type Cleanup = Box<dyn FnOnce() + Send>;

/// Guaranteed-cleanup registrations for resources a runner opens
///
/// Cleanups run in reverse registration order when the supervisor releases
/// the scope, on every exit path. A panicking cleanup is logged and does not
/// prevent the others from running.
#[derive(Clone, Default)]
pub struct TaskScope {
    cleanups: Arc<Mutex<Vec<(String, Cleanup)>>>,
}

impl TaskScope {
    /// Create an empty scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup
    pub fn defer(&self, name: impl Into<String>, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().push((name.into(), Box::new(cleanup)));
    }

    /// Number of pending cleanups
    #[must_use]
    pub fn pending(&self) -> usize {
        self.cleanups.lock().len()
    }

    /// Run every pending cleanup; returns how many ran
    pub fn release(&self) -> usize {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        let count = cleanups.len();
        for (name, cleanup) in cleanups.into_iter().rev() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                tracing::error!(resource = %name, "Cleanup panicked");
            } else {
                tracing::trace!(resource = %name, "Released task resource");
            }
        }
        count
    }
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("pending", &self.pending())
            .finish()
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Everything a runner receives
#[derive(Debug)]
pub struct RunContext {
    /// The task being produced
    pub task: Task,
    /// Snapshot of the admitting request's context
    pub context: ExecutionContext,
    /// Where to register cleanups for opened resources
    pub scope: TaskScope,
}

/// Producer of domain events
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Start producing
    ///
    /// Failing here is reported exactly like a failure of the stream.
    async fn run(&self, ctx: RunContext) -> Result<EventStream, TaskError>;
}
