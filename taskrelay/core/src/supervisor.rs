//! Worker Supervisor
//!
//! Runs a [`Runner`] on its own tokio task and guarantees the task ends
//! cleanly whatever the runner does. On completion, in order:
//!
//! 1. classify the outcome and publish a terminal `Error`, or `End` if the
//!    runner finished without publishing a terminal event itself, or `Stop`
//!    if the runner unwound on the stop flag before the drain injected one
//! 2. release the [`TaskScope`]
//! 3. close the channel
//!
//! Cancellation is not an error: a runner that unwinds with
//! [`TaskError::Cancelled`] ends the task quietly.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::channel::TaskPublisher;
use crate::events::{Event, FailureKind, Payload, PublishFrom, StopReason, TaskFailure};
use crate::runner::{ExecutionContext, RunContext, Runner, TaskError, TaskScope};

/// Message published for credential failures
pub const UNAUTHORIZED_MESSAGE: &str = "Incorrect API key provided";

/// Message published for failures whose details stay in the logs
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unexpected error occurred while generating a response";

/// How a supervised task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "kind")]
pub enum WorkerOutcome {
    /// The runner finished its stream
    Completed,
    /// The task was stopped or its consumer went away
    Cancelled,
    /// The runner failed
    Failed(FailureKind),
}

/// Spawns and watches producers
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerSupervisor {
    debug: bool,
}

impl WorkerSupervisor {
    /// Create a supervisor
    ///
    /// In debug mode validation failures are logged with full detail.
    #[must_use]
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Run `runner` on a new tokio task
    pub fn spawn(
        &self,
        runner: Arc<dyn Runner>,
        publisher: TaskPublisher,
        context: ExecutionContext,
    ) -> JoinHandle<WorkerOutcome> {
        let span = context.span(&publisher.task().id);
        let supervisor = *self;
        tokio::spawn(
            async move { supervisor.supervise(runner, publisher, context).await }.instrument(span),
        )
    }

    /// Run `runner` to completion on the current task
    pub async fn supervise(
        &self,
        runner: Arc<dyn Runner>,
        publisher: TaskPublisher,
        context: ExecutionContext,
    ) -> WorkerOutcome {
        let scope = TaskScope::new();
        let ctx = RunContext {
            task: publisher.task().clone(),
            context,
            scope: scope.clone(),
        };

        tracing::debug!(runner = runner.name(), "Starting producer");
        let result = match AssertUnwindSafe(pump(runner.as_ref(), ctx, &publisher))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Unknown(anyhow::anyhow!(
                "runner panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let outcome = self.report(&publisher, result).await;
        let released = scope.release();
        publisher.close();

        tracing::debug!(
            runner = runner.name(),
            outcome = ?outcome,
            released = released,
            "Producer finished"
        );
        outcome
    }

    async fn report(&self, publisher: &TaskPublisher, result: Result<(), TaskError>) -> WorkerOutcome {
        let failure = match result {
            Ok(()) => {
                if !publisher.is_closed() {
                    // Best effort: the consumer may have gone away meanwhile.
                    let _ = publisher
                        .publish(Event::end(Payload::Null), PublishFrom::TaskPipeline)
                        .await;
                }
                return WorkerOutcome::Completed;
            }
            Err(TaskError::Cancelled) => {
                tracing::debug!("Producer cancelled");
                // The producer may notice the stop flag before the drain does.
                if !publisher.is_closed() && publisher.is_stopped().await.unwrap_or(false) {
                    let _ = publisher
                        .publish(Event::stop(StopReason::UserManual), PublishFrom::TaskPipeline)
                        .await;
                }
                return WorkerOutcome::Cancelled;
            }
            Err(TaskError::Unauthorized(detail)) => {
                tracing::warn!(detail = %detail, "Producer credentials rejected");
                TaskFailure::new(FailureKind::Unauthorized, UNAUTHORIZED_MESSAGE)
            }
            Err(TaskError::ValidationFailed(message)) => {
                if self.debug {
                    tracing::error!(error = %message, "Validation error when generating");
                }
                TaskFailure::new(FailureKind::ValidationFailed, message)
            }
            Err(TaskError::Unknown(e)) => {
                tracing::error!(error = ?e, "Unknown error when generating");
                TaskFailure::new(FailureKind::Unknown, UNKNOWN_ERROR_MESSAGE)
            }
        };

        let kind = failure.kind;
        if let Err(e) = publisher
            .publish_error(failure, PublishFrom::ApplicationManager)
            .await
        {
            tracing::debug!(error = %e, "Could not deliver failure to consumer");
        }
        WorkerOutcome::Failed(kind)
    }
}

async fn pump(runner: &dyn Runner, ctx: RunContext, publisher: &TaskPublisher) -> Result<(), TaskError> {
    let mut events = runner.run(ctx).await?;
    while let Some(event) = events.next().await {
        publisher
            .publish(event?, PublishFrom::ApplicationManager)
            .await?;
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
