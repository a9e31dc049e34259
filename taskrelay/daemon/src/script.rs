//! Scripted Runner
//!
//! A stand-in producer that emits numbered chunks on a fixed cadence and then
//! ends, fails, or keeps going forever. Used to exercise the task protocol
//! without a model provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use taskrelay_core::{Event, EventStream, Payload, RunContext, Runner, TaskError};

/// Failure the script ends with
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ScriptFailure {
    /// Credentials rejected
    Unauthorized,
    /// Malformed input
    Validation,
    /// Anything else
    Unknown,
}

impl ScriptFailure {
    fn into_error(self) -> TaskError {
        match self {
            Self::Unauthorized => TaskError::Unauthorized("provider returned 401".to_string()),
            Self::Validation => TaskError::ValidationFailed("query is required".to_string()),
            Self::Unknown => TaskError::Unknown(anyhow::anyhow!("upstream connection reset")),
        }
    }
}

/// Emits `ticks` chunks, one every `interval`
#[derive(Debug)]
pub struct ScriptedRunner {
    ticks: Option<u64>,
    interval: Duration,
    failure: Option<ScriptFailure>,
    sessions_closed: Arc<AtomicU64>,
}

impl ScriptedRunner {
    /// Emit `ticks` chunks, then end (`None` runs until stopped)
    #[must_use]
    pub fn new(ticks: Option<u64>, interval: Duration) -> Self {
        Self {
            ticks,
            interval,
            failure: None,
            sessions_closed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// End with `failure` instead of a normal completion
    #[must_use]
    pub fn with_failure(mut self, failure: Option<ScriptFailure>) -> Self {
        self.failure = failure;
        self
    }

    /// How many runs have released their session
    #[must_use]
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, ctx: RunContext) -> Result<EventStream, TaskError> {
        let closed = Arc::clone(&self.sessions_closed);
        ctx.scope.defer("session", move || {
            closed.fetch_add(1, Ordering::Relaxed);
        });
        tracing::info!(trace_id = %ctx.context.trace_id, ticks = ?self.ticks, "Script started");

        let interval = self.interval;
        let ticks = self.ticks;
        let failure = self.failure;

        let chunks = futures::stream::unfold(0u64, move |i| async move {
            if ticks.is_some_and(|n| i >= n) {
                return None;
            }
            tokio::time::sleep(interval).await;
            let chunk: Payload = serde_json::json!({
                "index": i,
                "text": format!("chunk {i}"),
            })
            .into();
            Some((Ok(Event::message(chunk)), i + 1))
        });

        let tail = futures::stream::once(async move {
            match failure {
                Some(failure) => Err(failure.into_error()),
                None => Ok(Event::end(Payload::map([("ticks", Payload::from(
                    serde_json::json!(ticks.unwrap_or_default()),
                ))]))),
            }
        });

        Ok(chunks.chain(tail).boxed())
    }
}
