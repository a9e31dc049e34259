//! Generation Service
//!
//! The two operations offered across process boundaries: start a task and
//! stop one.
//!
//! # Admission
//!
//! ```text
//! start_task
//!   ├─ daily quota (quota-bound tenants only)   ── DailyQuotaExceeded
//!   ├─ effective limit = min(app, global) of positive values
//!   ├─ limiter.enter                            ── QuotaExceeded
//!   ├─ open channel (writes ownership record)   ── lease released on failure
//!   ├─ spawn supervisor with the runner
//!   └─ return LeasedStream over the wire frames
//! ```
//!
//! Admission failures are returned before any task exists. Failures inside
//! the runner arrive on the stream as terminal `Error` events.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::channel::TaskChannel;
use crate::config::TaskRelayConfig;
use crate::daily::DailyRateLimiter;
use crate::lease::{Lease, LeasedStream};
use crate::limiter::{LimiterError, LimiterRegistry};
use crate::registry::CancellationRegistry;
use crate::runner::{ExecutionContext, Runner};
use crate::store::{SharedStore, StoreError, WindowStore};
use crate::supervisor::{WorkerOutcome, WorkerSupervisor};
use crate::tasks::{InvokeSource, MissingUserError, Owner, RequestId, Route, Task, TaskId};
use crate::wire::{to_wire, WireError, WireEvent};

/// Sorted-set prefix of the daily quota
pub const DAILY_QUOTA_PREFIX: &str = "app_daily_rate_limiter";

/// Errors returned synchronously by [`GenerationService::start_task`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The app is at its concurrency limit
    #[error(
        "Too many requests. Please try again later. The current maximum concurrent requests allowed for {client_id} is {limit}."
    )]
    QuotaExceeded {
        /// The app that hit its limit
        client_id: String,
        /// The effective limit
        limit: i64,
    },

    /// The tenant used up its daily quota
    #[error("Rate limit exceeded, please upgrade your plan or your RPD was {limit} requests/day")]
    DailyQuotaExceeded {
        /// Requests allowed per day
        limit: u64,
    },

    /// No principal was given
    #[error(transparent)]
    MissingUser(#[from] MissingUserError),

    /// The shared store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LimiterError> for AdmissionError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::QuotaExceeded { client_id, limit } => {
                Self::QuotaExceeded { client_id, limit }
            }
            LimiterError::Store(e) => Self::Store(e),
        }
    }
}

/// Parameters of one task admission
#[derive(Clone, Debug)]
pub struct StartRequest {
    /// App the task runs for; the concurrency limit is per app
    pub app_id: String,
    /// Principal starting the task
    pub owner: Owner,
    /// Routing context stamped on every event
    pub route: Route,
    /// The app's own concurrency cap (0 = none)
    pub app_max_active_requests: i64,
    /// Tenant to count against the daily quota, if quota-bound
    pub daily_quota_key: Option<String>,
    /// Ambient context handed to the runner
    pub context: ExecutionContext,
}

impl StartRequest {
    /// Create a request for `app_id` on behalf of `owner`
    pub fn new(app_id: impl Into<String>, owner: Owner) -> Self {
        let context = ExecutionContext::capture(None, Some(owner.id.clone()), None);
        Self {
            app_id: app_id.into(),
            owner,
            route: Route::Task,
            app_max_active_requests: 0,
            daily_quota_key: None,
            context,
        }
    }

    /// Create a request from the surface it came in through
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::MissingUser`] if `user_id` is empty.
    pub fn from_source(
        app_id: impl Into<String>,
        source: InvokeSource,
        user_id: impl Into<String>,
    ) -> Result<Self, AdmissionError> {
        Ok(Self::new(app_id, Owner::from_source(source, user_id)?))
    }

    /// Set the routing context
    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Set the app's own concurrency cap
    #[must_use]
    pub fn with_app_limit(mut self, max_active_requests: i64) -> Self {
        self.app_max_active_requests = max_active_requests;
        self
    }

    /// Count this request against `tenant_id`'s daily quota
    #[must_use]
    pub fn with_daily_quota(mut self, tenant_id: impl Into<String>) -> Self {
        self.daily_quota_key = Some(tenant_id.into());
        self
    }

    /// Set the ambient context
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }
}

/// Stream of wire frames that holds the admission lease
pub type WireStream = LeasedStream<BoxStream<'static, Result<WireEvent, WireError>>>;

/// A running task as seen by the admitting caller
#[derive(Debug)]
pub struct StartedTask {
    /// Task identifier, for stop requests
    pub task_id: TaskId,
    /// Admission identifier
    pub request_id: RequestId,
    /// Frames to forward to the consumer
    pub stream: WireStream,
    /// The supervised producer
    pub worker: JoinHandle<WorkerOutcome>,
}

impl StartedTask {
    /// Drain the whole task into memory (blocking response mode)
    ///
    /// The lease is released once the stream ends, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first frame that failed to serialize.
    pub async fn collect_frames(mut self) -> Result<Vec<WireEvent>, WireError> {
        let mut frames = Vec::new();
        let mut failure = None;
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.stream.close().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(frames),
        }
    }
}

/// Pick the tighter of two limits, ignoring non-positive (unlimited) ones
#[must_use]
pub fn effective_limit(app_limit: i64, global_limit: i64) -> i64 {
    [app_limit, global_limit]
        .into_iter()
        .filter(|limit| *limit > 0)
        .min()
        .unwrap_or(0)
}

/// Entry point for starting and stopping generation tasks
pub struct GenerationService {
    registry: CancellationRegistry,
    limiters: LimiterRegistry,
    daily: Option<DailyRateLimiter>,
    supervisor: WorkerSupervisor,
    config: TaskRelayConfig,
}

impl GenerationService {
    /// Create a service over a shared store
    pub fn new<S>(store: Arc<S>, config: TaskRelayConfig) -> Self
    where
        S: SharedStore + WindowStore + 'static,
    {
        let daily = config.daily_limit_enabled.then(|| {
            let window: Arc<dyn WindowStore> = store.clone();
            DailyRateLimiter::new(window, DAILY_QUOTA_PREFIX, config.daily_limit)
        });
        let shared: Arc<dyn SharedStore> = store;
        Self {
            registry: CancellationRegistry::new(shared.clone(), config.registry.clone()),
            limiters: LimiterRegistry::new(shared, config.limiter.clone()),
            daily,
            supervisor: WorkerSupervisor::new(config.debug),
            config,
        }
    }

    /// The cancellation registry
    #[must_use]
    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// The per-app limiters
    #[must_use]
    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    /// The active configuration
    #[must_use]
    pub fn config(&self) -> &TaskRelayConfig {
        &self.config
    }

    /// Admit a task and start its runner
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::DailyQuotaExceeded`] for quota-bound tenants over their quota
    /// - [`AdmissionError::QuotaExceeded`] if the app is at its concurrency limit
    /// - [`AdmissionError::Store`] if the shared store is unreachable
    pub async fn start_task(
        &self,
        request: StartRequest,
        runner: Arc<dyn Runner>,
    ) -> Result<StartedTask, AdmissionError> {
        if let (Some(daily), Some(tenant)) = (&self.daily, &request.daily_quota_key) {
            if daily.is_rate_limited(tenant).await? {
                tracing::warn!(tenant_id = %tenant, "Daily quota exhausted");
                return Err(AdmissionError::DailyQuotaExceeded {
                    limit: daily.max_requests(),
                });
            }
            daily.increment(tenant).await?;
        }

        let limit = effective_limit(request.app_max_active_requests, self.config.max_active_requests);
        let limiter = self.limiters.get_or_create(&request.app_id, limit).await?;
        let request_id = limiter.enter(None).await?;
        let lease = Lease::new(limiter, request_id.clone());

        let task = Task::new(request.owner, request.route);
        let channel =
            match TaskChannel::open(task, self.registry.clone(), self.config.channel.clone()).await {
                Ok(channel) => channel,
                Err(e) => {
                    lease.release().await;
                    return Err(e.into());
                }
            };
        let (publisher, listener) = channel.split();
        let task_id = publisher.task().id.clone();

        tracing::info!(
            task_id = %task_id,
            client_id = %request.app_id,
            request_id = %request_id,
            runner = runner.name(),
            "Task admitted"
        );

        let worker = self.supervisor.spawn(runner, publisher, request.context);
        let stream = LeasedStream::new(to_wire(listener.into_stream()).boxed(), lease);

        Ok(StartedTask {
            task_id,
            request_id,
            stream,
            worker,
        })
    }

    /// Ask a task to stop on behalf of `requester`
    ///
    /// Unknown tasks and tasks owned by someone else are ignored silently.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared store is unreachable.
    pub async fn request_stop(&self, task_id: &TaskId, requester: &Owner) -> Result<(), StoreError> {
        self.registry.request_stop(task_id, requester).await?;
        Ok(())
    }
}

impl std::fmt::Debug for GenerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationService")
            .field("limiters", &self.limiters)
            .field("daily", &self.daily)
            .finish_non_exhaustive()
    }
}
