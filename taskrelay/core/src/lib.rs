//! Taskrelay Core - Streamed Generation Task Plumbing
//!
//! This crate runs long-lived generation tasks (model inference, tool calls,
//! workflow steps) behind a streaming response. It owns everything between
//! "a request was admitted" and "the last frame went out", independent of any
//! HTTP framework or model provider.
//!
//! # Architecture
//!
//! ```text
//!   start_task ──▶ DailyRateLimiter ──▶ ConcurrencyLimiter.enter
//!                                              │ lease
//!                                              ▼
//!                        TaskChannel::open (ownership record)
//!                          │                          │
//!                 TaskPublisher                 TaskListener
//!                          │                          │ 1s polls
//!        WorkerSupervisor ─┤                          ├─ Ping every 10s
//!          └─ Runner ──────┘                          ├─ Stop{timeout|manual}
//!                                                     ▼
//!                                     wire frames ─▶ LeasedStream ─▶ consumer
//!                                                     (exit on end/error/close)
//!
//!   request_stop ──▶ CancellationRegistry ──▶ stop flag in the SharedStore
//! ```
//!
//! All cross-process state lives in a [`SharedStore`]: ownership records,
//! stop flags, lease hashes and limiter configuration. Several processes can
//! serve the same apps; a stop request served by one reaches a task drained
//! by another.
//!
//! # Key Types
//!
//! - [`GenerationService`]: admits tasks and routes stop requests
//! - [`TaskChannel`]: per-task event queue with heartbeat and stop injection
//! - [`CancellationRegistry`]: task ownership and stop flags
//! - [`ConcurrencyLimiter`]: per-app admission control backed by leases
//! - [`LeasedStream`]: releases an admission lease exactly once
//! - [`WorkerSupervisor`]: runs a [`Runner`] and classifies its outcome
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use taskrelay_core::{GenerationService, MemoryStore, StartRequest, TaskRelayConfig};
//!
//! let config = taskrelay_core::config::load_config()?;
//! let service = GenerationService::new(Arc::new(MemoryStore::new()), config);
//!
//! let request = StartRequest::new("app-1", owner).with_app_limit(10);
//! let mut started = service.start_task(request, runner).await?;
//! while let Some(frame) = started.stream.next().await {
//!     write_to_client(frame?.to_sse()).await;
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod daily;
pub mod events;
pub mod lease;
pub mod limiter;
pub mod registry;
pub mod runner;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod tasks;
pub mod wire;

// Re-exports for convenience
pub use channel::{ChannelConfig, PublishError, TaskChannel, TaskListener, TaskPublisher};
pub use daily::DailyRateLimiter;
pub use events::{
    Event, FailureKind, LiveHandleError, Payload, PublishFrom, QueueMessage, RowHandle,
    StopReason, TaskFailure,
};
pub use lease::{Lease, LeasedStream};
pub use limiter::{ConcurrencyLimiter, LimiterConfig, LimiterError, LimiterMetrics, LimiterRegistry};
pub use registry::{CancellationRegistry, RegistryConfig};
pub use runner::{EventStream, ExecutionContext, RunContext, Runner, TaskError, TaskScope};
pub use service::{
    effective_limit, AdmissionError, GenerationService, StartRequest, StartedTask, WireStream,
};
pub use store::{MemoryStore, SharedStore, StoreError, WindowStore};
pub use supervisor::{WorkerOutcome, WorkerSupervisor};
pub use tasks::{
    InvokeSource, MissingUserError, Owner, PrincipalKind, RequestId, Route, Task, TaskId,
};
pub use wire::{to_wire, WireError, WireEvent};

// Configuration
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, TaskRelayConfig,
};
