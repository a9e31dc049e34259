//! Task Channel
//!
//! Single-producer/single-consumer event queue for one task. The producer
//! publishes through a [`TaskPublisher`]; the consuming request drains a
//! [`TaskListener`].
//!
//! # Draining
//!
//! ```text
//!   producer ──publish──▶ [ queue ] ──recv (1s polls)──▶ listener ──▶ consumer
//!                             ▲                              │
//!                             └── Ping / Stop{timeout|manual}┘
//! ```
//!
//! Each poll either yields an event or times out. After every poll the
//! listener checks the execution budget and the shared stop flag and, if
//! either fired, publishes a synthetic `Stop` through the queue so that it is
//! delivered after everything already enqueued. Every heartbeat interval of
//! wall time it publishes a `Ping` so idle-but-healthy streams are not reaped
//! by intermediaries.
//!
//! # Closing
//!
//! Publishing a terminal event closes the channel. Closing drops the only
//! sender, so the listener sees the end once buffered events are drained, and
//! any later publish fails with [`PublishError::Closed`]. Dropping the listener
//! closes the channel as well.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::{Event, LiveHandleError, PublishFrom, QueueMessage, StopReason, TaskFailure};
use crate::registry::CancellationRegistry;
use crate::store::StoreError;
use crate::tasks::Task;

// ============================================================================
// Configuration
// ============================================================================

/// Timing configuration for task channels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long a single drain poll blocks before re-checking deadlines
    pub poll_interval: Duration,
    /// Wall time between synthesized `Ping` events
    pub heartbeat_interval: Duration,
    /// Budget for the whole task before a timeout stop is injected
    pub max_execution_time: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            max_execution_time: Duration::from_secs(1200),
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the maximum execution time
    #[must_use]
    pub fn with_max_execution_time(mut self, budget: Duration) -> Self {
        self.max_execution_time = budget;
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by [`TaskPublisher::publish`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The payload carries a live row handle
    #[error(transparent)]
    LiveHandle(#[from] LiveHandleError),

    /// The channel was closed by a terminal event, the supervisor, or the consumer
    #[error("task channel is closed")]
    Closed,

    /// The task's stop flag is set; the producer should unwind
    #[error("task was stopped")]
    Stopped,

    /// The stop flag could not be read
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Channel
// ============================================================================

struct Shared {
    task: Task,
    registry: CancellationRegistry,
    sender: Mutex<Option<mpsc::UnboundedSender<QueueMessage>>>,
    published: AtomicU64,
}

/// A freshly opened task channel
///
/// Split it into the producer and consumer halves with [`TaskChannel::split`].
pub struct TaskChannel {
    publisher: TaskPublisher,
    listener: TaskListener,
}

impl TaskChannel {
    /// Open a channel for `task`
    ///
    /// Registers the task owner before returning, so a stop request can never
    /// observe a task that has already published without an owner record.
    ///
    /// # Errors
    ///
    /// Returns an error if the ownership record cannot be written.
    pub async fn open(
        task: Task,
        registry: CancellationRegistry,
        config: ChannelConfig,
    ) -> Result<Self, StoreError> {
        registry.register_owner(&task.id, &task.owner).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let publisher = TaskPublisher {
            shared: Arc::new(Shared {
                task,
                registry,
                sender: Mutex::new(Some(sender)),
                published: AtomicU64::new(0),
            }),
        };
        let listener = TaskListener {
            publisher: publisher.clone(),
            receiver,
            config,
            started_at: Instant::now(),
            last_ping_bucket: 0,
            stop_injected: false,
            finished: false,
        };

        Ok(Self {
            publisher,
            listener,
        })
    }

    /// Get a publisher handle
    #[must_use]
    pub fn publisher(&self) -> TaskPublisher {
        self.publisher.clone()
    }

    /// Split into producer and consumer halves
    #[must_use]
    pub fn split(self) -> (TaskPublisher, TaskListener) {
        (self.publisher, self.listener)
    }
}

/// Producer half of a task channel
#[derive(Clone)]
pub struct TaskPublisher {
    shared: Arc<Shared>,
}

impl TaskPublisher {
    /// The task this channel belongs to
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.shared.task
    }

    /// Publish an event
    ///
    /// Terminal events close the channel after being enqueued. Publishes from
    /// [`PublishFrom::ApplicationManager`] then re-check the stop flag and
    /// return [`PublishError::Stopped`] if it is set.
    ///
    /// # Errors
    ///
    /// - [`PublishError::LiveHandle`] if the payload carries a row handle
    /// - [`PublishError::Closed`] if the channel is already closed
    /// - [`PublishError::Stopped`] if the task was stopped
    /// - [`PublishError::Store`] if the stop flag cannot be read
    pub async fn publish(&self, event: Event, from: PublishFrom) -> Result<(), PublishError> {
        event.validate()?;
        let terminal = event.is_terminal();

        {
            let mut sender = self.shared.sender.lock();
            let Some(tx) = sender.as_ref() else {
                return Err(PublishError::Closed);
            };
            if tx.send(QueueMessage::new(&self.shared.task, event)).is_err() {
                *sender = None;
                return Err(PublishError::Closed);
            }
            self.shared.published.fetch_add(1, Ordering::Relaxed);
            if terminal {
                *sender = None;
            }
        }

        if from == PublishFrom::ApplicationManager
            && self.shared.registry.is_stopped(&self.shared.task.id).await?
        {
            return Err(PublishError::Stopped);
        }

        Ok(())
    }

    /// Publish a terminal error event
    ///
    /// # Errors
    ///
    /// See [`TaskPublisher::publish`].
    pub async fn publish_error(&self, error: TaskFailure, from: PublishFrom) -> Result<(), PublishError> {
        self.publish(Event::error(error), from).await
    }

    /// Close the channel; returns whether this call did the closing
    pub fn close(&self) -> bool {
        let closed = self.shared.sender.lock().take().is_some();
        if closed {
            tracing::debug!(task_id = %self.shared.task.id, "Task channel closed");
        }
        closed
    }

    /// Whether a stop has been requested for this task
    ///
    /// # Errors
    ///
    /// Returns an error if the stop flag cannot be read.
    pub async fn is_stopped(&self) -> Result<bool, StoreError> {
        self.shared.registry.is_stopped(&self.shared.task.id).await
    }

    /// Whether the channel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.sender.lock().is_none()
    }

    /// Number of events accepted so far
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TaskPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPublisher")
            .field("task_id", &self.shared.task.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer half of a task channel
pub struct TaskListener {
    publisher: TaskPublisher,
    receiver: mpsc::UnboundedReceiver<QueueMessage>,
    config: ChannelConfig,
    started_at: Instant,
    last_ping_bucket: u64,
    stop_injected: bool,
    finished: bool,
}

impl TaskListener {
    /// The task this channel belongs to
    #[must_use]
    pub fn task(&self) -> &Task {
        self.publisher.task()
    }

    /// Pull the next event
    ///
    /// Returns `None` once a terminal event has been delivered or the channel
    /// has been closed and drained.
    pub async fn next(&mut self) -> Option<QueueMessage> {
        while !self.finished {
            let polled = tokio::time::timeout(self.config.poll_interval, self.receiver.recv()).await;
            self.check_deadlines().await;

            match polled {
                Ok(Some(message)) => {
                    if message.event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(message);
                }
                Ok(None) => self.finished = true,
                Err(_elapsed) => {}
            }
        }
        None
    }

    /// Turn the listener into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = QueueMessage> + Send + 'static {
        futures::stream::unfold(self, |mut listener| async move {
            listener.next().await.map(|message| (message, listener))
        })
    }

    /// Inject timeout/stop and heartbeat events when due
    async fn check_deadlines(&mut self) {
        let elapsed = self.started_at.elapsed();
        let task_id = &self.publisher.task().id;

        if !self.stop_injected {
            let reason = if elapsed >= self.config.max_execution_time {
                Some(StopReason::Timeout)
            } else {
                match self.publisher.shared.registry.is_stopped(task_id).await {
                    Ok(true) => Some(StopReason::UserManual),
                    Ok(false) => None,
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to read stop flag");
                        None
                    }
                }
            };

            if let Some(reason) = reason {
                self.stop_injected = true;
                tracing::info!(task_id = %task_id, reason = ?reason, "Stopping task");
                // A closed channel already ends the drain.
                let _ = self
                    .publisher
                    .publish(Event::stop(reason), PublishFrom::TaskPipeline)
                    .await;
            }
        }

        let heartbeat_secs = self.config.heartbeat_interval.as_secs().max(1);
        let bucket = elapsed.as_secs() / heartbeat_secs;
        if bucket > self.last_ping_bucket {
            self.last_ping_bucket = bucket;
            let _ = self
                .publisher
                .publish(Event::Ping, PublishFrom::TaskPipeline)
                .await;
        }
    }
}

impl Drop for TaskListener {
    fn drop(&mut self) {
        self.publisher.close();
    }
}

impl std::fmt::Debug for TaskListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskListener")
            .field("task_id", &self.task().id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FailureKind, Payload, RowHandle};
    use crate::registry::RegistryConfig;
    use crate::store::MemoryStore;
    use crate::tasks::{Owner, PrincipalKind, Route};

    async fn open(config: ChannelConfig) -> (CancellationRegistry, TaskPublisher, TaskListener) {
        let store = Arc::new(MemoryStore::new());
        let registry = CancellationRegistry::new(store, RegistryConfig::default());
        let owner = Owner::new(PrincipalKind::EndUser, "u1").unwrap();
        let task = Task::new(owner, Route::Task);
        let (publisher, listener) = TaskChannel::open(task, registry.clone(), config)
            .await
            .unwrap()
            .split();
        (registry, publisher, listener)
    }

    #[test]
    fn test_config_default() {
        let config = ChannelConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.max_execution_time, Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let (_, publisher, mut listener) = open(ChannelConfig::default()).await;
        for i in 0..5 {
            publisher
                .publish(Event::message(format!("chunk-{i}")), PublishFrom::ApplicationManager)
                .await
                .unwrap();
        }
        publisher
            .publish(Event::end(Payload::Null), PublishFrom::ApplicationManager)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(message) = listener.next().await {
            seen.push(message.event);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], Event::message("chunk-0"));
        assert_eq!(seen[4], Event::message("chunk-4"));
        assert!(seen[5].is_terminal());
    }

    #[tokio::test]
    async fn test_terminal_event_closes_channel() {
        let (_, publisher, _listener) = open(ChannelConfig::default()).await;
        publisher
            .publish(Event::message("a"), PublishFrom::ApplicationManager)
            .await
            .unwrap();
        publisher
            .publish(Event::end(Payload::Null), PublishFrom::ApplicationManager)
            .await
            .unwrap();
        assert!(publisher.is_closed());

        let late = publisher
            .publish(Event::message("late"), PublishFrom::ApplicationManager)
            .await;
        assert_eq!(late, Err(PublishError::Closed));
        assert_eq!(publisher.published_count(), 2);
    }

    #[tokio::test]
    async fn test_live_handle_rejected() {
        let (_, publisher, _listener) = open(ChannelConfig::default()).await;
        let payload = Payload::map([("row", RowHandle::new("messages", "1").into())]);
        let result = publisher
            .publish(Event::message(payload), PublishFrom::ApplicationManager)
            .await;
        assert!(matches!(result, Err(PublishError::LiveHandle(_))));
        assert_eq!(publisher.published_count(), 0);
        assert!(!publisher.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_, publisher, mut listener) = open(ChannelConfig::default()).await;
        assert!(publisher.close());
        assert!(!publisher.close());
        assert!(listener.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_listener_closes_channel() {
        let (_, publisher, listener) = open(ChannelConfig::default()).await;
        drop(listener);
        let result = publisher
            .publish(Event::message("x"), PublishFrom::ApplicationManager)
            .await;
        assert_eq!(result, Err(PublishError::Closed));
    }

    #[tokio::test]
    async fn test_producer_publish_observes_stop() {
        let (registry, publisher, _listener) = open(ChannelConfig::default()).await;
        let owner = publisher.task().owner.clone();
        registry
            .request_stop(&publisher.task().id, &owner)
            .await
            .unwrap();

        let from_producer = publisher
            .publish(Event::message("x"), PublishFrom::ApplicationManager)
            .await;
        assert_eq!(from_producer, Err(PublishError::Stopped));

        let from_pipeline = publisher
            .publish(Event::Ping, PublishFrom::TaskPipeline)
            .await;
        assert_eq!(from_pipeline, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_injected_within_one_poll() {
        let (registry, publisher, mut listener) = open(ChannelConfig::default()).await;
        let owner = publisher.task().owner.clone();
        let task_id = publisher.task().id.clone();

        let started = Instant::now();
        registry.request_stop(&task_id, &owner).await.unwrap();

        let message = listener.next().await.unwrap();
        assert_eq!(message.event, Event::stop(StopReason::UserManual));
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert!(listener.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_injects_stop() {
        let config = ChannelConfig::new().with_max_execution_time(Duration::from_secs(5));
        let (_, publisher, mut listener) = open(config).await;

        let message = listener.next().await.unwrap();
        assert_eq!(message.event, Event::stop(StopReason::Timeout));
        assert!(publisher.is_closed());
        assert!(listener.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_delivered_after_pending_events() {
        let (registry, publisher, mut listener) = open(ChannelConfig::default()).await;
        publisher
            .publish(Event::message("before"), PublishFrom::TaskPipeline)
            .await
            .unwrap();
        let owner = publisher.task().owner.clone();
        registry
            .request_stop(&publisher.task().id, &owner)
            .await
            .unwrap();

        assert_eq!(listener.next().await.unwrap().event, Event::message("before"));
        assert_eq!(
            listener.next().await.unwrap().event,
            Event::stop(StopReason::UserManual)
        );
        assert!(listener.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_error_is_terminal() {
        let (_, publisher, mut listener) = open(ChannelConfig::default()).await;
        publisher
            .publish_error(
                TaskFailure::new(FailureKind::Unauthorized, "Incorrect API key provided"),
                PublishFrom::ApplicationManager,
            )
            .await
            .unwrap();
        let message = listener.next().await.unwrap();
        assert!(matches!(message.event, Event::Error { .. }));
        assert!(listener.next().await.is_none());
    }
}
