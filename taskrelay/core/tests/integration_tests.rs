//! Integration tests for the task lifecycle
//!
//! These tests drive several components together the way a serving process
//! does. Tests cover:
//! - Admission control across start/finish cycles
//! - Channel invariants seen from the producer side
//! - Heartbeat cadence and stop/timeout injection on the drain side
//! - Lease release on end, error, early close and disconnect
//! - Stale lease reclamation after a producer crash
//! - TOML configuration affecting admission

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::time::Instant;

use taskrelay_core::config::load_config_from_path;
use taskrelay_core::{
    AdmissionError, CancellationRegistry, ChannelConfig, Event, EventStream, GenerationService,
    LimiterConfig, LimiterRegistry, MemoryStore, Owner, Payload, PrincipalKind, PublishError,
    PublishFrom, RegistryConfig, RequestId, Route, RowHandle, RunContext, Runner, SharedStore,
    StartRequest, Task, TaskChannel, TaskError, TaskRelayConfig, WireEvent,
    WorkerOutcome,
};

// =============================================================================
// Test Runners
// =============================================================================

/// Emits one message and ends
struct OneShot;

#[async_trait]
impl Runner for OneShot {
    fn name(&self) -> &str {
        "one-shot"
    }

    async fn run(&self, _ctx: RunContext) -> Result<EventStream, TaskError> {
        Ok(futures::stream::iter(vec![
            Ok(Event::message("hello")),
            Ok(Event::end(Payload::text("bye"))),
        ])
        .boxed())
    }
}

/// Emits a message every `interval`, forever
struct Ticker {
    interval: Duration,
}

#[async_trait]
impl Runner for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    async fn run(&self, _ctx: RunContext) -> Result<EventStream, TaskError> {
        let interval = self.interval;
        Ok(futures::stream::unfold(0u64, move |i| async move {
            tokio::time::sleep(interval).await;
            Some((Ok(Event::message(format!("tick-{i}"))), i + 1))
        })
        .boxed())
    }
}

/// Fails with an unknown error after one message
struct Failing;

#[async_trait]
impl Runner for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _ctx: RunContext) -> Result<EventStream, TaskError> {
        Ok(futures::stream::iter(vec![
            Ok(Event::message("partial")),
            Err(TaskError::Unknown(anyhow::anyhow!("backend connection reset"))),
        ])
        .boxed())
    }
}

fn owner(id: &str) -> Owner {
    Owner::new(PrincipalKind::EndUser, id).unwrap()
}

fn event_name(frame: &WireEvent) -> String {
    match frame {
        WireEvent::Ping => "ping".to_string(),
        WireEvent::Data(value) => value["event"].as_str().unwrap_or_default().to_string(),
    }
}

// =============================================================================
// Test 1: Admission Over a Full Cycle
// =============================================================================

/// An app limited to one concurrent task rejects the second start and admits
/// again once the first has finished.
#[tokio::test]
async fn test_concurrency_limit_over_task_cycle() {
    let store = Arc::new(MemoryStore::new());
    let service = GenerationService::new(store, TaskRelayConfig::default());
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(1);

    let first = service
        .start_task(request.clone(), Arc::new(OneShot))
        .await
        .unwrap();

    let err = service
        .start_task(request.clone(), Arc::new(OneShot))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::QuotaExceeded { limit: 1, .. }));
    assert!(err.to_string().contains("app-1 is 1"));

    let frames = first.collect_frames().await.unwrap();
    let names: Vec<String> = frames.iter().map(event_name).collect();
    assert_eq!(names, vec!["message", "end"]);

    let limiter = service.limiters().get_or_create("app-1", 1).await.unwrap();
    assert_eq!(limiter.active_count().await.unwrap(), 0);

    let again = service.start_task(request, Arc::new(OneShot)).await.unwrap();
    assert_eq!(again.worker.await.unwrap(), WorkerOutcome::Completed);
}

/// The tighter of the app limit and the global limit applies.
#[tokio::test]
async fn test_global_limit_caps_app_limit() {
    let mut config = TaskRelayConfig::default();
    config.max_active_requests = 1;
    let service = GenerationService::new(Arc::new(MemoryStore::new()), config);
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(10);

    let _first = service
        .start_task(request.clone(), Arc::new(OneShot))
        .await
        .unwrap();
    let err = service
        .start_task(request, Arc::new(OneShot))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::QuotaExceeded { limit: 1, .. }));
}

/// With no limit anywhere the limiter hands out the sentinel.
#[tokio::test]
async fn test_unlimited_app() {
    let store = Arc::new(MemoryStore::new());
    let service = GenerationService::new(store, TaskRelayConfig::default());

    let started = service
        .start_task(StartRequest::new("app", owner("u1")), Arc::new(OneShot))
        .await
        .unwrap();
    assert!(started.request_id.is_unlimited());
    started.collect_frames().await.unwrap();
}

// =============================================================================
// Test 2: Channel Invariants
// =============================================================================

/// Nothing can be published after a terminal event, and live row handles
/// never reach the queue.
#[tokio::test]
async fn test_publish_invariants() {
    let registry = CancellationRegistry::new(Arc::new(MemoryStore::new()), RegistryConfig::default());
    let task = Task::new(owner("u1"), Route::Task);
    let (publisher, mut listener) = TaskChannel::open(task, registry, ChannelConfig::default())
        .await
        .unwrap()
        .split();

    let with_row = Payload::map([("message", RowHandle::new("messages", "42").into())]);
    let rejected = publisher
        .publish(Event::message(with_row), PublishFrom::ApplicationManager)
        .await;
    assert!(matches!(rejected, Err(PublishError::LiveHandle(ref e)) if e.path == "$.message"));

    publisher
        .publish(Event::end(Payload::Null), PublishFrom::ApplicationManager)
        .await
        .unwrap();
    let late = publisher
        .publish(Event::message("late"), PublishFrom::ApplicationManager)
        .await;
    assert_eq!(late, Err(PublishError::Closed));

    let delivered = listener.next().await.unwrap();
    assert!(delivered.event.is_terminal());
    assert!(listener.next().await.is_none());
}

// =============================================================================
// Test 3: Drain-Side Injection
// =============================================================================

/// A producer silent for 35 seconds gets exactly three heartbeats.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence() {
    let registry = CancellationRegistry::new(Arc::new(MemoryStore::new()), RegistryConfig::default());
    let task = Task::new(owner("u1"), Route::Task);
    let (publisher, listener) = TaskChannel::open(task, registry, ChannelConfig::default())
        .await
        .unwrap()
        .split();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(35)).await;
        publisher
            .publish(Event::end(Payload::Null), PublishFrom::ApplicationManager)
            .await
            .unwrap();
    });

    let events: Vec<Event> = listener.into_stream().map(|m| m.event).collect().await;
    let pings = events.iter().filter(|e| **e == Event::Ping).count();
    assert_eq!(pings, 3);
    assert_eq!(events.last(), Some(&Event::end(Payload::Null)));
}

/// A stop from the owner reaches the consumer within one poll interval, the
/// producer unwinds, and the lease is returned.
#[tokio::test(start_paused = true)]
async fn test_owner_stop_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let service = GenerationService::new(store, TaskRelayConfig::default());
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(2);

    let mut started = service
        .start_task(
            request,
            Arc::new(Ticker {
                interval: Duration::from_secs(5),
            }),
        )
        .await
        .unwrap();

    let first = started.stream.next().await.unwrap().unwrap();
    assert_eq!(event_name(&first), "message");

    // A different principal is ignored.
    service
        .request_stop(&started.task_id, &owner("u2"))
        .await
        .unwrap();
    // Same ID, other principal class: also ignored.
    service
        .request_stop(
            &started.task_id,
            &Owner::new(PrincipalKind::Account, "u1").unwrap(),
        )
        .await
        .unwrap();

    let stop_requested = Instant::now();
    service
        .request_stop(&started.task_id, &owner("u1"))
        .await
        .unwrap();

    let mut saw_stop = false;
    while let Some(frame) = started.stream.next().await {
        let frame = frame.unwrap();
        if let WireEvent::Data(value) = &frame {
            if value["event"] == "stop" {
                assert_eq!(value["reason"], "user_manual");
                assert!(stop_requested.elapsed() <= Duration::from_secs(1));
                saw_stop = true;
            }
        }
    }
    assert!(saw_stop);
    assert_eq!(started.worker.await.unwrap(), WorkerOutcome::Cancelled);

    let limiter = service.limiters().get_or_create("app-1", 2).await.unwrap();
    assert_eq!(limiter.active_count().await.unwrap(), 0);
}

/// A task over its execution budget is stopped with reason `timeout`.
#[tokio::test(start_paused = true)]
async fn test_execution_budget() {
    let mut config = TaskRelayConfig::default();
    config.channel = config.channel.with_max_execution_time(Duration::from_secs(30));
    let service = GenerationService::new(Arc::new(MemoryStore::new()), config);

    let started = service
        .start_task(
            StartRequest::new("app", owner("u1")).with_app_limit(1),
            Arc::new(Ticker {
                interval: Duration::from_secs(7),
            }),
        )
        .await
        .unwrap();
    let worker = started.worker;
    let frames: Vec<WireEvent> = started
        .stream
        .map(|frame| frame.unwrap())
        .collect()
        .await;

    let last = frames.last().unwrap();
    let WireEvent::Data(value) = last else {
        panic!("expected a data frame, got {last:?}");
    };
    assert_eq!(value["event"], "stop");
    assert_eq!(value["reason"], "timeout");
    assert_eq!(frames.iter().filter(|f| **f == WireEvent::Ping).count(), 2);
    assert_eq!(worker.await.unwrap(), WorkerOutcome::Cancelled);
}

// =============================================================================
// Test 4: Lease Release Paths
// =============================================================================

/// A failing producer ends the stream with a generic error and frees its slot.
#[tokio::test]
async fn test_producer_failure_releases_lease() {
    let service = GenerationService::new(Arc::new(MemoryStore::new()), TaskRelayConfig::default());
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(1);

    let started = service
        .start_task(request.clone(), Arc::new(Failing))
        .await
        .unwrap();
    let frames = started.collect_frames().await.unwrap();
    let WireEvent::Data(error) = frames.last().unwrap() else {
        panic!("expected a data frame");
    };
    assert_eq!(error["event"], "error");
    assert_eq!(error["error"]["kind"], "unknown");
    assert!(!error.to_string().contains("connection reset"));

    assert!(service.start_task(request, Arc::new(OneShot)).await.is_ok());
}

/// Closing the stream early cancels the producer and frees the slot, and a
/// second close is harmless.
#[tokio::test(start_paused = true)]
async fn test_early_close_releases_lease() {
    let service = GenerationService::new(Arc::new(MemoryStore::new()), TaskRelayConfig::default());
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(1);

    let mut started = service
        .start_task(
            request.clone(),
            Arc::new(Ticker {
                interval: Duration::from_millis(200),
            }),
        )
        .await
        .unwrap();
    started.stream.next().await.unwrap().unwrap();

    started.stream.close().await;
    started.stream.close().await;
    assert_eq!(started.worker.await.unwrap(), WorkerOutcome::Cancelled);

    assert!(service.start_task(request, Arc::new(OneShot)).await.is_ok());
}

/// Dropping the stream (client disconnect) releases the lease too.
#[tokio::test]
async fn test_disconnect_releases_lease() {
    let service = GenerationService::new(Arc::new(MemoryStore::new()), TaskRelayConfig::default());
    let request = StartRequest::new("app-1", owner("u1")).with_app_limit(1);

    let started = service
        .start_task(
            request.clone(),
            Arc::new(Ticker {
                interval: Duration::from_millis(10),
            }),
        )
        .await
        .unwrap();
    let worker = started.worker;
    drop(started.stream);
    assert_eq!(worker.await.unwrap(), WorkerOutcome::Cancelled);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(service.start_task(request, Arc::new(OneShot)).await.is_ok());
}

// =============================================================================
// Test 5: Limiter Protocol Across Processes
// =============================================================================

/// A lease left behind by a crashed process blocks admission until a
/// reconciliation reclaims it.
#[tokio::test]
async fn test_stale_lease_reclaimed() {
    let store = Arc::new(MemoryStore::new());
    let survivor = LimiterRegistry::new(store.clone(), LimiterConfig::default());
    let limiter = survivor.get_or_create("app-1", 1).await.unwrap();

    // The crashed process admitted a request eleven minutes ago.
    let admitted_at = chrono::Utc::now().timestamp() - 11 * 60;
    store
        .hset(
            "taskrelay:rate_limit:app-1:active_requests",
            "crashed-request",
            &admitted_at.to_string(),
        )
        .await
        .unwrap();

    assert!(limiter.enter(None).await.is_err());
    assert_eq!(limiter.reconcile().await.unwrap(), 1);
    assert!(limiter.enter(None).await.is_ok());
}

/// Releasing twice or releasing an unknown request changes nothing.
#[tokio::test]
async fn test_exit_is_idempotent_across_processes() {
    let store = Arc::new(MemoryStore::new());
    let a = LimiterRegistry::new(store.clone(), LimiterConfig::default())
        .get_or_create("app-1", 2)
        .await
        .unwrap();
    let b = LimiterRegistry::new(store.clone(), LimiterConfig::default())
        .get_or_create("app-1", 2)
        .await
        .unwrap();

    let id_a = a.enter(None).await.unwrap();
    let id_b = b.enter(None).await.unwrap();

    a.exit(&id_a).await.unwrap();
    b.exit(&id_a).await.unwrap();
    a.exit(&RequestId::new("never-admitted")).await.unwrap();
    assert_eq!(a.active_count().await.unwrap(), 1);

    b.exit(&id_b).await.unwrap();
    assert_eq!(a.active_count().await.unwrap(), 0);
}

// =============================================================================
// Test 6: TOML Configuration Affects Admission
// =============================================================================

#[tokio::test]
async fn test_toml_config_limits_admission() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[limiter]\nmax_active_requests = 1\n\n[daily]\nenabled = true\nlimit = 2\n")
        .unwrap();
    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

    let service = GenerationService::new(Arc::new(MemoryStore::new()), config);
    let request = StartRequest::new("app-1", owner("u1")).with_daily_quota("tenant-1");

    let first = service
        .start_task(request.clone(), Arc::new(OneShot))
        .await
        .unwrap();
    assert!(matches!(
        service.start_task(request.clone(), Arc::new(OneShot)).await,
        Err(AdmissionError::QuotaExceeded { .. })
    ));
    first.collect_frames().await.unwrap();

    // The rejected attempt still counted against the daily quota.
    assert_eq!(
        service
            .start_task(request, Arc::new(OneShot))
            .await
            .unwrap_err(),
        AdmissionError::DailyQuotaExceeded { limit: 2 }
    );
}
