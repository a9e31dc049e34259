//! Concurrency Limiting for Generation Tasks
//!
//! Caps how many tasks may run at once for one owning entity (an application,
//! identified by `client_id`). The limit is enforced across processes through a
//! leased-entry hash in the shared store:
//!
//! - `{prefix}:{client_id}:active_requests`: hash of `request_id -> admitted_at`
//! - `{prefix}:{client_id}:max_active_requests`: the effective limit
//!
//! # Design
//!
//! - A limit of zero or less disables the limiter. Disabled limiters never touch
//!   the store and hand out [`RequestId::UNLIMITED`].
//! - Admission reads the hash length, then inserts. The two steps are not
//!   atomic: concurrent admissions from several processes can overshoot the
//!   limit slightly. No lock sits on the admission path.
//! - Requests over the limit are rejected outright, never queued.
//! - Leases abandoned by crashed producers are reclaimed once they are older
//!   than `max_alive_time`, at most once per `reconcile_interval` per limiter.
//!
//! # Usage
//!
//! ```ignore
//! let registry = LimiterRegistry::new(store, LimiterConfig::default());
//! let limiter = registry.get_or_create("app-1", 10).await?;
//! let request_id = limiter.enter(None).await?;
//! // ... run the task ...
//! limiter.exit(&request_id).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::store::{SharedStore, StoreError};
use crate::tasks::RequestId;

// =============================================================================
// Configuration
// =============================================================================

/// Timing configuration shared by every limiter of a process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Key prefix in the shared store
    pub key_prefix: String,
    /// Age after which a lease is considered abandoned
    pub max_alive_time: Duration,
    /// Minimum time between opportunistic reconciliations
    pub reconcile_interval: Duration,
    /// TTL applied to the limit record and the lease hash
    pub record_ttl: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "taskrelay:rate_limit".to_string(),
            max_alive_time: Duration::from_secs(10 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
            record_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl LimiterConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store key prefix
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the lease staleness threshold
    #[must_use]
    pub fn with_max_alive_time(mut self, max_alive: Duration) -> Self {
        self.max_alive_time = max_alive;
        self
    }

    /// Set the reconciliation interval
    #[must_use]
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors related to admission control
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// Too many tasks in flight for this entity
    #[error(
        "Too many requests. Please try again later. The current maximum concurrent requests allowed for {client_id} is {limit}."
    )]
    QuotaExceeded {
        /// The entity that hit its limit
        client_id: String,
        /// The effective limit
        limit: i64,
    },

    /// The shared store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Concurrency Limiter
// =============================================================================

#[derive(Debug)]
struct LimiterState {
    max_active_requests: i64,
    initialized: bool,
    last_reconcile: Option<Instant>,
}

/// Admission control for one owning entity
///
/// Several processes may each hold a `ConcurrencyLimiter` for the same
/// `client_id`; they agree through the shared store.
pub struct ConcurrencyLimiter {
    client_id: String,
    store: Arc<dyn SharedStore>,
    config: LimiterConfig,
    active_key: String,
    max_key: String,
    state: Mutex<LimiterState>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl ConcurrencyLimiter {
    /// Create a limiter without touching the store
    ///
    /// Call [`ConcurrencyLimiter::initialize`] before use, or obtain limiters
    /// through a [`LimiterRegistry`] which does so.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        max_active_requests: i64,
        store: Arc<dyn SharedStore>,
        config: LimiterConfig,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            active_key: format!("{}:{client_id}:active_requests", config.key_prefix),
            max_key: format!("{}:{client_id}:max_active_requests", config.key_prefix),
            client_id,
            store,
            config,
            state: Mutex::new(LimiterState {
                max_active_requests,
                initialized: false,
                last_reconcile: None,
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// The entity this limiter guards
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current effective limit as seen by this process
    #[must_use]
    pub fn max_active_requests(&self) -> i64 {
        self.state.lock().max_active_requests
    }

    /// Whether the limiter is disabled
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.max_active_requests() <= 0
    }

    /// Publish the local limit to the store on first use
    ///
    /// The local value wins only here; afterwards the stored value is
    /// authoritative. No-op for disabled or already initialized limiters.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        {
            let state = self.state.lock();
            if state.max_active_requests <= 0 || state.initialized {
                return Ok(());
            }
        }
        self.sync(true).await?;
        self.state.lock().initialized = true;
        Ok(())
    }

    /// Admit a request
    ///
    /// Uses `request_id` if given, otherwise generates one.
    ///
    /// # Errors
    ///
    /// - [`LimiterError::QuotaExceeded`] if the entity is at its limit
    /// - [`LimiterError::Store`] if the store is unreachable
    pub async fn enter(&self, request_id: Option<RequestId>) -> Result<RequestId, LimiterError> {
        let reconcile_due = {
            let state = self.state.lock();
            if state.max_active_requests <= 0 {
                return Ok(RequestId::unlimited());
            }
            state
                .last_reconcile
                .map_or(true, |at| at.elapsed() > self.config.reconcile_interval)
        };

        if reconcile_due {
            self.reconcile().await?;
        }

        // The stored limit may have disabled us during reconciliation.
        let limit = self.max_active_requests();
        if limit <= 0 {
            return Ok(RequestId::unlimited());
        }

        let request_id = request_id.unwrap_or_else(RequestId::generate);

        let active = self.store.hlen(&self.active_key).await?;
        if i64::try_from(active).unwrap_or(i64::MAX) >= limit {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                client_id = %self.client_id,
                active = active,
                limit = limit,
                "Rejected request over concurrency limit"
            );
            return Err(LimiterError::QuotaExceeded {
                client_id: self.client_id.clone(),
                limit,
            });
        }

        self.store
            .hset(&self.active_key, request_id.as_str(), &now_timestamp().to_string())
            .await?;
        self.admitted.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            client_id = %self.client_id,
            request_id = %request_id,
            "Admitted request"
        );
        Ok(request_id)
    }

    /// Release a request's lease
    ///
    /// Releasing the unlimited sentinel, an unknown ID, or the same ID twice is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn exit(&self, request_id: &RequestId) -> Result<(), StoreError> {
        if request_id.is_unlimited() {
            return Ok(());
        }
        self.store
            .hdel(&self.active_key, &[request_id.0.clone()])
            .await?;
        tracing::debug!(
            client_id = %self.client_id,
            request_id = %request_id,
            "Released request"
        );
        Ok(())
    }

    /// Refresh TTLs, adopt the shared limit and reclaim stale leases
    ///
    /// Returns the number of leases reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        self.sync(false).await
    }

    /// Number of leases currently held in the store
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn active_count(&self) -> Result<usize, StoreError> {
        self.store.hlen(&self.active_key).await
    }

    /// Admission metrics for this process
    #[must_use]
    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            max_active_requests: self.max_active_requests(),
        }
    }

    async fn sync(&self, use_local_value: bool) -> Result<usize, StoreError> {
        let local = {
            let mut state = self.state.lock();
            if state.max_active_requests <= 0 {
                return Ok(0);
            }
            state.last_reconcile = Some(Instant::now());
            state.max_active_requests
        };

        if use_local_value || !self.store.exists(&self.max_key).await? {
            self.store
                .setex(&self.max_key, self.config.record_ttl, &local.to_string())
                .await?;
        } else {
            if let Some(shared) = self.store.get(&self.max_key).await? {
                match shared.parse::<i64>() {
                    Ok(limit) => self.state.lock().max_active_requests = limit,
                    Err(e) => tracing::warn!(
                        client_id = %self.client_id,
                        value = %shared,
                        error = %e,
                        "Ignoring unparsable shared limit"
                    ),
                }
            }
            self.store
                .expire(&self.max_key, self.config.record_ttl)
                .await?;
        }

        if !self.store.exists(&self.active_key).await? {
            return Ok(0);
        }
        let leases = self.store.hgetall(&self.active_key).await?;
        self.store
            .expire(&self.active_key, self.config.record_ttl)
            .await?;

        let now = now_timestamp();
        let max_alive = self.config.max_alive_time.as_secs_f64();
        let stale: Vec<String> = leases
            .into_iter()
            .filter(|(_, admitted_at)| {
                admitted_at
                    .parse::<f64>()
                    .map_or(true, |at| now - at > max_alive)
            })
            .map(|(request_id, _)| request_id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }
        let reclaimed = self.store.hdel(&self.active_key, &stale).await?;
        tracing::info!(
            client_id = %self.client_id,
            reclaimed = reclaimed,
            "Reclaimed stale leases"
        );
        Ok(reclaimed)
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("client_id", &self.client_id)
            .field("max_active_requests", &self.max_active_requests())
            .finish_non_exhaustive()
    }
}

/// Admission metrics for one limiter in this process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterMetrics {
    /// Requests admitted
    pub admitted: u64,
    /// Requests rejected over the limit
    pub rejected: u64,
    /// Effective limit
    pub max_active_requests: i64,
}

/// Wall-clock seconds since the Unix epoch, as stored in lease entries
#[allow(clippy::cast_precision_loss)]
fn now_timestamp() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_millis() as f64 / 1000.0
}

// =============================================================================
// Limiter Registry
// =============================================================================

/// Process-owned cache of limiters, one per `client_id`
///
/// The cached objects are thin handles; the shared store holds the truth.
pub struct LimiterRegistry {
    store: Arc<dyn SharedStore>,
    config: LimiterConfig,
    limiters: Mutex<HashMap<String, Arc<ConcurrencyLimiter>>>,
}

impl LimiterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: LimiterConfig) -> Self {
        Self {
            store,
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Look up the limiter for `client_id`, creating it on first use
    ///
    /// A limiter that has not been initialized yet (because it was disabled
    /// when created) adopts `max_active_requests` and initializes now.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization cannot reach the store.
    pub async fn get_or_create(
        &self,
        client_id: &str,
        max_active_requests: i64,
    ) -> Result<Arc<ConcurrencyLimiter>, StoreError> {
        let limiter = {
            let mut limiters = self.limiters.lock();
            let limiter = limiters.entry(client_id.to_string()).or_insert_with(|| {
                Arc::new(ConcurrencyLimiter::new(
                    client_id,
                    max_active_requests,
                    Arc::clone(&self.store),
                    self.config.clone(),
                ))
            });
            let mut state = limiter.state.lock();
            if !state.initialized {
                state.max_active_requests = max_active_requests;
            }
            drop(state);
            Arc::clone(limiter)
        };

        limiter.initialize().await?;
        Ok(limiter)
    }

    /// Number of cached limiters
    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    /// Whether no limiter has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("config", &self.config)
            .field("limiters", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
