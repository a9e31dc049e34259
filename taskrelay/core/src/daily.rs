//! Daily Request Quota
//!
//! Sliding-window request counter over a sorted set: one member per admitted
//! request, scored by admission time. Applied to quota-bound tenants before
//! the concurrency limiter.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{StoreError, WindowStore};

/// Sliding-window request counter keyed by tenant
pub struct DailyRateLimiter {
    store: Arc<dyn WindowStore>,
    prefix: String,
    max_requests: u64,
    window: Duration,
}

impl DailyRateLimiter {
    /// Default window: one day
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(86_400);

    /// Create a limiter allowing `max_requests` per window
    #[must_use]
    pub fn new(store: Arc<dyn WindowStore>, prefix: impl Into<String>, max_requests: u64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_requests,
            window: Self::DEFAULT_WINDOW,
        }
    }

    /// Set the window length
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Requests allowed per window
    #[must_use]
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Whether `key` has used up its quota
    ///
    /// Trims entries that fell out of the window first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn is_rate_limited(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let cutoff = now_seconds() - self.window.as_secs_f64();
        self.store
            .zremrangebyscore(&key, f64::NEG_INFINITY, cutoff)
            .await?;
        let used = self.store.zcard(&key).await?;
        Ok(used as u64 >= self.max_requests)
    }

    /// Count one request against `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn increment(&self, key: &str) -> Result<(), StoreError> {
        let key = self.key(key);
        let now = now_seconds();
        let member = format!("{now}:{}", uuid::Uuid::new_v4());
        self.store.zadd(&key, now, &member).await?;
        self.store.zexpire(&key, self.window).await?;
        tracing::trace!(key = %key, "Counted request against daily quota");
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

impl std::fmt::Debug for DailyRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyRateLimiter")
            .field("prefix", &self.prefix)
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_limits_after_max_requests() {
        let store = Arc::new(MemoryStore::new());
        let limiter = DailyRateLimiter::new(store, "app_daily_rate_limiter", 3);

        for _ in 0..3 {
            assert!(!limiter.is_rate_limited("tenant-1").await.unwrap());
            limiter.increment("tenant-1").await.unwrap();
        }
        assert!(limiter.is_rate_limited("tenant-1").await.unwrap());
        assert!(!limiter.is_rate_limited("tenant-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_old_entries_fall_out_of_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = DailyRateLimiter::new(store.clone(), "quota", 1);

        let two_days_ago = now_seconds() - 2.0 * 86_400.0;
        store.zadd("quota:t", two_days_ago, "old").await.unwrap();
        assert!(!limiter.is_rate_limited("t").await.unwrap());
        assert_eq!(store.zcard("quota:t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_sets_ttl() {
        let store = Arc::new(MemoryStore::new());
        let limiter = DailyRateLimiter::new(store.clone(), "quota", 10)
            .with_window(Duration::from_secs(60));
        limiter.increment("t").await.unwrap();
        let ttl = store.ttl("quota:t").unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_zero_quota_always_limited() {
        let limiter = DailyRateLimiter::new(Arc::new(MemoryStore::new()), "quota", 0);
        assert!(limiter.is_rate_limited("t").await.unwrap());
    }
}
