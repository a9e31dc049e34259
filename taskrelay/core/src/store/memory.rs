//! In-process shared store
//!
//! Mirrors the Redis semantics the core relies on, so tests exercise the same
//! code paths a networked store would. TTLs are tracked on the tokio clock and
//! expired lazily on access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{SharedStore, StoreError, WindowStore};

/// Stored value kinds
#[derive(Clone, Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(Vec<(f64, String)>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`SharedStore`] and [`WindowStore`] implementation
///
/// Every trait call increments an operation counter so tests can assert that
/// a code path never reached the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    operations: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of store operations served so far
    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    /// Whether the store holds no live keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it exists and has one
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn record(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    /// Drop the key if its TTL has passed
    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }

    fn set_expiry(&self, key: &str, ttl: Duration) -> bool {
        self.evict_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.record();
        self.evict_if_expired(key);
        match self.entries.get(key).map(|e| e.value.clone()) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), StoreError> {
        self.record();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.record();
        self.evict_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.record();
        Ok(self.set_expiry(key, ttl))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.record();
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, StoreError> {
        self.record();
        self.evict_if_expired(key);
        let (removed, now_empty) = match self.entries.get_mut(key) {
            None => return Ok(0),
            Some(mut entry) => match &mut entry.value {
                Value::Hash(map) => {
                    let removed = fields.iter().filter(|f| map.remove(*f).is_some()).count();
                    (removed, map.is_empty())
                }
                _ => return Err(wrong_type(key)),
            },
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.record();
        self.evict_if_expired(key);
        match self.entries.get(key).map(|e| e.value.clone()) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        self.record();
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.len()),
                _ => Err(wrong_type(key)),
            },
        }
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.record();
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(Vec::new())));
        match &mut entry.value {
            Value::ZSet(members) => {
                members.retain(|(_, m)| m != member);
                members.push((score, member.to_string()));
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize, StoreError> {
        self.record();
        self.evict_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(0),
            Some(mut entry) => match &mut entry.value {
                Value::ZSet(members) => {
                    let before = members.len();
                    members.retain(|(score, _)| *score < min || *score > max);
                    Ok(before - members.len())
                }
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.record();
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::ZSet(members) => Ok(members.len()),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn zexpire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.record();
        Ok(self.set_expiry(key, ttl))
    }
}
