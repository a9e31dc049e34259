//! Shared Ownership/Lease Store
//!
//! Every piece of cross-process state in taskrelay (ownership records, stop
//! flags, lease hashes, limiter configuration) lives in a key-value store with
//! TTL support. This module defines the narrow contract the core consumes.
//!
//! # Design Philosophy
//!
//! Only single-key atomic operations are used. There are no transactions and
//! no locks: the admission hot path trades strict consistency for latency.
//!
//! # Available Stores
//!
//! - **MemoryStore**: process-local store with lazy TTL expiry. Used by tests
//!   and single-process deployments.
//! - Anything Redis-compatible can implement [`SharedStore`] by mapping each
//!   method onto the command of the same name.

mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors returned by a shared store
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key holds a value of a different type than the operation expects
    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType {
        /// The offending key
        key: String,
    },

    /// The backing store failed or is unreachable
    #[error("shared store {op} failed: {reason}")]
    Backend {
        /// Command that failed
        op: &'static str,
        /// Backend-provided reason
        reason: String,
    },
}

/// Key-value store with TTL, shared by every process serving tasks
///
/// Method names follow the Redis commands they map onto.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `SETEX key ttl value`
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), StoreError>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// `EXPIRE key ttl`; returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// `HSET hash field value`
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// `HDEL hash field...`; returns the number of fields removed
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, StoreError>;

    /// `HGETALL hash`
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// `HLEN hash`
    async fn hlen(&self, key: &str) -> Result<usize, StoreError>;
}

/// Sorted-set primitives for sliding-window counters
///
/// Kept apart from [`SharedStore`] so the task protocol itself only depends on
/// the primitives listed there.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// `ZADD key score member`
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// `ZREMRANGEBYSCORE key min max`; returns the number of members removed
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize, StoreError>;

    /// `ZCARD key`
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// `EXPIRE key ttl`; returns whether the key existed
    async fn zexpire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}
