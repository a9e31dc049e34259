//! Cancellation Registry
//!
//! Cross-process stop protocol. Ownership of a task and its stop flag are both
//! TTL'd records in the shared store, so a stop request served by one process
//! reaches a task drained by another.
//!
//! # Protocol
//!
//! 1. Admission writes `generate_task_belong:{task_id}` = canonical owner (30 min)
//! 2. A stop request reads the record; if it is missing or names a different
//!    owner, the request is silently ignored
//! 3. Otherwise `generate_task_stopped:{task_id}` is set (10 min)
//! 4. The draining loop and producer-side publishes poll the flag
//!
//! A stop never reports whether the task exists: unknown task, foreign owner
//! and successful stop all look the same to the caller.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{SharedStore, StoreError};
use crate::tasks::{Owner, TaskId};

/// TTLs for the records written by the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Lifetime of the ownership record
    pub owner_ttl: Duration,
    /// Lifetime of the stop flag
    pub stop_flag_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            owner_ttl: Duration::from_secs(1800),
            stop_flag_ttl: Duration::from_secs(600),
        }
    }
}

/// Maps tasks to owners and stop flags in the shared store
#[derive(Clone)]
pub struct CancellationRegistry {
    store: Arc<dyn SharedStore>,
    config: RegistryConfig,
}

impl CancellationRegistry {
    /// Create a registry over a shared store
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Record which principal owns a task
    ///
    /// Must complete before the task publishes anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn register_owner(&self, task_id: &TaskId, owner: &Owner) -> Result<(), StoreError> {
        self.store
            .setex(
                &owner_key(task_id),
                self.config.owner_ttl,
                &owner.canonical(),
            )
            .await?;
        tracing::debug!(task_id = %task_id, owner = %owner, "Registered task owner");
        Ok(())
    }

    /// Ask a task to stop on behalf of `requester`
    ///
    /// Returns whether the stop flag was written. Callers facing untrusted
    /// principals should not surface this value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn request_stop(&self, task_id: &TaskId, requester: &Owner) -> Result<bool, StoreError> {
        let Some(stored) = self.store.get(&owner_key(task_id)).await? else {
            tracing::debug!(task_id = %task_id, "Stop requested for unknown task");
            return Ok(false);
        };

        if stored != requester.canonical() {
            tracing::debug!(task_id = %task_id, "Stop requested by non-owner, ignoring");
            return Ok(false);
        }

        self.store
            .setex(&stopped_key(task_id), self.config.stop_flag_ttl, "1")
            .await?;
        tracing::info!(task_id = %task_id, owner = %requester, "Stop flag set");
        Ok(true)
    }

    /// Whether a stop has been requested for the task
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn is_stopped(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        self.store.exists(&stopped_key(task_id)).await
    }
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn owner_key(task_id: &TaskId) -> String {
    format!("generate_task_belong:{task_id}")
}

fn stopped_key(task_id: &TaskId) -> String {
    format!("generate_task_stopped:{task_id}")
}
