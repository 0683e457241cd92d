//! Task store: durable key-value records of task state with expiry.
//!
//! - **TaskStore**: the contract every backend implements
//! - **RedisTaskStore**: one Redis hash per task, Lua compare-and-set transitions
//! - **MemoryTaskStore**: in-process map for tests and single-process demos
//!
//! `transition` is the only mutual-exclusion mechanism in the system. Every
//! backend must implement it as one atomic check-and-write, never as a read
//! followed by a separate write.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{Metadata, Task, TaskStatus, TransitionFields};

pub use self::memory::MemoryTaskStore;
pub use self::redis_store::RedisTaskStore;

/// Default time-to-live for task records (one hour).
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(3600);

/// Default key prefix for task records.
pub const DEFAULT_TASK_PREFIX: &str = "task:";

/// Durable record of task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a PENDING record. Fails with `AlreadyExists` if `id` is taken.
    async fn create(&self, id: Uuid, prompt: &str, metadata: Metadata)
        -> Result<Task, StoreError>;

    /// Reads a record. Fails with `NotFound` when absent or expired.
    async fn get(&self, id: Uuid) -> Result<Task, StoreError>;

    /// Atomically moves `id` from `expected` to `to`, writing `fields`.
    ///
    /// Fails with `Conflict` if the current status is not `expected`,
    /// `NotFound` if the record is absent, and `InvalidTransition` if the
    /// edge is not allowed (checked before touching the backend).
    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<(), StoreError>;

    /// Resets the record's expiry. A zero `ttl` expires it immediately.
    async fn touch_ttl(&self, id: Uuid, ttl: Duration) -> Result<(), StoreError>;
}

/// Rejects edges the task lifecycle does not allow.
pub(crate) fn check_edge(from: TaskStatus, to: TaskStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}
