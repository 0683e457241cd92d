//! Work queue contract.
//!
//! A work queue delivers task ids to workers with explicit acknowledgement:
//!
//! - `enqueue` appends a message (redelivery counter 0)
//! - `dequeue` suspends until a message is available and leases it
//! - `ack` removes a delivery permanently
//! - `reject` discards it or redelivers it with the counter incremented
//! - `reclaim_expired` redelivers deliveries whose lease elapsed without ack
//!
//! Messages whose counter would exceed `max_redeliveries` go to the
//! dead-letter destination instead of back onto the queue.

use std::time::Duration;

use async_trait::async_trait;

use super::message::{
    AckHandle, DeadLetter, Delivery, QueueMessage, RejectOutcome, DEFAULT_MAX_REDELIVERIES,
};
use crate::error::QueueError;

/// Default queue name.
pub const DEFAULT_QUEUE_NAME: &str = "text_generation_tasks";

/// Default lease on a dequeued message before it is considered abandoned.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Queue behaviour shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name of the queue (used as prefix for backend keys).
    pub name: String,
    /// How long a dequeued message stays leased without ack.
    pub visibility_timeout: Duration,
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration for the named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the redelivery limit.
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }
}

/// Ordered delivery channel with acknowledgement and redelivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a message. Returns once the backend has accepted it.
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Waits up to `wait` for a message and leases it to the caller.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Waiting suspends the
    /// calling task; it never spins.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Permanently removes an in-flight delivery.
    async fn ack(&self, handle: AckHandle) -> Result<(), QueueError>;

    /// Discards (`requeue = false`) or redelivers (`requeue = true`) an
    /// in-flight delivery.
    async fn reject(&self, handle: AckHandle, requeue: bool)
        -> Result<RejectOutcome, QueueError>;

    /// Redelivers every in-flight delivery whose lease has elapsed.
    async fn reclaim_expired(&self) -> Result<ReclaimReport, QueueError>;

    /// Returns counts for the queue's destinations.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Peeks at up to `limit` dead-letter entries without removing them.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// How long a delivery stays leased before `reclaim_expired` takes it back.
    fn visibility_timeout(&self) -> Duration;
}

/// Result of a reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Deliveries put back on the queue.
    pub requeued: usize,
    /// Deliveries moved to the dead-letter destination.
    pub dead_lettered: usize,
}

impl ReclaimReport {
    /// Total deliveries reclaimed.
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Messages waiting to be delivered.
    pub pending: usize,
    /// Messages delivered but not yet acknowledged.
    pub in_flight: usize,
    /// Messages in the dead-letter destination.
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Returns the total number of messages across all destinations.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.dead_lettered
    }
}
