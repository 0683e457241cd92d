//! Queue message definitions.
//!
//! This module defines the types that travel through the work queue:
//!
//! - `QueueMessage`: one delivery of a task id to a worker
//! - `AckHandle`: proof of an in-flight delivery, consumed by ack/reject
//! - `Delivery`: a dequeued message together with its handle
//! - `DeadLetter`: a message that exhausted its redeliveries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of redeliveries before dead-lettering.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

/// A message carrying a task id from the dispatcher to a worker.
///
/// The message only references the task; the prompt and status live in
/// the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Identifier of this delivery. Fresh on every (re)delivery so each
    /// in-flight entry is uniquely addressable.
    pub delivery_id: Uuid,
    /// The task this message refers to.
    pub task_id: Uuid,
    /// How many times this task id has been redelivered.
    pub redelivery_count: u32,
    /// When this delivery was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Creates a first delivery for a task.
    pub fn new(task_id: Uuid) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            task_id,
            redelivery_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the message that replaces this one on redelivery.
    pub fn redelivered(&self) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            task_id: self.task_id,
            redelivery_count: self.redelivery_count + 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns whether this message has already been delivered before.
    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }

    /// Returns how long ago this delivery was enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Handle for an in-flight delivery.
///
/// Must be passed to exactly one of `ack` or `reject`. The payload is the
/// serialized message as stored by the backend, which lets the Redis queue
/// remove the exact entry from its processing list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub delivery_id: Uuid,
    pub payload: String,
}

/// A message taken from the queue, leased to the caller until acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub handle: AckHandle,
}

impl Delivery {
    /// Wraps a message and its serialized form.
    pub fn new(message: QueueMessage, payload: String) -> Self {
        let handle = AckHandle {
            delivery_id: message.delivery_id,
            payload,
        };
        Self { message, handle }
    }

    /// Shortcut for the task id carried by this delivery.
    pub fn task_id(&self) -> Uuid {
        self.message.task_id
    }
}

/// A message moved to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead-letter entry stamped with the current time.
    pub fn new(message: QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// What happened to a rejected delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Removed without redelivery.
    Discarded,
    /// Put back on the queue with an incremented redelivery counter.
    Requeued,
    /// Redelivery limit exceeded; moved to the dead-letter destination.
    DeadLettered,
}

impl std::fmt::Display for RejectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectOutcome::Discarded => write!(f, "discarded"),
            RejectOutcome::Requeued => write!(f, "requeued"),
            RejectOutcome::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Decides where a message goes when it is handed back to the queue.
///
/// Returns the successor message when it should be redelivered, or `None`
/// when its redelivery counter would exceed `max_redeliveries`.
pub fn next_delivery(message: &QueueMessage, max_redeliveries: u32) -> Option<QueueMessage> {
    let next = message.redelivered();
    if next.redelivery_count > max_redeliveries {
        None
    } else {
        Some(next)
    }
}
