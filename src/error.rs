//! Error types for taskrelay operations.
//!
//! Defines error types for every component of the dispatch pipeline:
//! - Task store records and state transitions
//! - Work queue delivery and acknowledgement
//! - Dispatching new tasks
//! - Text generation and the LLM HTTP client
//! - Client-side polling
//!
//! Business outcomes the worker expects under at-least-once delivery
//! (`StoreError::Conflict`, `GenerationError`) are ordinary variants here;
//! callers decide whether to surface or swallow them.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskStatus;

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} not found or expired")]
    NotFound(Uuid),

    #[error("Task {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Task {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Corrupt record for task {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns whether this error is an expected business outcome rather
    /// than an infrastructure fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::NotFound(_))
    }
}

/// Errors that can occur during work queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a queue message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The delivery is not in flight (already acked, rejected or reclaimed).
    #[error("Delivery {0} is not in flight")]
    UnknownDelivery(Uuid),
}

/// Errors returned by the dispatcher.
///
/// Any of these means the task never entered the pipeline and the caller
/// must retry the submission.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Failed to create task record: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to enqueue task {task_id} after {attempts} attempts: {source}")]
    Enqueue {
        task_id: Uuid,
        attempts: u32,
        /// Whether the orphaned record was moved to FAILED.
        marked_failed: bool,
        #[source]
        source: QueueError,
    },
}

/// Errors that can occur while generating text for a task.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation failed: {0}")]
    Failed(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation returned an empty response")]
    EmptyResponse,

    #[error("LLM provider error: {0}")]
    Provider(#[from] LlmError),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors returned by the poller.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Task {0} is unknown or expired")]
    NotFound(Uuid),

    #[error("Task {id} still {last_status} after {attempts} attempts")]
    Timeout {
        id: Uuid,
        attempts: u32,
        last_status: TaskStatus,
    },

    #[error("Store error while polling: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PollError::NotFound(id),
            other => PollError::Store(other),
        }
    }
}
