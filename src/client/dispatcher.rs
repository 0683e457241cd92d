//! Task submission.
//!
//! The record is always written before the message is enqueued, so a worker
//! never receives an id it cannot look up. An enqueue that keeps failing
//! leaves a PENDING record nobody will process; the dispatcher marks it
//! FAILED so pollers see a terminal state instead of waiting for the TTL.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, QueueError};
use crate::scheduler::{QueueMessage, RetryPolicy, WorkQueue};
use crate::store::TaskStore;
use crate::task::{Metadata, TaskStatus, TransitionFields};

/// Creates task records and hands their ids to the work queue.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    retry: RetryPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher with the default enqueue retry policy.
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            queue,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy used for enqueueing.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Submits a prompt and returns the new task id without waiting for
    /// the result.
    ///
    /// # Errors
    ///
    /// - `DispatchError::EmptyPrompt` for a blank prompt
    /// - `DispatchError::Store` if the record could not be created (nothing
    ///   was enqueued)
    /// - `DispatchError::Enqueue` if every enqueue attempt failed
    pub async fn submit(&self, prompt: &str, metadata: Metadata) -> Result<Uuid, DispatchError> {
        if prompt.trim().is_empty() {
            return Err(DispatchError::EmptyPrompt);
        }

        let task_id = Uuid::new_v4();
        self.store.create(task_id, prompt, metadata).await?;

        let message = QueueMessage::new(task_id);
        let queue = self.queue.as_ref();
        let enqueued = self
            .retry
            .run(
                "enqueue",
                || queue.enqueue(message.clone()),
                |_: &QueueError| true,
            )
            .await;

        match enqueued {
            Ok(()) => {
                info!(task_id = %task_id, "Task submitted");
                Ok(task_id)
            }
            Err((source, attempts)) => {
                let marked_failed = self.mark_dispatch_failed(task_id, &source).await;
                Err(DispatchError::Enqueue {
                    task_id,
                    attempts,
                    marked_failed,
                    source,
                })
            }
        }
    }

    async fn mark_dispatch_failed(&self, task_id: Uuid, cause: &QueueError) -> bool {
        let fields = TransitionFields::error(format!("dispatch failed: {}", cause));
        match self
            .store
            .transition(task_id, TaskStatus::Pending, TaskStatus::Failed, fields)
            .await
        {
            Ok(()) => {
                warn!(task_id = %task_id, error = %cause, "Enqueue failed, task marked failed");
                true
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    error = %e,
                    "Enqueue failed and task could not be marked failed, left to expire"
                );
                false
            }
        }
    }
}
