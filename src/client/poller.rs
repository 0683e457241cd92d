//! Waiting for task results.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::{PollError, StoreError};
use crate::store::TaskStore;
use crate::task::{Task, TaskView};

/// Default delay between status reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of status reads before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Reads task state from the store on behalf of a client.
#[derive(Clone)]
pub struct Poller {
    store: Arc<dyn TaskStore>,
}

impl Poller {
    /// Creates a poller reading from `store`.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Returns the current view of a task.
    pub async fn status(&self, id: Uuid) -> Result<TaskView, StoreError> {
        Ok(self.store.get(id).await?.view())
    }

    /// Reads the task up to `max_attempts` times (at least once), sleeping
    /// `interval` between reads, until it is COMPLETED or FAILED.
    ///
    /// A zero interval still yields to the scheduler between reads.
    ///
    /// # Errors
    ///
    /// - `PollError::NotFound` if the task is unknown or expired
    /// - `PollError::Timeout` if it is still PENDING or PROCESSING after the
    ///   last read
    /// - `PollError::Store` on infrastructure failure, without retrying
    pub async fn wait(
        &self,
        id: Uuid,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Task, PollError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let task = self.store.get(id).await?;
            if task.status.is_terminal() {
                debug!(task_id = %id, attempt, status = %task.status, "Task finished");
                return Ok(task);
            }

            if attempt >= max_attempts {
                return Err(PollError::Timeout {
                    id,
                    attempts: attempt,
                    last_status: task.status,
                });
            }

            debug!(task_id = %id, attempt, status = %task.status, "Task not finished yet");
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
            attempt += 1;
        }
    }
}
