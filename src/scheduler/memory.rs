//! In-process work queue.
//!
//! Mirrors the Redis queue's semantics (FIFO delivery, leases, bounded
//! redelivery, dead-letter list) inside one process. Waiting consumers are
//! parked on a [`Notify`] and woken by `enqueue`. Messages are lost when
//! the process exits.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::message::{next_delivery, AckHandle, DeadLetter, Delivery, QueueMessage, RejectOutcome};
use super::queue::{QueueConfig, QueueStats, ReclaimReport, WorkQueue};
use crate::error::QueueError;

struct Lease {
    message: QueueMessage,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<Uuid, Lease>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    /// Moves a leased message to its next destination.
    fn hand_back(&mut self, message: QueueMessage, max: u32, reason: &str) -> RejectOutcome {
        match next_delivery(&message, max) {
            Some(next) => {
                // Redeliveries go to the front so they are retried next.
                self.ready.push_front(next);
                RejectOutcome::Requeued
            }
            None => {
                self.dead.push(DeadLetter::new(message, reason));
                RejectOutcome::DeadLettered
            }
        }
    }
}

/// Work queue held in process memory.
pub struct MemoryWorkQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryWorkQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let message = state.ready.pop_front()?;
        state.in_flight.insert(
            message.delivery_id,
            Lease {
                message: message.clone(),
                deadline: Instant::now() + self.config.visibility_timeout,
            },
        );
        // The memory backend has no serialized form to match on.
        Some(Delivery::new(message, String::new()))
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .ready
            .push_back(message);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so an enqueue between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state
            .in_flight
            .remove(&handle.delivery_id)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(handle.delivery_id))
    }

    async fn reject(
        &self,
        handle: AckHandle,
        requeue: bool,
    ) -> Result<RejectOutcome, QueueError> {
        let outcome = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let lease = state
                .in_flight
                .remove(&handle.delivery_id)
                .ok_or(QueueError::UnknownDelivery(handle.delivery_id))?;

            if !requeue {
                return Ok(RejectOutcome::Discarded);
            }
            state.hand_back(
                lease.message,
                self.config.max_redeliveries,
                "redelivery limit exceeded after reject",
            )
        };

        if outcome == RejectOutcome::Requeued {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<ReclaimReport, QueueError> {
        let now = Instant::now();
        let mut report = ReclaimReport::default();

        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let expired: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                if let Some(lease) = state.in_flight.remove(&id) {
                    match state.hand_back(
                        lease.message,
                        self.config.max_redeliveries,
                        "lease expired after max redeliveries",
                    ) {
                        RejectOutcome::Requeued => report.requeued += 1,
                        _ => report.dead_lettered += 1,
                    }
                }
            }
        }

        for _ in 0..report.requeued {
            self.notify.notify_one();
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().expect("queue lock poisoned");
        Ok(QueueStats {
            queue_name: self.config.name.clone(),
            pending: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().expect("queue lock poisoned");
        // Newest first, matching the Redis list order.
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }
}
