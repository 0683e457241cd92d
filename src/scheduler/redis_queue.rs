//! Redis-based work queue with reliable dequeue.
//!
//! # Queue Structure
//!
//! The queue uses three Redis lists and one sorted set:
//!
//! - `{queue_name}`: main queue where messages are enqueued
//! - `{queue_name}:processing`: messages leased to workers
//! - `{queue_name}:dead_letter`: messages that exhausted their redeliveries
//! - `{queue_name}:leases`: processing entries scored by lease deadline (ms)
//!
//! # Reliability
//!
//! Messages are atomically moved from the main queue to the processing list
//! with BRPOPLPUSH, then given a lease. Ack, reject and reclaim run as Lua
//! scripts that remove the processing entry and its lease in one step, so a
//! delivery can be settled at most once. An entry found in the processing
//! list without a lease (its worker died between the two commands) receives
//! one on the next reclaim pass and expires normally.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::message::{next_delivery, AckHandle, DeadLetter, Delivery, QueueMessage, RejectOutcome};
use super::queue::{QueueConfig, QueueStats, ReclaimReport, WorkQueue};
use crate::error::QueueError;

/// KEYS[1] = processing, KEYS[2] = leases; ARGV[1] = payload.
const ACK_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
return redis.call('LREM', KEYS[1], 1, ARGV[1])
"#;

/// KEYS[1] = processing, KEYS[2] = leases, KEYS[3] = destination list;
/// ARGV[1] = payload, ARGV[2] = successor payload, ARGV[3] = 'right' to
/// push to the consuming end.
///
/// Only moves the entry if it is still in the processing list, so a
/// delivery settled by ack cannot also be reclaimed.
const MOVE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
if ARGV[3] == 'right' then
    redis.call('RPUSH', KEYS[3], ARGV[2])
else
    redis.call('LPUSH', KEYS[3], ARGV[2])
end
return 1
"#;

/// Redis-based work queue with leases and a dead-letter list.
///
/// Blocking pops run on dedicated connections taken from a small cache so
/// they never stall the shared connection used for acks and enqueues.
pub struct RedisWorkQueue {
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Idle connections for BRPOPLPUSH.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    config: QueueConfig,
    /// Name of the processing list.
    processing_queue: String,
    /// Name of the dead letter list.
    dead_letter_queue: String,
    /// Name of the lease sorted set.
    leases_key: String,
    ack_script: Script,
    move_script: Script,
}

impl RedisWorkQueue {
    /// Connects to Redis and creates a new work queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Self::from_client(client, config).await
    }

    /// Creates a queue from an already configured client.
    pub async fn from_client(client: redis::Client, config: QueueConfig) -> Result<Self, QueueError> {
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            processing_queue: format!("{}:processing", config.name),
            dead_letter_queue: format!("{}:dead_letter", config.name),
            leases_key: format!("{}:leases", config.name),
            config,
            ack_script: Script::new(ACK_SCRIPT),
            move_script: Script::new(MOVE_SCRIPT),
        })
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.config.name
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Clears all lists and leases of this queue.
    ///
    /// **Warning**: This permanently deletes all messages. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.config.name)
            .del(&self.processing_queue)
            .del(&self.dead_letter_queue)
            .del(&self.leases_key);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let cached = self.blocking.lock().expect("connection cache lock poisoned").pop();
        match cached {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_tokio_connection().await?),
        }
    }

    fn release_blocking_connection(&self, conn: MultiplexedConnection) {
        self.blocking
            .lock()
            .expect("connection cache lock poisoned")
            .push(conn);
    }

    fn lease_deadline_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.config.visibility_timeout.as_millis() as i64
    }

    /// Settles `payload` by moving its successor to the queue or the
    /// dead-letter list. Returns `None` if the entry was no longer in flight.
    async fn hand_back(
        &self,
        payload: &str,
        reason: &str,
    ) -> Result<Option<RejectOutcome>, QueueError> {
        let message: QueueMessage = serde_json::from_str(payload)?;

        let (destination, successor, side, outcome) =
            match next_delivery(&message, self.config.max_redeliveries) {
                Some(next) => (
                    &self.config.name,
                    serde_json::to_string(&next)?,
                    "right",
                    RejectOutcome::Requeued,
                ),
                None => (
                    &self.dead_letter_queue,
                    serde_json::to_string(&DeadLetter::new(message.clone(), reason))?,
                    "left",
                    RejectOutcome::DeadLettered,
                ),
            };

        let mut conn = self.redis.clone();
        let moved: i64 = self
            .move_script
            .key(&self.processing_queue)
            .key(&self.leases_key)
            .key(destination)
            .arg(payload)
            .arg(successor)
            .arg(side)
            .invoke_async(&mut conn)
            .await?;

        Ok((moved == 1).then_some(outcome))
    }

    /// Leases processing entries that have none. Returns how many were found.
    async fn lease_orphans(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let deadline = self.lease_deadline_ms();
        let mut orphans = 0;
        for entry in entries {
            // NX never shortens a lease the dequeuer already set.
            let added: i64 = redis::cmd("ZADD")
                .arg(&self.leases_key)
                .arg("NX")
                .arg(deadline)
                .arg(&entry)
                .query_async(&mut conn)
                .await?;
            orphans += added as usize;
        }
        Ok(orphans)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    /// Messages are added to the left of the list (LPUSH) so they can be
    /// dequeued from the right in FIFO order.
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&message)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.config.name, serialized).await?;
        Ok(())
    }

    /// If the caller drops this future mid-pop, its connection is dropped
    /// with it; a message popped server-side is recovered by the next
    /// reclaim pass.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut blocking = self.blocking_connection().await?;
        let timeout_secs = wait.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from source and pushes to destination
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.config.name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut blocking)
            .await?;
        self.release_blocking_connection(blocking);

        let mut conn = self.redis.clone();

        let Some(payload) = result else {
            return Ok(None);
        };

        redis::cmd("ZADD")
            .arg(&self.leases_key)
            .arg(self.lease_deadline_ms())
            .arg(&payload)
            .query_async::<_, ()>(&mut conn)
            .await?;

        match serde_json::from_str::<QueueMessage>(&payload) {
            Ok(message) => Ok(Some(Delivery::new(message, payload))),
            Err(e) => {
                // Unreadable entries can never be processed; drop them.
                warn!(queue = %self.config.name, error = %e, "Dropping malformed queue entry");
                self.ack_script
                    .key(&self.processing_queue)
                    .key(&self.leases_key)
                    .arg(&payload)
                    .invoke_async::<_, i64>(&mut conn)
                    .await?;
                Err(QueueError::SerializationFailed(e))
            }
        }
    }

    async fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .ack_script
            .key(&self.processing_queue)
            .key(&self.leases_key)
            .arg(&handle.payload)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(QueueError::UnknownDelivery(handle.delivery_id));
        }
        Ok(())
    }

    async fn reject(
        &self,
        handle: AckHandle,
        requeue: bool,
    ) -> Result<RejectOutcome, QueueError> {
        if !requeue {
            self.ack(handle).await?;
            return Ok(RejectOutcome::Discarded);
        }

        self.hand_back(&handle.payload, "redelivery limit exceeded after reject")
            .await?
            .ok_or(QueueError::UnknownDelivery(handle.delivery_id))
    }

    async fn reclaim_expired(&self) -> Result<ReclaimReport, QueueError> {
        let orphans = self.lease_orphans().await?;
        if orphans > 0 {
            debug!(queue = %self.config.name, orphans, "Leased processing entries without a lease");
        }

        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.leases_key)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;

        let mut report = ReclaimReport::default();
        for payload in expired {
            match self.hand_back(&payload, "lease expired after max redeliveries").await {
                Ok(Some(RejectOutcome::Requeued)) => report.requeued += 1,
                Ok(Some(_)) => report.dead_lettered += 1,
                Ok(None) => {}
                Err(QueueError::SerializationFailed(e)) => {
                    warn!(queue = %self.config.name, error = %e, "Dropping malformed leased entry");
                    self.ack_script
                        .key(&self.processing_queue)
                        .key(&self.leases_key)
                        .arg(&payload)
                        .invoke_async::<_, i64>(&mut conn)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, in_flight, dead_lettered): (usize, usize, usize) = redis::pipe()
            .llen(&self.config.name)
            .llen(&self.processing_queue)
            .llen(&self.dead_letter_queue)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: self.config.name.clone(),
            pending,
            in_flight,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetter>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }
}
