//! Redis-backed task store.
//!
//! Each task is a hash under `{prefix}{id}` with fields `id`, `prompt`,
//! `metadata` (JSON), `status`, `result`, `error`, `created_at` and
//! `updated_at` (RFC 3339). The hash carries the record TTL via `PEXPIRE`.
//!
//! `create` and `transition` run as Lua scripts so that existence and
//! status checks happen in the same server-side step as the write.
//! Transitions only touch hash fields, so the key's expiry is preserved.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;
use uuid::Uuid;

use super::{check_edge, TaskStore, DEFAULT_TASK_PREFIX, DEFAULT_TASK_TTL};
use crate::error::StoreError;
use crate::task::{Metadata, Task, TaskStatus, TransitionFields};

/// KEYS[1] = record key; ARGV[1] = ttl milliseconds; ARGV[2..] = field/value pairs.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
for i = 2, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

/// KEYS[1] = record key; ARGV[1] = expected status; ARGV[2] = new status;
/// ARGV[3] = updated_at; ARGV[4..] = extra field/value pairs.
///
/// Returns {0, ''} when missing, {2, actual} on mismatch, {1, previous} on success.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    return {0, ''}
end
if current ~= ARGV[1] then
    return {2, current}
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[3])
for i = 4, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return {1, current}
"#;

/// Task store keeping one Redis hash per task.
pub struct RedisTaskStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    ttl: Duration,
    create_script: Script,
    transition_script: Script,
}

impl RedisTaskStore {
    /// Connects to Redis and creates a store with the default prefix and TTL.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing connection manager.
    ///
    /// Useful when the queue and the store share one connection.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            prefix: DEFAULT_TASK_PREFIX.to_string(),
            ttl: DEFAULT_TASK_TTL,
            create_script: Script::new(CREATE_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
        }
    }

    /// Sets the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the TTL applied to new records.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the Redis key for a task.
    pub fn key(&self, id: Uuid) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Returns the remaining TTL of a record, or `None` if it does not exist.
    pub async fn remaining_ttl(&self, id: Uuid) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.redis.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await?;
        // -2: no key; -1: no expiry.
        Ok(match millis {
            -2 => None,
            -1 => Some(Duration::MAX),
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        })
    }
}

/// Expiry in whole milliseconds, saturating for very long TTLs.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(
        &self,
        id: Uuid,
        prompt: &str,
        metadata: Metadata,
    ) -> Result<Task, StoreError> {
        let task = Task::new(id, prompt, metadata);
        let fields = task.to_fields()?;

        let mut invocation = self.create_script.key(self.key(id));
        invocation.arg(ttl_millis(self.ttl).max(1));
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let mut conn = self.redis.clone();
        let created: i64 = invocation.invoke_async(&mut conn).await?;
        if created == 0 {
            return Err(StoreError::AlreadyExists(id));
        }

        debug!(task_id = %id, ttl_ms = ttl_millis(self.ttl), "Created task record");
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.key(id)).await?;

        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        Task::from_fields(id, fields)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<(), StoreError> {
        check_edge(expected, to)?;

        let mut invocation = self.transition_script.key(self.key(id));
        invocation
            .arg(expected.as_str())
            .arg(to.as_str())
            .arg(Utc::now().to_rfc3339());
        for (name, value) in fields.pairs() {
            invocation.arg(name).arg(value);
        }

        let mut conn = self.redis.clone();
        let (code, status): (i64, String) = invocation.invoke_async(&mut conn).await?;

        match code {
            1 => Ok(()),
            0 => Err(StoreError::NotFound(id)),
            _ => {
                let actual = status
                    .parse::<TaskStatus>()
                    .map_err(|reason| StoreError::Corrupt { id, reason })?;
                Err(StoreError::Conflict {
                    id,
                    expected,
                    actual,
                })
            }
        }
    }

    async fn touch_ttl(&self, id: Uuid, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        // PEXPIRE with 0 deletes the key, which is what a zero TTL means.
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(id))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}
