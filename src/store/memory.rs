//! In-process task store.
//!
//! Records live in a mutex-guarded map with a per-record deadline. Expired
//! records are dropped lazily on access, which matches what a reader of a
//! key-value store with TTL eviction observes. Nothing here survives a
//! process restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{check_edge, TaskStore, DEFAULT_TASK_TTL};
use crate::error::StoreError;
use crate::task::{Metadata, Task, TaskStatus, TransitionFields};

struct Entry {
    task: Task,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Task store backed by a `HashMap`.
pub struct MemoryTaskStore {
    records: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_TTL)
    }
}

impl MemoryTaskStore {
    /// Creates an empty store whose records expire `ttl` after creation.
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let records = self.records.lock().expect("task store lock poisoned");
        records.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the live entry for `id`, evicting it first if expired.
    fn with_live_entry<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Entry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock().expect("task store lock poisoned");

        if records.get(&id).is_some_and(|e| e.is_expired(now)) {
            records.remove(&id);
        }

        match records.get_mut(&id) {
            Some(entry) => f(entry),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(
        &self,
        id: Uuid,
        prompt: &str,
        metadata: Metadata,
    ) -> Result<Task, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock().expect("task store lock poisoned");

        if records.get(&id).is_some_and(|e| !e.is_expired(now)) {
            return Err(StoreError::AlreadyExists(id));
        }

        let task = Task::new(id, prompt, metadata);
        records.insert(
            id,
            Entry {
                task: task.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        self.with_live_entry(id, |entry| Ok(entry.task.clone()))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<(), StoreError> {
        check_edge(expected, to)?;

        // Check and write happen under one lock acquisition.
        self.with_live_entry(id, |entry| {
            let actual = entry.task.status;
            if actual != expected {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual,
                });
            }
            entry.task.apply(to, fields, Utc::now());
            Ok(())
        })
    }

    async fn touch_ttl(&self, id: Uuid, ttl: Duration) -> Result<(), StoreError> {
        self.with_live_entry(id, |entry| {
            entry.expires_at = Instant::now() + ttl;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryTaskStore::default();
        let id = Uuid::new_v4();

        let created = store
            .create(id, "Explain quantum computing", Metadata::new())
            .await
            .expect("create");
        let fetched = store.get(id).await.expect("get");

        assert_eq!(created, fetched);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = MemoryTaskStore::default();
        let id = Uuid::new_v4();

        store.create(id, "a", Metadata::new()).await.expect("create");
        let err = store
            .create(id, "b", Metadata::new())
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::AlreadyExists(dup) if dup == id));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryTaskStore::default();
        let err = store.get(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_happy_path() {
        let store = MemoryTaskStore::default();
        let id = Uuid::new_v4();
        store.create(id, "ping", Metadata::new()).await.expect("create");

        store
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .expect("claim");
        store
            .transition(
                id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::result("pong"),
            )
            .await
            .expect("complete");

        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("pong"));
        assert!(task.updated_at >= task.created_at);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = MemoryTaskStore::default();
        let id = Uuid::new_v4();
        store.create(id, "ping", Metadata::new()).await.expect("create");
        store
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .expect("claim");
        store
            .transition(
                id,
                TaskStatus::Processing,
                TaskStatus::Failed,
                TransitionFields::error("boom"),
            )
            .await
            .expect("fail");

        let err = store
            .transition(
                id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::result("late"),
            )
            .await
            .expect_err("second terminal state");
        assert!(matches!(
            err,
            StoreError::Conflict {
                actual: TaskStatus::Failed,
                ..
            }
        ));

        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_invalid_edge_rejected_before_lookup() {
        let store = MemoryTaskStore::default();
        let err = store
            .transition(
                Uuid::new_v4(),
                TaskStatus::Completed,
                TaskStatus::Pending,
                TransitionFields::none(),
            )
            .await
            .expect_err("invalid edge");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_missing_is_not_found() {
        let store = MemoryTaskStore::default();
        let err = store
            .transition(
                Uuid::new_v4(),
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_single_winner() {
        let store = Arc::new(MemoryTaskStore::default());
        let id = Uuid::new_v4();
        store.create(id, "race", Metadata::new()).await.expect("create");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(
                        id,
                        TaskStatus::Pending,
                        TaskStatus::Processing,
                        TransitionFields::none(),
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_not_found() {
        let store = MemoryTaskStore::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        store.create(id, "short-lived", Metadata::new()).await.expect("create");

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
        // The id is free again once the old record expired.
        store.create(id, "again", Metadata::new()).await.expect("recreate");
    }

    #[tokio::test]
    async fn test_touch_ttl_zero_expires_completed_task() {
        let store = MemoryTaskStore::default();
        let id = Uuid::new_v4();
        store.create(id, "ping", Metadata::new()).await.expect("create");

        store.touch_ttl(id, Duration::ZERO).await.expect("touch");

        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.touch_ttl(id, Duration::from_secs(10)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_ttl_extends_life() {
        let store = MemoryTaskStore::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        store.create(id, "keep", Metadata::new()).await.expect("create");

        store.touch_ttl(id, Duration::from_secs(60)).await.expect("touch");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get(id).await.is_ok());
    }
}
