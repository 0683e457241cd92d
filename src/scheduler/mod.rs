//! Work distribution: queue backends and the worker pool.
//!
//! - **WorkQueue**: delivery contract with ack, reject and lease reclaim
//! - **RedisWorkQueue**: Redis lists with BRPOPLPUSH and a lease set
//! - **MemoryWorkQueue**: in-process queue for tests and demos
//! - **WorkerPool**: workers that claim tasks, generate and store results
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Dispatcher  │
//!                      └──────┬───────┘
//!                             │ task id
//!                      ┌──────▼───────┐
//!                      │  WorkQueue   │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                      ┌──────▼───────┐
//!                      │  TaskStore   │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use taskrelay::scheduler::{QueueConfig, RedisWorkQueue, WorkerPool, WorkerPoolConfig};
//! use taskrelay::store::RedisTaskStore;
//! use taskrelay::generation::MockGenerator;
//! use std::sync::Arc;
//!
//! let queue = RedisWorkQueue::connect("redis://localhost:6379", QueueConfig::default()).await?;
//! let store = RedisTaskStore::connect("redis://localhost:6379").await?;
//!
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(4),
//!     Arc::new(store),
//!     Arc::new(queue),
//!     Arc::new(MockGenerator::default()),
//! );
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: messages move to a processing list and get a lease
//! - **Crash recovery**: expired leases are redelivered by the reaper
//! - **Dead letter list**: messages beyond `max_redeliveries` are parked
//! - **Graceful shutdown**: workers finish held deliveries before stopping

pub mod memory;
pub mod message;
pub mod queue;
pub mod redis_queue;
pub mod retry;
pub mod worker_pool;

pub use memory::MemoryWorkQueue;
pub use message::{AckHandle, DeadLetter, Delivery, QueueMessage, RejectOutcome};
pub use queue::{QueueConfig, QueueStats, ReclaimReport, WorkQueue};
pub use redis_queue::RedisWorkQueue;
pub use retry::RetryPolicy;
pub use worker_pool::{
    PoolError, PoolStats, ProcessOutcome, Worker, WorkerPool, WorkerPoolConfig, ABANDONED_ERROR,
};
