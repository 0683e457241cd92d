//! taskrelay: asynchronous text generation over a durable work queue.
//!
//! Producers create task records and enqueue their ids, a pool of workers
//! claims and generates them, and clients poll the store for results.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod llm;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod task;

// Re-export commonly used types
pub use client::{Dispatcher, Poller};
pub use config::{ConfigError, Settings};
pub use error::{DispatchError, GenerationError, LlmError, PollError, QueueError, StoreError};
pub use scheduler::{WorkQueue, WorkerPool, WorkerPoolConfig};
pub use store::TaskStore;
pub use task::{Task, TaskStatus, TaskView};
