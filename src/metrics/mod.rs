//! Metrics module for Prometheus-based monitoring.
//!
//! Counts tasks by terminal status, times generation, and tracks queue
//! redeliveries and dead letters.
//!
//! # Example
//!
//! ```ignore
//! use taskrelay::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("completed", 2.5);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERED_TOTAL, GENERATION_LATENCY, JOBS_IN_PROGRESS, REDELIVERIES_TOTAL,
    REGISTRY, TASKS_TOTAL,
};
