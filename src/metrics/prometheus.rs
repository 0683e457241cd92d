//! Prometheus metrics registration and export.
//!
//! Metrics live in `OnceLock` statics. Until `init_metrics` runs they are
//! unset and every recording call is a no-op.

use prometheus::{CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskrelay metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks that reached a terminal state, labeled by status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent in the generator, in seconds.
pub static GENERATION_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Number of deliveries currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Deliveries handed back to the queue, labeled by outcome
/// (`requeued` or `dead_lettered`).
pub static REDELIVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages moved to the dead-letter list, labeled by source
/// (`reject` or `reclaim`).
pub static DEAD_LETTERED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first set of
/// metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("taskrelay_tasks_total", "Tasks that reached a terminal state"),
        &["status"],
    )?;

    let generation_latency = Histogram::with_opts(
        HistogramOpts::new(
            "taskrelay_generation_latency_seconds",
            "Time spent generating a result in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )?;

    let jobs_in_progress = Gauge::new(
        "taskrelay_jobs_in_progress",
        "Number of deliveries currently being processed",
    )?;

    let active_workers = Gauge::new("taskrelay_active_workers", "Number of running workers")?;

    let redeliveries_total = CounterVec::new(
        Opts::new(
            "taskrelay_redeliveries_total",
            "Deliveries handed back to the queue",
        ),
        &["outcome"],
    )?;

    let dead_lettered_total = CounterVec::new(
        Opts::new(
            "taskrelay_dead_lettered_total",
            "Messages moved to the dead-letter list",
        ),
        &["source"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(redeliveries_total.clone()))?;
    registry.register(Box::new(dead_lettered_total.clone()))?;

    // If any of these fail, a concurrent call won the race (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = REDELIVERIES_TOTAL.set(redeliveries_total);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
