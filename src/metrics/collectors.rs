//! High-level recording interface over the Prometheus statics.
//!
//! `MetricsCollector` methods never fail: when metrics have not been
//! initialized they only emit a trace event.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERED_TOTAL, GENERATION_LATENCY, JOBS_IN_PROGRESS, REDELIVERIES_TOTAL,
    TASKS_TOTAL,
};

/// Metrics collector for recording task relay operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a task reaching a terminal state after `duration_secs` of
    /// generation.
    pub fn record_task(&self, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status]).inc();
        }

        if let Some(latency) = GENERATION_LATENCY.get() {
            latency.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Convenience wrapper taking a `Duration`.
    pub fn record_generation(&self, status: &str, duration: Duration) {
        self.record_task(status, duration.as_secs_f64());
    }

    /// Record a delivery handed back to the queue (`requeued` or
    /// `dead_lettered`).
    pub fn record_redelivery(&self, outcome: &str) {
        if let Some(counter) = REDELIVERIES_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    /// Record messages moved to the dead-letter list.
    pub fn record_dead_letters(&self, source: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(counter) = DEAD_LETTERED_TOTAL.get() {
            counter.with_label_values(&[source]).inc_by(count as f64);
        }
    }

    /// Increment the in-progress gauge.
    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Decrement the in-progress gauge.
    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Set the number of running workers.
    pub fn set_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }
}
