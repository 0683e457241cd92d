//! Worker pool for processing deliveries from the work queue.
//!
//! Each worker runs as an independent async task, takes deliveries from the
//! shared queue and drives them through the task store's state machine:
//!
//! 1. look up the task record (a missing record means a stale message)
//! 2. claim it with `PENDING -> PROCESSING` (losing the claim means someone
//!    else owns the task)
//! 3. generate under a timeout
//! 4. write the terminal state, then acknowledge the delivery
//!
//! When the claim or the terminal write fails on infrastructure, the store
//! may or may not hold PROCESSING. The delivery is then left leased: by the
//! time lease expiry redelivers it, a PROCESSING record is stale and gets
//! failed as abandoned, and a PENDING one is claimed normally. This needs a
//! queue visibility timeout longer than `stale_after`, which `start` checks.
//!
//! # Features
//!
//! - Configurable number of workers and per-worker prefetch
//! - Graceful shutdown with broadcast channel
//! - Reaper task that redelivers deliveries whose lease expired
//! - Pool statistics tracking

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::OptionFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::message::{AckHandle, Delivery, RejectOutcome};
use super::queue::WorkQueue;
use super::retry::RetryPolicy;
use crate::error::{GenerationError, QueueError, StoreError};
use crate::generation::Generator;
use crate::metrics::MetricsCollector;
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus, TransitionFields};

/// Error recorded on a task whose previous worker stopped responding.
pub const ABANDONED_ERROR: &str = "abandoned by worker";

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The configuration cannot run.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// A dequeue that survives across turns of the worker loop.
type PendingDequeue<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Delivery>, QueueError>> + Send + 'a>>;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Deliveries a single worker may hold at once.
    pub prefetch: usize,
    /// How long one dequeue call waits for a message.
    pub poll_interval: Duration,
    /// Maximum time allowed for generating a single result.
    pub generation_timeout: Duration,
    /// Age after which a PROCESSING record met on redelivery is considered
    /// abandoned. Defaults to twice the generation timeout.
    pub stale_after: Duration,
    /// How often the reaper reclaims expired leases.
    pub reclaim_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Retry policy for terminal state writes.
    pub write_retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let generation_timeout = Duration::from_secs(120);
        Self {
            num_workers: 1,
            prefetch: 1,
            poll_interval: Duration::from_secs(1),
            generation_timeout,
            stale_after: generation_timeout * 2,
            reclaim_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            write_retry: RetryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-worker prefetch.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the generation timeout and derives `stale_after` from it.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self.stale_after = timeout * 2;
        self
    }

    /// Overrides the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the retry policy for terminal writes.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// Checks that the pool can make progress with this configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig("num_workers must be at least 1".into()));
        }
        if self.prefetch == 0 {
            return Err(PoolError::InvalidConfig("prefetch must be at least 1".into()));
        }
        if self.generation_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "generation_timeout must be positive".into(),
            ));
        }
        if self.reclaim_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "reclaim_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of deliveries currently being generated.
    pub active_jobs: usize,
    /// Tasks moved to COMPLETED by this pool.
    pub tasks_completed: u64,
    /// Tasks moved to FAILED by this pool (including abandoned ones).
    pub tasks_failed: u64,
    /// Deliveries acknowledged without processing (stale or duplicate).
    pub deliveries_skipped: u64,
    /// Deliveries handed back to the queue after an infrastructure error.
    pub deliveries_handed_back: u64,
    /// Deliveries left leased because the store state was uncertain.
    pub deliveries_left_leased: u64,
    /// Average generation duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    deliveries_skipped: AtomicU64,
    deliveries_handed_back: AtomicU64,
    deliveries_left_leased: AtomicU64,
    timed_jobs: AtomicU64,
    total_duration_ms: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.record_duration(duration);
    }

    fn record_failure(&self, duration: Option<Duration>) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        if let Some(duration) = duration {
            self.record_duration(duration);
        }
    }

    fn record_duration(&self, duration: Duration) {
        self.timed_jobs.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_skip(&self) {
        self.deliveries_skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn record_hand_back(&self) {
        self.deliveries_handed_back.fetch_add(1, Ordering::SeqCst);
    }

    fn record_left_leased(&self) {
        self.deliveries_left_leased.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let timed = self.timed_jobs.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if timed > 0 {
            Duration::from_millis(total_duration_ms / timed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_jobs: self.active_jobs.load(Ordering::SeqCst) as usize,
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            deliveries_skipped: self.deliveries_skipped.load(Ordering::SeqCst),
            deliveries_handed_back: self.deliveries_handed_back.load(Ordering::SeqCst),
            deliveries_left_leased: self.deliveries_left_leased.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    generator: Arc<dyn Generator>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool over explicit store, queue and generator
    /// handles.
    pub fn new(
        config: WorkerPoolConfig,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            queue,
            generator,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the lease reaper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::InvalidConfig` if the configuration cannot run or the
    /// queue lease does not outlast `stale_after`.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        let visibility_timeout = self.queue.visibility_timeout();
        if visibility_timeout <= self.config.stale_after {
            return Err(PoolError::InvalidConfig(format!(
                "queue visibility timeout {:?} must exceed stale_after {:?}",
                visibility_timeout, self.config.stale_after
            )));
        }

        // Redeliver anything left leased by a previous run
        reclaim_once(self.queue.as_ref()).await;

        for i in 0..self.config.num_workers {
            let worker = Worker::with_stats(
                format!("worker-{}", i),
                Arc::clone(&self.store),
                Arc::clone(&self.queue),
                Arc::clone(&self.generator),
                self.config.clone(),
                Arc::clone(&self.stats),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            });

            self.worker_handles.push(handle);
        }

        let reaper = spawn_reaper(
            Arc::clone(&self.queue),
            self.config.reclaim_interval,
            self.shutdown_tx.subscribe(),
        );
        self.worker_handles.push(reaper);

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::new().set_active_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            prefetch = self.config.prefetch,
            generator = self.generator.name(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop taking deliveries and finish the ones they hold.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;

        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().set_active_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                // Deliveries still held come back once their lease expires
                for handle in self.worker_handles.drain(..) {
                    handle.abort();
                }
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Scales the pool to a new number of workers.
    ///
    /// Restarts the pool with the new count when it is running.
    pub async fn scale(&mut self, num_workers: usize) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            self.config.num_workers = num_workers;
            return Ok(());
        }

        if num_workers == self.config.num_workers {
            return Ok(());
        }

        info!(
            current = self.config.num_workers,
            target = num_workers,
            "Scaling worker pool"
        );

        self.shutdown().await?;
        self.config.num_workers = num_workers;
        self.start().await?;

        Ok(())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Returns a reference to the work queue.
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }
}

/// Runs one reclaim pass, logging instead of failing.
async fn reclaim_once(queue: &dyn WorkQueue) {
    match queue.reclaim_expired().await {
        Ok(report) if report.total() > 0 => {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "Reclaimed expired deliveries"
            );
            let metrics = MetricsCollector::new();
            for _ in 0..report.requeued {
                metrics.record_redelivery("requeued");
            }
            metrics.record_dead_letters("reclaim", report.dead_lettered);
        }
        Ok(_) => debug!("No expired deliveries"),
        Err(e) => warn!(error = %e, "Failed to reclaim expired deliveries"),
    }
}

fn spawn_reaper(
    queue: Arc<dyn WorkQueue>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; start() already reclaimed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => reclaim_once(queue.as_ref()).await,
            }
        }
        debug!("Reaper stopped");
    })
}

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Generated and stored a result.
    Completed,
    /// Generation failed or timed out; the error was stored.
    Failed,
    /// The task record no longer exists; the message was dropped.
    Stale,
    /// Another delivery already owns the task; the message was dropped.
    Duplicate,
    /// The task was held by a worker presumed dead and has been failed.
    Abandoned,
    /// An infrastructure error occurred and the delivery was handed back.
    /// `None` when the hand-back itself failed and lease expiry will
    /// redeliver it instead.
    HandedBack(Option<RejectOutcome>),
    /// The claim or terminal write may not have landed. The delivery was
    /// not settled; lease expiry redelivers it once the record is stale.
    LeftLeased,
}

/// A single worker that processes deliveries from the queue.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    generator: Arc<dyn Generator>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Creates a standalone worker. Only the worker-level settings of
    /// `config` (prefetch, timeouts, retry) are used.
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        generator: Arc<dyn Generator>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self::with_stats(
            id.into(),
            store,
            queue,
            generator,
            config,
            Arc::new(SharedPoolStats::default()),
        )
    }

    fn with_stats(
        id: String,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        generator: Arc<dyn Generator>,
        config: WorkerPoolConfig,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            store,
            queue,
            generator,
            config,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop.
    ///
    /// Keeps up to `prefetch` deliveries in flight until a shutdown signal
    /// is received, then finishes the deliveries it holds.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let prefetch = self.config.prefetch.max(1);
        info!(worker_id = %self.id, prefetch, "Worker started");

        let mut in_flight = FuturesUnordered::new();
        // Kept across turns: dropping a blocking pop midway can strand a
        // message the backend already moved
        let mut dequeue: Option<PendingDequeue<'_>> = None;
        let mut pause_until: Option<tokio::time::Instant> = None;

        loop {
            if dequeue.is_none() && in_flight.len() < prefetch {
                dequeue = Some(Box::pin(self.next_delivery(pause_until.take())));
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }

                Some(_) = in_flight.next(), if !in_flight.is_empty() => {}

                Some(result) = OptionFuture::from(dequeue.as_mut()), if dequeue.is_some() => {
                    dequeue = None;
                    match result {
                        Ok(Some(delivery)) => in_flight.push(self.process(delivery)),
                        Ok(None) => {
                            debug!(worker_id = %self.id, "No deliveries available");
                        }
                        Err(e) => {
                            error!(worker_id = %self.id, error = %e, "Failed to dequeue");
                            pause_until =
                                Some(tokio::time::Instant::now() + self.config.poll_interval);
                        }
                    }
                }
            }
        }

        // A pop already under way finishes within one poll interval
        if let Some(pending) = dequeue.take() {
            match pending.await {
                Ok(Some(delivery)) => in_flight.push(self.process(delivery)),
                Ok(None) => {}
                Err(e) => debug!(worker_id = %self.id, error = %e, "Final dequeue failed"),
            }
        }

        if !in_flight.is_empty() {
            info!(
                worker_id = %self.id,
                in_flight = in_flight.len(),
                "Finishing held deliveries"
            );
            while in_flight.next().await.is_some() {}
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn next_delivery(
        &self,
        pause_until: Option<tokio::time::Instant>,
    ) -> Result<Option<Delivery>, QueueError> {
        if let Some(deadline) = pause_until {
            tokio::time::sleep_until(deadline).await;
        }
        self.queue.dequeue(self.config.poll_interval).await
    }

    /// Processes a single delivery and settles it with the queue.
    pub async fn process(&self, delivery: Delivery) -> ProcessOutcome {
        let Delivery { message, handle } = delivery;
        let task_id = message.task_id;

        debug!(
            worker_id = %self.id,
            task_id = %task_id,
            delivery_id = %message.delivery_id,
            redelivery = message.redelivery_count,
            "Processing delivery"
        );

        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    "Task record missing, dropping stale message"
                );
                self.stats.record_skip();
                self.settle(handle, task_id).await;
                return ProcessOutcome::Stale;
            }
            Err(e) => {
                warn!(worker_id = %self.id, task_id = %task_id, error = %e, "Failed to load task");
                return self.hand_back(handle, task_id).await;
            }
        };

        let claim = self
            .store
            .transition(
                task_id,
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await;

        match claim {
            Ok(()) => {}
            Err(StoreError::Conflict { actual, .. }) => {
                let outcome = self.resolve_lost_claim(task_id, actual).await;
                if outcome == ProcessOutcome::Abandoned {
                    self.stats.record_failure(None);
                    self.metrics.record_task(TaskStatus::Failed.as_str(), 0.0);
                } else {
                    self.stats.record_skip();
                }
                self.settle(handle, task_id).await;
                return outcome;
            }
            Err(StoreError::NotFound(_)) => {
                info!(worker_id = %self.id, task_id = %task_id, "Task expired before claim");
                self.stats.record_skip();
                self.settle(handle, task_id).await;
                return ProcessOutcome::Stale;
            }
            Err(e) => {
                warn!(worker_id = %self.id, task_id = %task_id, error = %e, "Failed to claim task");
                return self.leave_leased(handle, task_id);
            }
        }

        info!(worker_id = %self.id, task_id = %task_id, "Claimed task");

        let (generated, duration) = self.generate(&task).await;

        let (to, fields) = match generated {
            Ok(text) => (TaskStatus::Completed, TransitionFields::result(text)),
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %e,
                    "Generation failed"
                );
                (TaskStatus::Failed, TransitionFields::error(e.to_string()))
            }
        };

        if !self.write_terminal(task_id, to, fields).await {
            return self.leave_leased(handle, task_id);
        }

        self.metrics.record_generation(to.as_str(), duration);
        let outcome = if to == TaskStatus::Completed {
            self.stats.record_completion(duration);
            info!(
                worker_id = %self.id,
                task_id = %task_id,
                duration_ms = duration.as_millis() as u64,
                "Task completed"
            );
            ProcessOutcome::Completed
        } else {
            self.stats.record_failure(Some(duration));
            ProcessOutcome::Failed
        };

        self.settle(handle, task_id).await;
        outcome
    }

    /// Runs the generator under the generation timeout.
    async fn generate(&self, task: &Task) -> (Result<String, GenerationError>, Duration) {
        self.stats.increment_active();
        self.metrics.job_started();
        let start_time = Instant::now();

        let result = match tokio::time::timeout(
            self.config.generation_timeout,
            self.generator.generate(&task.prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.config.generation_timeout)),
        };

        let duration = start_time.elapsed();
        self.metrics.job_finished();
        self.stats.decrement_active();
        (result, duration)
    }

    /// Decides what a lost claim means.
    ///
    /// Normally another delivery owns the task. If the record has sat in
    /// PROCESSING longer than `stale_after`, its owner is presumed dead and
    /// the task is failed so it cannot stay PROCESSING forever.
    async fn resolve_lost_claim(&self, task_id: Uuid, actual: TaskStatus) -> ProcessOutcome {
        if actual != TaskStatus::Processing {
            debug!(
                worker_id = %self.id,
                task_id = %task_id,
                status = %actual,
                "Task already claimed, dropping duplicate delivery"
            );
            return ProcessOutcome::Duplicate;
        }

        // Re-read: the copy loaded before the claim may predate it
        let current = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                debug!(worker_id = %self.id, task_id = %task_id, error = %e, "Could not re-read claimed task");
                return ProcessOutcome::Duplicate;
            }
        };

        if current.status != TaskStatus::Processing || !self.is_stale(&current) {
            debug!(
                worker_id = %self.id,
                task_id = %task_id,
                "Task is being processed elsewhere, dropping duplicate delivery"
            );
            return ProcessOutcome::Duplicate;
        }

        match self
            .store
            .transition(
                task_id,
                TaskStatus::Processing,
                TaskStatus::Failed,
                TransitionFields::error(ABANDONED_ERROR),
            )
            .await
        {
            Ok(()) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    since = %current.updated_at,
                    "Task abandoned by its worker, marked failed"
                );
                ProcessOutcome::Abandoned
            }
            Err(e) => {
                debug!(worker_id = %self.id, task_id = %task_id, error = %e, "Task settled concurrently");
                ProcessOutcome::Duplicate
            }
        }
    }

    fn is_stale(&self, task: &Task) -> bool {
        (Utc::now() - task.updated_at)
            .to_std()
            .map(|age| age > self.config.stale_after)
            .unwrap_or(false)
    }

    /// Writes the terminal state. Returns false only when the write could
    /// not be made and the delivery must be left to lease expiry.
    async fn write_terminal(&self, task_id: Uuid, to: TaskStatus, fields: TransitionFields) -> bool {
        let store = self.store.as_ref();
        let result = self
            .config
            .write_retry
            .run(
                "terminal transition",
                move || store.transition(task_id, TaskStatus::Processing, to, fields.clone()),
                |e: &StoreError| !e.is_benign(),
            )
            .await;

        match result {
            Ok(()) => true,
            Err((StoreError::Conflict { actual, .. }, attempts)) if attempts > 1 && actual == to => {
                debug!(worker_id = %self.id, task_id = %task_id, "Earlier write attempt already landed");
                true
            }
            Err((StoreError::Conflict { actual, .. }, _)) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    status = %actual,
                    "Task left PROCESSING while generating, result discarded"
                );
                true
            }
            Err((StoreError::NotFound(_), _)) => {
                warn!(worker_id = %self.id, task_id = %task_id, "Task expired while generating, result discarded");
                true
            }
            Err((e, attempts)) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    attempts,
                    error = %e,
                    "Failed to store terminal state"
                );
                false
            }
        }
    }

    /// Acknowledges a settled delivery.
    async fn settle(&self, handle: AckHandle, task_id: Uuid) {
        let delivery_id = handle.delivery_id;
        if let Err(e) = self.queue.ack(handle).await {
            // An unknown delivery was already reclaimed; its redelivery
            // resolves through the claim guard.
            warn!(
                worker_id = %self.id,
                task_id = %task_id,
                delivery_id = %delivery_id,
                error = %e,
                "Failed to acknowledge delivery"
            );
        }
    }

    /// Drops a delivery without settling it, so it returns only after its
    /// lease expires.
    fn leave_leased(&self, handle: AckHandle, task_id: Uuid) -> ProcessOutcome {
        self.stats.record_left_leased();
        warn!(
            worker_id = %self.id,
            task_id = %task_id,
            delivery_id = %handle.delivery_id,
            "Store state uncertain, leaving delivery to lease expiry"
        );
        ProcessOutcome::LeftLeased
    }

    /// Rejects a delivery with requeue after an infrastructure error.
    async fn hand_back(&self, handle: AckHandle, task_id: Uuid) -> ProcessOutcome {
        self.stats.record_hand_back();
        let delivery_id = handle.delivery_id;

        match self.queue.reject(handle, true).await {
            Ok(outcome) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    delivery_id = %delivery_id,
                    outcome = %outcome,
                    "Handed delivery back to the queue"
                );
                self.metrics.record_redelivery(&outcome.to_string());
                if outcome == RejectOutcome::DeadLettered {
                    self.metrics.record_dead_letters("reject", 1);
                }
                ProcessOutcome::HandedBack(Some(outcome))
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    delivery_id = %delivery_id,
                    error = %e,
                    "Failed to hand delivery back, lease expiry will redeliver it"
                );
                ProcessOutcome::HandedBack(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::FixedGenerator;
    use crate::scheduler::memory::MemoryWorkQueue;
    use crate::scheduler::message::QueueMessage;
    use crate::scheduler::queue::QueueConfig;
    use crate::store::MemoryTaskStore;
    use crate::task::Metadata;

    fn fixtures(
        response: &str,
    ) -> (Arc<MemoryTaskStore>, Arc<MemoryWorkQueue>, Arc<dyn Generator>) {
        (
            Arc::new(MemoryTaskStore::default()),
            Arc::new(MemoryWorkQueue::new(QueueConfig::default())),
            Arc::new(FixedGenerator::new(response)),
        )
    }

    fn worker_for(
        store: &Arc<MemoryTaskStore>,
        queue: &Arc<MemoryWorkQueue>,
        generator: Arc<dyn Generator>,
        config: WorkerPoolConfig,
    ) -> Worker {
        Worker::new(
            "test-worker",
            store.clone() as Arc<dyn TaskStore>,
            queue.clone() as Arc<dyn WorkQueue>,
            generator,
            config,
        )
    }

    async fn enqueue_task(store: &MemoryTaskStore, queue: &MemoryWorkQueue, prompt: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create(id, prompt, Metadata::new())
            .await
            .expect("create");
        queue
            .enqueue(QueueMessage::new(id))
            .await
            .expect("enqueue");
        id
    }

    async fn take(queue: &MemoryWorkQueue) -> Delivery {
        queue
            .dequeue(Duration::from_millis(100))
            .await
            .expect("dequeue")
            .expect("a delivery")
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert_eq!(config.stale_after, Duration::from_secs(240));
        assert_eq!(config.reclaim_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_prefetch(4)
            .with_poll_interval(Duration::from_millis(50))
            .with_generation_timeout(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.prefetch, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.generation_timeout, Duration::from_secs(10));
        assert_eq!(config.stale_after, Duration::from_secs(20));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::default().validate().is_ok());
        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::default()
            .with_prefetch(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            tasks_completed: 80,
            tasks_failed: 20,
            ..Default::default()
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Some(Duration::from_secs(5)));
        stats.record_failure(None);
        stats.record_skip();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 2);
        assert_eq!(pool_stats.deliveries_skipped, 1);
        // Average over timed jobs only: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }

    #[tokio::test]
    async fn test_process_completes_task() {
        let (store, queue, generator) = fixtures("pong");
        let worker = worker_for(&store, &queue, generator, WorkerPoolConfig::default());
        let id = enqueue_task(&store, &queue, "ping").await;

        let outcome = worker.process(take(&queue).await).await;

        assert_eq!(outcome, ProcessOutcome::Completed);
        let task = store.get(id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("pong"));
        assert_eq!(queue.stats().await.expect("stats").in_flight, 0);
    }

    #[tokio::test]
    async fn test_process_drops_stale_message() {
        let (store, queue, generator) = fixtures("pong");
        let worker = worker_for(&store, &queue, generator, WorkerPoolConfig::default());
        queue
            .enqueue(QueueMessage::new(Uuid::new_v4()))
            .await
            .expect("enqueue");

        let outcome = worker.process(take(&queue).await).await;

        assert_eq!(outcome, ProcessOutcome::Stale);
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.in_flight + stats.pending, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_dropped() {
        let (store, queue, generator) = fixtures("pong");
        let worker = worker_for(&store, &queue, generator, WorkerPoolConfig::default());
        let id = enqueue_task(&store, &queue, "ping").await;
        queue
            .enqueue(QueueMessage::new(id))
            .await
            .expect("duplicate enqueue");

        assert_eq!(worker.process(take(&queue).await).await, ProcessOutcome::Completed);
        assert_eq!(worker.process(take(&queue).await).await, ProcessOutcome::Duplicate);
        assert_eq!(
            store.get(id).await.expect("task").result.as_deref(),
            Some("pong")
        );
    }

    #[tokio::test]
    async fn test_generation_timeout_marks_failed() {
        let (store, queue, _) = fixtures("unused");
        let slow: Arc<dyn Generator> =
            Arc::new(FixedGenerator::new("late").with_delay(Duration::from_secs(5)));
        let config =
            WorkerPoolConfig::default().with_generation_timeout(Duration::from_millis(20));
        let worker = worker_for(&store, &queue, slow, config);
        let id = enqueue_task(&store, &queue, "slow prompt").await;

        let outcome = worker.process(take(&queue).await).await;

        assert_eq!(outcome, ProcessOutcome::Failed);
        let task = store.get(id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.expect("error").contains("timed out"));
    }

    #[tokio::test]
    async fn test_stale_processing_task_is_abandoned() {
        let (store, queue, generator) = fixtures("pong");
        let config = WorkerPoolConfig::default().with_stale_after(Duration::from_millis(10));
        let worker = worker_for(&store, &queue, generator, config);
        let id = enqueue_task(&store, &queue, "ping").await;

        // A previous holder claimed the task and died
        store
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .expect("claim");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outcome = worker.process(take(&queue).await).await;

        assert_eq!(outcome, ProcessOutcome::Abandoned);
        let task = store.get(id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(ABANDONED_ERROR));
    }

    #[tokio::test]
    async fn test_fresh_processing_task_is_left_alone() {
        let (store, queue, generator) = fixtures("pong");
        let worker = worker_for(&store, &queue, generator, WorkerPoolConfig::default());
        let id = enqueue_task(&store, &queue, "ping").await;
        store
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .expect("claim");

        let outcome = worker.process(take(&queue).await).await;

        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_pool_processes_and_shuts_down() {
        let (store, queue, generator) = fixtures("pong");
        let config = WorkerPoolConfig::new(2)
            .with_poll_interval(Duration::from_millis(20))
            .with_reclaim_interval(Duration::from_millis(50));
        let mut pool = WorkerPool::new(
            config,
            store.clone(),
            queue.clone(),
            generator,
        );

        pool.start().await.expect("start");
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(enqueue_task(&store, &queue, &format!("prompt {}", i)).await);
        }

        for _ in 0..100 {
            if pool.stats().tasks_completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.expect("shutdown");
        assert!(!pool.is_running());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        assert_eq!(pool.stats().tasks_completed, 5);
        for id in ids {
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Completed);
        }
    }

    mod failing_backends {
        use super::*;
        use std::sync::atomic::AtomicU32;

        use async_trait::async_trait;

        use crate::scheduler::message::DeadLetter;
        use crate::scheduler::queue::{QueueStats, ReclaimReport};

        fn outage() -> StoreError {
            StoreError::Connection("store unreachable".to_string())
        }

        /// Consumes one scheduled failure, if any are left.
        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }

        /// Store that fails chosen operations a set number of times.
        #[derive(Default)]
        struct FlakyStore {
            inner: MemoryTaskStore,
            failing_gets: AtomicU32,
            failing_claims: AtomicU32,
            /// Claims that land but still report an error.
            lost_claim_replies: AtomicU32,
            failing_terminal_writes: AtomicU32,
        }

        impl FlakyStore {
            async fn enqueue_task(&self, queue: &dyn WorkQueue, prompt: &str) -> Uuid {
                let id = Uuid::new_v4();
                self.inner
                    .create(id, prompt, Metadata::new())
                    .await
                    .expect("create");
                queue.enqueue(QueueMessage::new(id)).await.expect("enqueue");
                id
            }
        }

        #[async_trait]
        impl TaskStore for FlakyStore {
            async fn create(
                &self,
                id: Uuid,
                prompt: &str,
                metadata: Metadata,
            ) -> Result<Task, StoreError> {
                self.inner.create(id, prompt, metadata).await
            }

            async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
                if take_failure(&self.failing_gets) {
                    return Err(outage());
                }
                self.inner.get(id).await
            }

            async fn transition(
                &self,
                id: Uuid,
                expected: TaskStatus,
                to: TaskStatus,
                fields: TransitionFields,
            ) -> Result<(), StoreError> {
                if expected == TaskStatus::Pending {
                    if take_failure(&self.failing_claims) {
                        return Err(outage());
                    }
                    if take_failure(&self.lost_claim_replies) {
                        self.inner.transition(id, expected, to, fields).await?;
                        return Err(outage());
                    }
                } else if take_failure(&self.failing_terminal_writes) {
                    return Err(outage());
                }
                self.inner.transition(id, expected, to, fields).await
            }

            async fn touch_ttl(&self, id: Uuid, ttl: Duration) -> Result<(), StoreError> {
                self.inner.touch_ttl(id, ttl).await
            }
        }

        /// Queue that can refuse rejects and counts dequeues dropped before
        /// they finished.
        struct WatchedQueue {
            inner: MemoryWorkQueue,
            refuse_rejects: AtomicBool,
            cancelled_dequeues: AtomicU32,
        }

        impl WatchedQueue {
            fn new(config: QueueConfig) -> Self {
                Self {
                    inner: MemoryWorkQueue::new(config),
                    refuse_rejects: AtomicBool::new(false),
                    cancelled_dequeues: AtomicU32::new(0),
                }
            }
        }

        struct DequeueGuard<'a> {
            cancelled: &'a AtomicU32,
            finished: bool,
        }

        impl Drop for DequeueGuard<'_> {
            fn drop(&mut self) {
                if !self.finished {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        #[async_trait]
        impl WorkQueue for WatchedQueue {
            async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
                self.inner.enqueue(message).await
            }

            async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
                let mut guard = DequeueGuard {
                    cancelled: &self.cancelled_dequeues,
                    finished: false,
                };
                let result = self.inner.dequeue(wait).await;
                guard.finished = true;
                result
            }

            async fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
                self.inner.ack(handle).await
            }

            async fn reject(
                &self,
                handle: AckHandle,
                requeue: bool,
            ) -> Result<RejectOutcome, QueueError> {
                if self.refuse_rejects.load(Ordering::SeqCst) {
                    return Err(QueueError::ConnectionFailed("broker unreachable".to_string()));
                }
                self.inner.reject(handle, requeue).await
            }

            async fn reclaim_expired(&self) -> Result<ReclaimReport, QueueError> {
                self.inner.reclaim_expired().await
            }

            async fn stats(&self) -> Result<QueueStats, QueueError> {
                self.inner.stats().await
            }

            async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
                self.inner.dead_letters(limit).await
            }

            fn visibility_timeout(&self) -> Duration {
                self.inner.visibility_timeout()
            }
        }

        /// Lease of 100ms against a 40ms staleness threshold.
        fn short_lease() -> QueueConfig {
            QueueConfig::default().with_visibility_timeout(Duration::from_millis(100))
        }

        fn short_lease_config() -> WorkerPoolConfig {
            WorkerPoolConfig::default()
                .with_generation_timeout(Duration::from_millis(20))
                .with_write_retry(RetryPolicy::default().with_initial_backoff(Duration::ZERO))
        }

        fn flaky_worker(
            store: &Arc<FlakyStore>,
            queue: &Arc<WatchedQueue>,
            config: WorkerPoolConfig,
        ) -> Worker {
            Worker::new(
                "flaky-worker",
                store.clone() as Arc<dyn TaskStore>,
                queue.clone() as Arc<dyn WorkQueue>,
                Arc::new(FixedGenerator::new("pong")),
                config,
            )
        }

        async fn redeliver_after_lease(queue: &WatchedQueue) -> Delivery {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let report = queue.reclaim_expired().await.expect("reclaim");
            assert_eq!(report.requeued, 1);
            take(&queue.inner).await
        }

        #[tokio::test]
        async fn test_load_failure_hands_delivery_back() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(QueueConfig::default()));
            let worker = flaky_worker(&store, &queue, short_lease_config());
            let id = store.enqueue_task(queue.as_ref(), "ping").await;
            store.failing_gets.store(1, Ordering::SeqCst);

            let outcome = worker.process(take(&queue.inner).await).await;

            assert_eq!(outcome, ProcessOutcome::HandedBack(Some(RejectOutcome::Requeued)));
            let stats = queue.stats().await.expect("stats");
            assert_eq!(stats.pending, 1);
            assert_eq!(stats.in_flight, 0);

            let redelivery = take(&queue.inner).await;
            assert_eq!(redelivery.message.redelivery_count, 1);
            assert_eq!(worker.process(redelivery).await, ProcessOutcome::Completed);
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Completed);
        }

        #[tokio::test]
        async fn test_refused_hand_back_keeps_lease() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(QueueConfig::default()));
            let worker = flaky_worker(&store, &queue, short_lease_config());
            let id = store.enqueue_task(queue.as_ref(), "ping").await;
            store.failing_gets.store(1, Ordering::SeqCst);
            queue.refuse_rejects.store(true, Ordering::SeqCst);

            let outcome = worker.process(take(&queue.inner).await).await;

            assert_eq!(outcome, ProcessOutcome::HandedBack(None));
            assert_eq!(queue.stats().await.expect("stats").in_flight, 1);
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Pending);
        }

        #[tokio::test]
        async fn test_claim_outage_leaves_delivery_leased() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(short_lease()));
            let worker = flaky_worker(&store, &queue, short_lease_config());
            let id = store.enqueue_task(queue.as_ref(), "ping").await;
            store.failing_claims.store(1, Ordering::SeqCst);

            let outcome = worker.process(take(&queue.inner).await).await;

            assert_eq!(outcome, ProcessOutcome::LeftLeased);
            let stats = queue.stats().await.expect("stats");
            assert_eq!(stats.in_flight, 1);
            assert_eq!(stats.pending, 0);
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Pending);

            let redelivery = redeliver_after_lease(&queue).await;
            assert_eq!(worker.process(redelivery).await, ProcessOutcome::Completed);
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Completed);
        }

        #[tokio::test]
        async fn test_claim_landing_without_reply_is_abandoned_on_redelivery() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(short_lease()));
            let worker = flaky_worker(&store, &queue, short_lease_config());
            let id = store.enqueue_task(queue.as_ref(), "ping").await;
            store.lost_claim_replies.store(1, Ordering::SeqCst);

            assert_eq!(
                worker.process(take(&queue.inner).await).await,
                ProcessOutcome::LeftLeased
            );
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Processing);

            let redelivery = redeliver_after_lease(&queue).await;
            assert_eq!(worker.process(redelivery).await, ProcessOutcome::Abandoned);

            let task = store.get(id).await.expect("task");
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(ABANDONED_ERROR));
            let stats = queue.stats().await.expect("stats");
            assert_eq!(stats.pending + stats.in_flight, 0);
        }

        #[tokio::test]
        async fn test_exhausted_terminal_writes_end_as_abandoned() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(short_lease()));
            let worker = flaky_worker(&store, &queue, short_lease_config());
            let id = store.enqueue_task(queue.as_ref(), "ping").await;
            store.failing_terminal_writes.store(3, Ordering::SeqCst);

            assert_eq!(
                worker.process(take(&queue.inner).await).await,
                ProcessOutcome::LeftLeased
            );
            assert_eq!(store.failing_terminal_writes.load(Ordering::SeqCst), 0);
            assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Processing);
            assert_eq!(queue.stats().await.expect("stats").in_flight, 1);

            // The redelivery must settle the task instead of skipping it
            let redelivery = redeliver_after_lease(&queue).await;
            assert_eq!(worker.process(redelivery).await, ProcessOutcome::Abandoned);

            let task = store.get(id).await.expect("task");
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(ABANDONED_ERROR));
        }

        #[tokio::test]
        async fn test_pool_settles_task_after_terminal_write_outage() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(short_lease()));
            let config = WorkerPoolConfig::new(1)
                .with_poll_interval(Duration::from_millis(20))
                .with_reclaim_interval(Duration::from_millis(20))
                .with_generation_timeout(Duration::from_millis(20))
                .with_write_retry(RetryPolicy::default().with_initial_backoff(Duration::ZERO));
            let mut pool = WorkerPool::new(
                config,
                store.clone(),
                queue.clone(),
                Arc::new(FixedGenerator::new("pong")),
            );
            store.failing_terminal_writes.store(3, Ordering::SeqCst);
            pool.start().await.expect("start");

            let id = store.enqueue_task(queue.as_ref(), "ping").await;

            let mut task = store.get(id).await.expect("task");
            for _ in 0..100 {
                if task.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                task = store.get(id).await.expect("task");
            }

            pool.shutdown().await.expect("shutdown");

            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(ABANDONED_ERROR));
            let stats = pool.stats();
            assert_eq!(stats.deliveries_left_leased, 1);
            assert_eq!(stats.tasks_failed, 1);
            let queue_stats = queue.stats().await.expect("stats");
            assert_eq!(queue_stats.pending + queue_stats.in_flight, 0);
        }

        #[tokio::test]
        async fn test_start_rejects_lease_shorter_than_stale_after() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(short_lease()));
            let mut pool = WorkerPool::new(
                WorkerPoolConfig::new(1),
                store,
                queue,
                Arc::new(FixedGenerator::new("pong")),
            );

            let err = pool.start().await.unwrap_err();

            assert!(matches!(err, PoolError::InvalidConfig(_)));
            assert!(err.to_string().contains("stale_after"));
            assert!(!pool.is_running());
        }

        #[tokio::test]
        async fn test_pending_dequeue_survives_completions() {
            let store = Arc::new(FlakyStore::default());
            let queue = Arc::new(WatchedQueue::new(QueueConfig::default()));
            let config = WorkerPoolConfig::new(1)
                .with_prefetch(2)
                .with_poll_interval(Duration::from_millis(50))
                .with_reclaim_interval(Duration::from_millis(50));
            let mut pool = WorkerPool::new(
                config,
                store.clone(),
                queue.clone(),
                Arc::new(FixedGenerator::new("pong").with_delay(Duration::from_millis(20))),
            );
            pool.start().await.expect("start");

            let mut ids = Vec::new();
            for i in 0..6 {
                ids.push(store.enqueue_task(queue.as_ref(), &format!("prompt {}", i)).await);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            for _ in 0..200 {
                if pool.stats().tasks_completed == 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            pool.shutdown().await.expect("shutdown");

            assert_eq!(pool.stats().tasks_completed, 6);
            assert_eq!(queue.cancelled_dequeues.load(Ordering::SeqCst), 0);
            for id in ids {
                assert_eq!(store.get(id).await.expect("task").status, TaskStatus::Completed);
            }
        }
    }
}
