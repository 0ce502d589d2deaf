//! Dispatcher: the worker pool that drives tasks through the queues.
//!
//! Each worker repeats one cycle: acquire a slot on the concurrency gate,
//! take the oldest ready entry, run its handler, record the outcome and
//! give the slot back. Two background loops promote due delayed tasks and
//! replay dead letters whose backoff has elapsed.
//!
//! # Features
//!
//! - Global concurrency cap shared with other processes through the gate
//! - Graceful shutdown with broadcast channel
//! - Dead-letter retry following the configured schedule
//! - Per-task cancellation and deadlines
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::gate::ConcurrencyGate;
use super::handler::{DispatchContext, HandlerError, HandlerRegistry, InFlightTasks};
use super::queue::{QueueBackend, QueueError};
use super::submitter::Submitter;
use super::task::{QueuedTask, TaskState, TaskStatus};
use crate::config::{ConfigError, DispatcherConfig};
use crate::error::{transient_backoff, Classify};
use crate::events::{EventPayload, EventPublisher, EventStore, TaskStatusKind};
use crate::metrics::{DeadLetterReason, MetricsCollector, TaskOutcome};
use crate::storage::Database;

/// Errors that can occur in the dispatcher lifecycle.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Dispatcher is already running.
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    /// Dispatcher is not running.
    #[error("Dispatcher is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The queue store failed during startup.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a handler.
    pub active_workers: usize,
    /// Task attempts that succeeded.
    pub tasks_succeeded: u64,
    /// Task attempts that failed or were cancelled.
    pub tasks_failed: u64,
    /// Entries written to the dead-letter set.
    pub dead_lettered: u64,
    /// Average handler duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts processed (succeeded + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_success(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.tasks_succeeded.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

/// State shared by the workers and background loops.
struct DispatchCore {
    config: DispatcherConfig,
    queue: Arc<dyn QueueBackend>,
    gate: Arc<dyn ConcurrencyGate>,
    db: Database,
    publisher: EventPublisher,
    submitter: Submitter,
    handlers: HandlerRegistry,
    in_flight: InFlightTasks,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
    stopping: AtomicBool,
}

/// Worker pool that runs task handlers under the global concurrency cap.
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher over the given stores.
    ///
    /// Nothing runs until [`Dispatcher::start`] is called.
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<dyn QueueBackend>,
        gate: Arc<dyn ConcurrencyGate>,
        db: Database,
        events: Arc<dyn EventStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        let in_flight = InFlightTasks::new();
        let publisher = EventPublisher::new(events, db.clone());
        let submitter = Submitter::new(db.clone(), queue.clone(), in_flight.clone());

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            core: Arc::new(DispatchCore {
                config,
                queue,
                gate,
                db,
                publisher,
                submitter,
                handlers,
                in_flight,
                stats: SharedPoolStats::new(),
                metrics: MetricsCollector::new(),
                stopping: AtomicBool::new(false),
            }),
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Submitter sharing this dispatcher's stores and cancellation registry.
    pub fn submitter(&self) -> Submitter {
        self.core.submitter.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core.config
    }

    /// Starts the background loops and all workers.
    ///
    /// The gate counter is reset first; no slot can be legitimately held
    /// before this dispatcher's workers exist.
    ///
    /// # Errors
    ///
    /// Returns `DispatcherError::AlreadyRunning` if the dispatcher is already
    /// running, or a queue error if the gate cannot be reset.
    pub async fn start(&mut self) -> Result<(), DispatcherError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(DispatcherError::AlreadyRunning);
        }
        self.core.config.validate()?;

        let leaked = self.core.gate.current().await?;
        self.core.gate.reset().await?;
        if leaked > 0 {
            warn!(leaked, "Reset leaked concurrency slots");
        }
        self.core.stopping.store(false, Ordering::SeqCst);

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { core.promote_loop(shutdown_rx).await }));

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { core.replay_loop(shutdown_rx).await }));

        for id in 0..self.core.config.num_workers {
            let worker = Worker {
                id,
                core: Arc::clone(&self.core),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            self.handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.core.config.num_workers,
            max_concurrency = self.core.config.max_concurrency,
            "Dispatcher started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the task they are running; running handlers are not
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns `DispatcherError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), DispatcherError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatcherError::NotRunning);
        }

        info!("Initiating dispatcher shutdown");
        self.core.stopping.store(true, Ordering::SeqCst);

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.core.config.shutdown_timeout;
        let handles: Vec<_> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Dispatcher shutdown complete");
                Ok(())
            }
            Err(_) => Err(DispatcherError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.core.stats.to_pool_stats(self.core.config.num_workers)
    }

    /// Returns whether the dispatcher is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Runs one promotion pass outside the background loop.
    pub async fn promote_now(&self) -> usize {
        self.core.promote_once(Utc::now().timestamp()).await
    }

    /// Runs one dead-letter replay pass outside the background loop.
    pub async fn replay_now(&self) -> usize {
        self.core.replay_once(Utc::now().timestamp()).await
    }
}

impl DispatchCore {
    /// Retries a store operation while it fails transiently.
    ///
    /// Gives up (returning `None`) on non-transient errors and once the
    /// dispatcher is stopping.
    async fn retry_transient<T, E, F, Fut>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) if e.kind().is_transient() && !self.stopping.load(Ordering::SeqCst) => {
                    let delay = transient_backoff(attempt);
                    warn!(operation = what, attempt, error = %e, ?delay, "Store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(operation = what, error = %e, "Store operation failed");
                    return None;
                }
            }
        }
    }

    async fn set_state(&self, task_id: &str, state: TaskState) {
        self.retry_transient("set task state", || self.db.set_task_state(task_id, state))
            .await;
    }

    async fn publish_status(&self, task: &QueuedTask, status: TaskStatusKind, message: Option<String>) {
        let payload = EventPayload::status(status, message);
        self.retry_transient("publish event", || {
            self.publisher
                .publish(task, payload.clone(), crate::caller_info!())
        })
        .await;
    }

    /// Moves every due delayed task to the ready list. Returns how many moved.
    async fn promote_once(&self, now: i64) -> usize {
        let promoted = match self.queue.promote_due(now).await {
            Ok(promoted) => promoted,
            Err(e) => {
                warn!(error = %e, "Failed to promote delayed tasks");
                return 0;
            }
        };

        for payload in &promoted {
            if let Some(task_id) = QueuedTask::peek_task_id(payload) {
                if let Err(e) = self.db.set_task_state(&task_id, TaskState::Ready).await {
                    debug!(task_id = %task_id, error = %e, "Promoted task has no ready record");
                }
            }
        }
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "Promoted delayed tasks");
            self.metrics.record_promoted(promoted.len());
        }

        match self.queue.stats().await {
            Ok(stats) => self.metrics.update_queue_depths(&stats),
            Err(e) => debug!(error = %e, "Failed to read queue stats"),
        }
        promoted.len()
    }

    /// Moves dead letters whose backoff has elapsed back to the ready list.
    async fn replay_once(&self, now: i64) -> usize {
        let replayed = match self.queue.replay_dead_letters(now).await {
            Ok(replayed) => replayed,
            Err(e) => {
                warn!(error = %e, "Failed to replay dead letters");
                return 0;
            }
        };

        for payload in &replayed {
            if let Some(task_id) = QueuedTask::peek_task_id(payload) {
                if let Err(e) = self.db.set_task_state(&task_id, TaskState::Ready).await {
                    debug!(task_id = %task_id, error = %e, "Replayed task has no ready record");
                }
            }
        }
        if !replayed.is_empty() {
            info!(count = replayed.len(), "Replayed dead letters");
        }
        replayed.len()
    }

    async fn promote_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.promote_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.promote_once(Utc::now().timestamp()).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Promotion loop stopped");
    }

    async fn replay_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.dlq_replay_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.replay_once(Utc::now().timestamp()).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Dead-letter replay loop stopped");
    }

    /// Runs one raw queue entry to completion.
    async fn dispatch(&self, worker_id: usize, raw: &str) {
        let task = match QueuedTask::decode(raw) {
            Ok(task) => task,
            Err(e) => {
                error!(worker_id, error = %e, "Undecodable queue entry, dead-lettering as poison");
                self.dead_letter_poison(raw, &e.to_string()).await;
                return;
            }
        };

        let record = self
            .retry_transient("load task", || self.db.get_task(&task.task_id))
            .await
            .flatten();
        if let Some(record) = &record {
            if record.status == TaskStatus::Deleted || record.state.is_terminal() {
                info!(
                    worker_id,
                    task_id = %task.task_id,
                    status = %record.status,
                    state = %record.state,
                    "Dropping task that is no longer runnable"
                );
                if let Err(e) = self.queue.unset_index(&task.task_id).await {
                    debug!(task_id = %task.task_id, error = %e, "Failed to unset index");
                }
                self.metrics
                    .record_task(task.task_type, TaskOutcome::Skipped, 0.0);
                return;
            }
        }

        let budget = self.time_budget(&task);
        let started = Instant::now();
        info!(
            worker_id,
            task_id = %task.task_id,
            trace_id = %task.trace_id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "Processing task"
        );

        let result = match budget {
            None => Err(HandlerError::DeadlineExceeded(Duration::ZERO)),
            Some(budget) => self.run_handler(worker_id, &task, budget).await,
        };

        self.finalize(worker_id, raw, &task, result, started.elapsed())
            .await;
    }

    /// Time the handler may run: the per-type default, shortened by the
    /// task's own deadline. `None` when the deadline already passed.
    fn time_budget(&self, task: &QueuedTask) -> Option<Duration> {
        let default = self.config.task_timeouts.for_type(task.task_type);
        match task.deadline {
            Some(deadline) => {
                let left = deadline - Utc::now().timestamp();
                if left <= 0 {
                    None
                } else {
                    Some(default.min(Duration::from_secs(left as u64)))
                }
            }
            None => Some(default),
        }
    }

    async fn run_handler(
        &self,
        worker_id: usize,
        task: &QueuedTask,
        budget: Duration,
    ) -> Result<(), HandlerError> {
        let handler = self.handlers.resolve(task)?;

        self.set_state(&task.task_id, TaskState::Running).await;
        self.publish_status(task, TaskStatusKind::Running, None).await;

        let cancel_rx = self.in_flight.register(&task.task_id);
        let ctx = DispatchContext::new(
            task.clone(),
            worker_id,
            self.publisher.clone(),
            self.submitter.clone(),
            self.db.clone(),
            self.config.detector_algorithm.clone(),
            tokio::time::Instant::now() + budget,
            cancel_rx,
        );

        self.stats.increment_active();
        self.metrics.inc_in_flight();

        let result = tokio::select! {
            result = handler.handle(&ctx) => result,
            _ = ctx.cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(budget) => Err(HandlerError::DeadlineExceeded(budget)),
        };

        self.stats.decrement_active();
        self.metrics.dec_in_flight();
        self.in_flight.finish(&task.task_id);
        result
    }

    async fn finalize(
        &self,
        worker_id: usize,
        raw: &str,
        task: &QueuedTask,
        result: Result<(), HandlerError>,
        elapsed: Duration,
    ) {
        let secs = elapsed.as_secs_f64();
        match result {
            Ok(()) => {
                self.set_state(&task.task_id, TaskState::Succeeded).await;
                self.publish_status(task, TaskStatusKind::Completed, None)
                    .await;
                self.stats.record_success(elapsed);
                self.metrics
                    .record_task(task.task_type, TaskOutcome::Succeeded, secs);
                info!(worker_id, task_id = %task.task_id, duration_ms = elapsed.as_millis() as u64, "Task succeeded");
            }
            Err(e) if e.is_cancellation() => {
                self.set_state(&task.task_id, TaskState::Cancelled).await;
                self.publish_status(task, TaskStatusKind::Error, Some(e.to_string()))
                    .await;
                self.stats.record_failure(elapsed);
                self.metrics
                    .record_task(task.task_type, TaskOutcome::Cancelled, secs);
                warn!(worker_id, task_id = %task.task_id, reason = %e, "Task cancelled");
            }
            Err(e) => {
                self.set_state(&task.task_id, TaskState::Failed).await;
                self.publish_status(task, TaskStatusKind::Error, Some(e.to_string()))
                    .await;
                self.stats.record_failure(elapsed);
                self.metrics
                    .record_task(task.task_type, TaskOutcome::Failed, secs);

                let (backoff, reason) = if !e.is_retryable() {
                    (None, DeadLetterReason::Permanent)
                } else {
                    match self.config.retry_schedule.backoff_for(task.retry_count) {
                        Some(backoff) => (Some(backoff), DeadLetterReason::Retry),
                        None => (None, DeadLetterReason::Exhausted),
                    }
                };
                warn!(
                    worker_id,
                    task_id = %task.task_id,
                    attempt = task.retry_count + 1,
                    error = %e,
                    retry_in = ?backoff,
                    "Task failed"
                );

                let next = task.next_attempt();
                let payload = match next.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(task_id = %task.task_id, error = %e, "Failed to encode retry payload, dead-lettering as poison");
                        self.dead_letter_poison(raw, &e.to_string()).await;
                        return;
                    }
                };
                if self
                    .retry_transient("dead-letter", || self.queue.dead_letter(&payload, backoff))
                    .await
                    .is_some()
                {
                    self.stats.record_dead_letter();
                    self.metrics.record_dead_letter(reason);
                }
            }
        }
    }

    /// Parks `raw` in the dead-letter set permanently.
    async fn dead_letter_poison(&self, raw: &str, reason: &str) {
        if self
            .retry_transient("dead-letter poison", || {
                self.queue.dead_letter_poison(raw, reason)
            })
            .await
            .is_some()
        {
            self.stats.record_dead_letter();
            self.metrics.record_dead_letter(DeadLetterReason::Poison);
        }
    }

    async fn release_gate(&self, worker_id: usize) {
        if self
            .retry_transient("release gate", || self.gate.release())
            .await
            .is_none()
        {
            error!(worker_id, "Failed to release concurrency slot");
        }
    }
}

/// A single worker loop.
struct Worker {
    id: usize,
    core: Arc<DispatchCore>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Runs gate, take, dispatch and release until a shutdown signal is
    /// received.
    async fn run(mut self) {
        info!(worker_id = self.id, "Worker started");
        let max = self.core.config.max_concurrency;
        let mut store_failures = 0u32;

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.core.gate.try_acquire(max).await {
                Ok(true) => {}
                Ok(false) => {
                    self.core.metrics.record_gate_saturated();
                    debug!(worker_id = self.id, "Concurrency gate saturated");
                    if self.pause(self.core.config.gate_backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "Failed to acquire concurrency slot");
                    let delay = transient_backoff(store_failures);
                    store_failures = store_failures.saturating_add(1);
                    if self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            }

            match self.core.queue.blocking_take(self.core.config.take_timeout).await {
                Ok(Some(raw)) => {
                    store_failures = 0;
                    self.core.dispatch(self.id, &raw).await;
                    self.core.release_gate(self.id).await;
                }
                Ok(None) => {
                    store_failures = 0;
                    self.core.release_gate(self.id).await;
                }
                Err(e) => {
                    self.core.release_gate(self.id).await;
                    warn!(worker_id = self.id, error = %e, "Failed to take from ready queue");
                    let delay = transient_backoff(store_failures);
                    store_failures = store_failures.saturating_add(1);
                    if self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    /// Sleeps for `delay`. Returns true if shutdown was signalled meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }
}
