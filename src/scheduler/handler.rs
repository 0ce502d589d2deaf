//! Task handlers and the context they run in.
//!
//! A handler receives a [`DispatchContext`] for exactly one task. The context
//! carries the task, the stores the handler may write to, a [`Submitter`] for
//! spawning children, and the cancellation signal the dispatcher raises when
//! the task is cancelled or runs out of time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use super::submitter::{SubmitError, Submitter};
use super::task::{QueuedTask, TaskType};
use crate::events::{CallerInfo, EventError, EventPayload, EventPublisher, StreamId};
use crate::storage::{Database, StorageError};

/// Errors returned by task handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business failure; the task is retried while its schedule allows.
    #[error("Task failed: {0}")]
    Failed(String),

    /// The payload can never be processed; retrying is pointless.
    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    /// The handler refused the task, e.g. a duplicate datapack.
    #[error("Task rejected: {0}")]
    Rejected(String),

    /// No handler is registered for the task.
    #[error("No handler registered for {0}")]
    NoHandler(String),

    /// The task was cancelled while running.
    #[error("Task cancelled")]
    Cancelled,

    /// The task ran past its deadline.
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),
}

impl HandlerError {
    /// Whether a failed attempt should be scheduled for another try.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            HandlerError::InvalidPayload(_)
                | HandlerError::Rejected(_)
                | HandlerError::NoHandler(_)
                | HandlerError::Cancelled
                | HandlerError::DeadlineExceeded(_)
        )
    }

    /// Whether the task should end in `Cancelled` rather than `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            HandlerError::Cancelled | HandlerError::DeadlineExceeded(_)
        )
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

/// Executes one kind of task.
///
/// Handlers must be idempotent: a retried task runs the handler again from
/// the start. They should write through conditional upserts keyed by task id.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &DispatchContext) -> Result<(), HandlerError>;
}

/// Cancellation senders of the tasks currently running in this process.
#[derive(Debug, Clone, Default)]
pub struct InFlightTasks {
    inner: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a running task and returns its cancellation receiver.
    pub fn register(&self, task_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.lock().insert(task_id.to_string(), tx);
        rx
    }

    pub fn finish(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Signals a running task. Returns false if the task is not running here.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock().get(task_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Everything a handler may touch while running one task.
pub struct DispatchContext {
    task: QueuedTask,
    worker_id: usize,
    publisher: EventPublisher,
    submitter: Submitter,
    db: Database,
    detector_algorithm: String,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl DispatchContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: QueuedTask,
        worker_id: usize,
        publisher: EventPublisher,
        submitter: Submitter,
        db: Database,
        detector_algorithm: impl Into<String>,
        deadline: Instant,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task,
            worker_id,
            publisher,
            submitter,
            db,
            detector_algorithm: detector_algorithm.into(),
            deadline,
            cancel,
        }
    }

    pub fn task(&self) -> &QueuedTask {
        &self.task
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    /// Name of the algorithm that classifies datapacks.
    pub fn detector_algorithm(&self) -> &str {
        &self.detector_algorithm
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the task has been cancelled.
    ///
    /// Never resolves if the sender is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Publishes an event about this task.
    pub async fn publish(
        &self,
        payload: EventPayload,
        caller: CallerInfo,
    ) -> Result<StreamId, HandlerError> {
        Ok(self.publisher.publish(&self.task, payload, caller).await?)
    }
}

/// Maps task types to their handlers.
///
/// `Custom` tasks are routed by the `handler` field of their payload when a
/// named handler is registered, otherwise to the handler registered for
/// `TaskType::Custom`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    by_type: HashMap<TaskType, Arc<dyn TaskHandler>>,
    custom: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.by_type.insert(task_type, handler);
        self
    }

    /// Registers a named handler for `Custom` tasks.
    pub fn register_custom(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.custom.insert(name.into(), handler);
        self
    }

    /// Finds the handler for `task`.
    pub fn resolve(&self, task: &QueuedTask) -> Result<Arc<dyn TaskHandler>, HandlerError> {
        if task.task_type == TaskType::Custom {
            if let Some(name) = task.payload.get("handler").and_then(|v| v.as_str()) {
                if let Some(handler) = self.custom.get(name) {
                    return Ok(handler.clone());
                }
            }
        }

        self.by_type
            .get(&task.task_type)
            .cloned()
            .ok_or_else(|| HandlerError::NoHandler(task.task_type.to_string()))
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.by_type.contains_key(&task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl TaskHandler for Named {
        async fn handle(&self, _ctx: &DispatchContext) -> Result<(), HandlerError> {
            Err(HandlerError::Failed(self.0.to_string()))
        }
    }

    fn queued(task_type: TaskType, payload: serde_json::Value) -> QueuedTask {
        QueuedTask {
            task_id: "t".to_string(),
            task_type,
            trace_id: "tr".to_string(),
            group_id: None,
            parent_task_id: None,
            level: 0,
            execute_time: None,
            retry_count: 0,
            deadline: None,
            payload,
        }
    }

    fn err_name(result: Result<Arc<dyn TaskHandler>, HandlerError>) -> String {
        match result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_registry_resolves_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::BuildImage, Arc::new(Named("build")));

        assert!(registry.handles(TaskType::BuildImage));
        assert!(registry.resolve(&queued(TaskType::BuildImage, json!({}))).is_ok());
        assert!(err_name(registry.resolve(&queued(TaskType::RunAlgorithm, json!({}))))
            .contains("RunAlgorithm"));
    }

    #[test]
    fn test_registry_routes_custom_by_name() {
        let mut registry = HandlerRegistry::new();
        registry.register_custom("cleanup", Arc::new(Named("cleanup")));

        assert!(registry
            .resolve(&queued(TaskType::Custom, json!({"handler": "cleanup"})))
            .is_ok());
        assert!(registry
            .resolve(&queued(TaskType::Custom, json!({"handler": "other"})))
            .is_err());

        registry.register(TaskType::Custom, Arc::new(Named("fallback")));
        assert!(registry
            .resolve(&queued(TaskType::Custom, json!({"handler": "other"})))
            .is_ok());
    }

    #[test]
    fn test_error_policy() {
        assert!(HandlerError::Failed("x".to_string()).is_retryable());
        assert!(!HandlerError::InvalidPayload("x".to_string()).is_retryable());
        assert!(!HandlerError::Cancelled.is_retryable());
        assert!(HandlerError::DeadlineExceeded(Duration::from_secs(1)).is_cancellation());
        assert!(!HandlerError::Failed("x".to_string()).is_cancellation());
    }

    #[tokio::test]
    async fn test_in_flight_cancel_signals_receiver() {
        let in_flight = InFlightTasks::new();
        let mut rx = in_flight.register("a");

        assert!(in_flight.contains("a"));
        assert!(!in_flight.cancel("b"));
        assert!(in_flight.cancel("a"));
        rx.wait_for(|c| *c).await.unwrap();

        in_flight.finish("a");
        assert!(in_flight.is_empty());
        assert!(!in_flight.cancel("a"));
    }
}
