//! Task submission and cancellation.
//!
//! Submission persists the task record before it touches the queue store, so
//! a task visible in a queue always has a row in the repository. Validation
//! failures are reported before anything is written.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::handler::InFlightTasks;
use super::queue::{QueueBackend, QueueError, QueueName};
use super::task::{Task, TaskState, TaskStatus, TaskType};
use crate::storage::{Database, StorageError};

/// Errors returned by [`Submitter`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request was rejected before any state was written.
    #[error("Invalid task: {0}")]
    Validation(String),

    /// The referenced parent task does not exist.
    #[error("Parent task not found: {0}")]
    ParentNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A task to be submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Trace to join; a new trace is started when absent.
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Push straight onto the ready list instead of the delayed set.
    #[serde(default)]
    pub immediate: bool,
    /// Epoch seconds; required unless `immediate`.
    #[serde(default)]
    pub execute_time: Option<i64>,
    /// Absolute deadline in epoch seconds.
    #[serde(default)]
    pub deadline: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_type,
            trace_id: None,
            group_id: None,
            parent_task_id: None,
            immediate: false,
            execute_time: None,
            deadline: None,
            payload,
        }
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Schedules the task for `execute_time` (epoch seconds).
    pub fn at(mut self, execute_time: i64) -> Self {
        self.immediate = false;
        self.execute_time = Some(execute_time);
        self
    }

    pub fn in_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Makes this task a child of `parent_task_id`; trace and group default
    /// to the parent's.
    pub fn child_of(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: i64) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn validate(&self) -> Result<(), SubmitError> {
        if matches!(self.trace_id.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(SubmitError::Validation("trace_id must not be empty".to_string()));
        }
        if !self.immediate && self.execute_time.is_none() {
            return Err(SubmitError::Validation(
                "delayed tasks need an execute_time".to_string(),
            ));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(SubmitError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }
        if let (Some(deadline), Some(execute_time)) = (self.deadline, self.execute_time) {
            if deadline <= execute_time {
                return Err(SubmitError::Validation(
                    "deadline must be after execute_time".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// What a cancel request touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    /// Queues the task was removed from.
    pub removed_from: Vec<QueueName>,
    /// Whether a running handler in this process was signalled.
    pub signalled: bool,
}

/// Registers tasks in the repository and places them on the queues.
#[derive(Clone)]
pub struct Submitter {
    db: Database,
    queue: Arc<dyn QueueBackend>,
    in_flight: InFlightTasks,
}

impl Submitter {
    pub fn new(db: Database, queue: Arc<dyn QueueBackend>, in_flight: InFlightTasks) -> Self {
        Self {
            db,
            queue,
            in_flight,
        }
    }

    /// Validates, persists and enqueues a task.
    ///
    /// Tasks whose execute time has already passed go straight to the ready
    /// list. Returns the stored record in its queued state.
    pub async fn submit(&self, new: NewTask) -> Result<Task, SubmitError> {
        new.validate()?;

        let (trace_id, group_id, level) = match &new.parent_task_id {
            Some(parent_id) => {
                let parent = self
                    .db
                    .get_task(parent_id)
                    .await?
                    .ok_or_else(|| SubmitError::ParentNotFound(parent_id.clone()))?;
                if let Some(trace_id) = &new.trace_id {
                    if *trace_id != parent.trace_id {
                        return Err(SubmitError::Validation(format!(
                            "child trace {} differs from parent trace {}",
                            trace_id, parent.trace_id
                        )));
                    }
                }
                (
                    parent.trace_id,
                    new.group_id.clone().or(parent.group_id),
                    parent.level + 1,
                )
            }
            None => (
                new.trace_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                new.group_id.clone(),
                0,
            ),
        };

        let now = Utc::now();
        let record = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type: new.task_type,
            trace_id,
            group_id,
            parent_task_id: new.parent_task_id.clone(),
            level,
            sequence: 0,
            payload: new.payload.clone(),
            immediate: new.immediate,
            execute_time: new.execute_time,
            deadline: new.deadline,
            state: TaskState::Pending,
            status: TaskStatus::Enabled,
            created_at: now,
            updated_at: now,
        };

        let mut stored = self.db.upsert_task(&record).await?;

        match self.enqueue(&stored, now.timestamp()).await {
            Ok(state) => {
                // Only a queued task opens its trace.
                self.db
                    .ensure_trace(&stored.trace_id, stored.group_id.as_deref(), stored.task_type)
                    .await?;
                self.db.set_task_state(&stored.task_id, state).await?;
                stored.state = state;
            }
            Err(e) => {
                // The row exists but no queue holds it; hide it from listings.
                if let Err(mark) = self
                    .db
                    .set_task_status(&stored.task_id, TaskStatus::Deleted)
                    .await
                {
                    warn!(task_id = %stored.task_id, error = %mark, "Failed to retire unqueued task");
                }
                return Err(e);
            }
        }

        info!(
            task_id = %stored.task_id,
            trace_id = %stored.trace_id,
            task_type = %stored.task_type,
            level = stored.level,
            state = %stored.state,
            "Task submitted"
        );
        Ok(stored)
    }

    async fn enqueue(&self, task: &Task, now: i64) -> Result<TaskState, SubmitError> {
        let payload = task.to_queued(0).encode()?;
        match task.execute_time {
            Some(at) if !task.immediate && at > now => {
                self.queue.submit_delayed(&payload, &task.task_id, at).await?;
                Ok(TaskState::Queued)
            }
            _ => {
                self.queue.submit_immediate(&payload, &task.task_id).await?;
                Ok(TaskState::Ready)
            }
        }
    }

    /// Cancels a task wherever it is.
    ///
    /// The task is soft-deleted first so that a worker taking it concurrently
    /// drops it, then removed from every queue. A handler running in this
    /// process is signalled as well.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome, SubmitError> {
        self.db.set_task_status(task_id, TaskStatus::Deleted).await?;

        let mut outcome = CancelOutcome::default();
        for queue in QueueName::ALL {
            if self.queue.remove_by_id(queue, task_id).await? {
                outcome.removed_from.push(queue);
            }
        }
        self.queue.unset_index(task_id).await?;
        outcome.signalled = self.in_flight.cancel(task_id);

        self.db.set_task_state(task_id, TaskState::Cancelled).await?;

        info!(
            task_id,
            removed = outcome.removed_from.len(),
            signalled = outcome.signalled,
            "Task cancelled"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::memory::MemoryQueue;
    use crate::scheduler::task::QueuedTask;
    use crate::storage::database::test_database;
    use serde_json::json;

    async fn setup() -> (Submitter, Arc<MemoryQueue>, Database, InFlightTasks) {
        let db = test_database().await;
        let queue = Arc::new(MemoryQueue::new());
        let in_flight = InFlightTasks::new();
        let submitter = Submitter::new(db.clone(), queue.clone(), in_flight.clone());
        (submitter, queue, db, in_flight)
    }

    #[tokio::test]
    async fn test_submit_immediate_is_ready() {
        let (submitter, queue, db, _) = setup().await;

        let task = submitter
            .submit(NewTask::new(TaskType::BuildImage, json!({"image": "a"})).immediate())
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.level, 0);
        let ready = queue.ready_snapshot();
        assert_eq!(ready.len(), 1);
        assert_eq!(QueuedTask::decode(&ready[0]).unwrap().task_id, task.task_id);
        assert_eq!(
            queue.index_of(&task.task_id).await.unwrap(),
            Some(QueueName::Ready)
        );

        let stored = db.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Ready);
        assert!(db.get_trace(&task.trace_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_submit_delayed_goes_to_delayed_set() {
        let (submitter, queue, _, _) = setup().await;
        let at = Utc::now().timestamp() + 3600;

        let task = submitter
            .submit(NewTask::new(TaskType::InjectFault, json!({})).at(at))
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Queued);
        let delayed = queue.delayed_snapshot();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0, at as f64);
    }

    #[tokio::test]
    async fn test_submit_past_execute_time_is_ready() {
        let (submitter, queue, _, _) = setup().await;
        let task = submitter
            .submit(NewTask::new(TaskType::InjectFault, json!({})).at(1))
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(queue.stats().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_submit_validation_writes_nothing() {
        let (submitter, queue, db, _) = setup().await;

        let missing_time = submitter
            .submit(NewTask::new(TaskType::Custom, json!({})))
            .await;
        assert!(matches!(missing_time, Err(SubmitError::Validation(_))));

        let empty_trace = submitter
            .submit(NewTask::new(TaskType::Custom, json!({})).immediate().in_trace(""))
            .await;
        assert!(matches!(empty_trace, Err(SubmitError::Validation(_))));

        let scalar_payload = submitter
            .submit(NewTask::new(TaskType::Custom, json!(3)).immediate())
            .await;
        assert!(matches!(scalar_payload, Err(SubmitError::Validation(_))));

        let orphan = submitter
            .submit(NewTask::new(TaskType::Custom, json!({})).immediate().child_of("nope"))
            .await;
        assert!(matches!(orphan, Err(SubmitError::ParentNotFound(_))));

        assert_eq!(queue.stats().await.unwrap().total(), 0);
        assert_eq!(db.task_stats().await.unwrap().total, 0);
    }

    /// A queue store that is down.
    struct DownQueue;

    fn down() -> QueueError {
        QueueError::ConnectionFailed("connection refused".to_string())
    }

    #[async_trait::async_trait]
    impl QueueBackend for DownQueue {
        async fn submit_immediate(&self, _: &str, _: &str) -> Result<(), QueueError> {
            Err(down())
        }
        async fn submit_delayed(&self, _: &str, _: &str, _: i64) -> Result<(), QueueError> {
            Err(down())
        }
        async fn promote_due(&self, _: i64) -> Result<Vec<String>, QueueError> {
            Err(down())
        }
        async fn blocking_take(
            &self,
            _: std::time::Duration,
        ) -> Result<Option<String>, QueueError> {
            Err(down())
        }
        async fn dead_letter(
            &self,
            _: &str,
            _: Option<std::time::Duration>,
        ) -> Result<(), QueueError> {
            Err(down())
        }
        async fn replay_dead_letters(&self, _: i64) -> Result<Vec<String>, QueueError> {
            Err(down())
        }
        async fn remove_by_id(&self, _: QueueName, _: &str) -> Result<bool, QueueError> {
            Err(down())
        }
        async fn unset_index(&self, _: &str) -> Result<(), QueueError> {
            Err(down())
        }
        async fn index_of(&self, _: &str) -> Result<Option<QueueName>, QueueError> {
            Err(down())
        }
        async fn peek_dead_letters(&self, _: usize) -> Result<Vec<(String, f64)>, QueueError> {
            Err(down())
        }
        async fn stats(&self) -> Result<crate::scheduler::QueueStats, QueueError> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn test_unqueued_task_leaves_no_trace() {
        let db = test_database().await;
        let submitter = Submitter::new(db.clone(), Arc::new(DownQueue), InFlightTasks::new());

        let result = submitter
            .submit(
                NewTask::new(TaskType::BuildImage, json!({"image": "a"}))
                    .immediate()
                    .in_trace("trace-down"),
            )
            .await;

        assert!(matches!(result, Err(SubmitError::Queue(_))));
        assert!(db.get_trace("trace-down").await.unwrap().is_none());
        let rows = db
            .list_tasks(&crate::storage::TaskFilter::new().with_trace_id("trace-down"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Deleted);
    }

    #[tokio::test]
    async fn test_child_inherits_trace_and_level() {
        let (submitter, _, _, _) = setup().await;
        let parent = submitter
            .submit(
                NewTask::new(TaskType::InjectFault, json!({}))
                    .immediate()
                    .in_group("g"),
            )
            .await
            .unwrap();

        let child = submitter
            .submit(
                NewTask::new(TaskType::RunAlgorithm, json!({}))
                    .immediate()
                    .child_of(&parent.task_id),
            )
            .await
            .unwrap();

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.group_id.as_deref(), Some("g"));
        assert_eq!(child.level, 1);
        assert_eq!(child.parent_task_id.as_deref(), Some(parent.task_id.as_str()));

        let wrong_trace = submitter
            .submit(
                NewTask::new(TaskType::RunAlgorithm, json!({}))
                    .immediate()
                    .child_of(&parent.task_id)
                    .in_trace("elsewhere"),
            )
            .await;
        assert!(matches!(wrong_trace, Err(SubmitError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancel_removes_from_queues() {
        let (submitter, queue, db, _) = setup().await;
        let at = Utc::now().timestamp() + 60;
        let delayed = submitter
            .submit(NewTask::new(TaskType::Custom, json!({})).at(at))
            .await
            .unwrap();

        let outcome = submitter.cancel(&delayed.task_id).await.unwrap();
        assert_eq!(outcome.removed_from, vec![QueueName::Delayed]);
        assert!(!outcome.signalled);
        assert_eq!(queue.stats().await.unwrap().total(), 0);
        assert_eq!(queue.index_of(&delayed.task_id).await.unwrap(), None);

        let stored = db.get_task(&delayed.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Deleted);
        assert_eq!(stored.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_signals_running_task() {
        let (submitter, _, _, in_flight) = setup().await;
        let task = submitter
            .submit(NewTask::new(TaskType::Custom, json!({})).immediate())
            .await
            .unwrap();
        let rx = in_flight.register(&task.task_id);

        let outcome = submitter.cancel(&task.task_id).await.unwrap();
        assert!(outcome.signalled);
        assert_eq!(outcome.removed_from, vec![QueueName::Ready]);
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (submitter, _, _, _) = setup().await;
        let err = submitter.cancel("missing").await.unwrap_err();
        assert!(matches!(err, SubmitError::Storage(StorageError::NotFound(_))));
    }

    #[test]
    fn test_new_task_from_json() {
        let new: NewTask = serde_json::from_str(
            r#"{"type":"RunAlgorithm","immediate":true,"payload":{"algorithm":"alpha"}}"#,
        )
        .unwrap();
        assert_eq!(new.task_type, TaskType::RunAlgorithm);
        assert!(new.immediate);
        assert!(new.validate().is_ok());
    }
}
