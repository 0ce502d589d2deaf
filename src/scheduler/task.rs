//! Task definitions for the dispatcher.
//!
//! This module defines the core task types shared by the queue store, the
//! dispatcher and the task repository:
//!
//! - `TaskType`: the closed set of work item kinds
//! - `TaskState` / `TaskStatus`: lifecycle and soft-delete flags
//! - `QueuedTask`: the JSON payload placed in Redis queues
//! - `Task`: the durable task record
//! - `RetrySchedule`: dead-letter backoff schedule

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default dead-letter backoff schedule in seconds.
pub const DEFAULT_RETRY_SCHEDULE: [u64; 5] = [5, 30, 300, 1800, 7200];

/// Kind of work carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Build a container image for a benchmark or algorithm.
    BuildImage,
    /// Inject a fault into the target system.
    InjectFault,
    /// Execute an algorithm against a datapack.
    RunAlgorithm,
    /// Collect and persist the output of an algorithm execution.
    CollectResult,
    /// Any user-registered work item.
    Custom,
}

impl TaskType {
    /// All task types, in pipeline order.
    pub const ALL: [TaskType; 5] = [
        TaskType::BuildImage,
        TaskType::InjectFault,
        TaskType::RunAlgorithm,
        TaskType::CollectResult,
        TaskType::Custom,
    ];

    /// Returns the wire name of this task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BuildImage => "BuildImage",
            TaskType::InjectFault => "InjectFault",
            TaskType::RunAlgorithm => "RunAlgorithm",
            TaskType::CollectResult => "CollectResult",
            TaskType::Custom => "Custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{}'", s))
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Registered but not yet enqueued.
    Pending,
    /// Waiting in the delayed queue.
    Queued,
    /// Waiting in the ready queue.
    Ready,
    /// Picked up by a worker.
    Running,
    /// Handler completed successfully.
    Succeeded,
    /// Handler returned an error.
    Failed,
    /// Cancelled by the user or by its deadline.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Ready,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Queued => "Queued",
            TaskState::Ready => "Ready",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Queued => 1,
            TaskState::Ready => 2,
            TaskState::Running => 3,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled => 4,
        }
    }

    /// Returns true for states no worker will move the task out of on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Cancelled)
    }

    /// Checks whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// The only backward edges are `Running -> Ready` and `Failed -> Ready`,
    /// both taken when a task is retried.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (TaskState::Succeeded, _) | (TaskState::Cancelled, _) => false,
            (TaskState::Running, TaskState::Ready) | (TaskState::Failed, TaskState::Ready) => true,
            (TaskState::Failed, TaskState::Running) => true,
            (TaskState::Failed, _) => next == TaskState::Cancelled,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{}'", s))
    }
}

/// Soft-delete flag of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Enabled,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Enabled => "Enabled",
            TaskStatus::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Enabled" => Ok(TaskStatus::Enabled),
            "Deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A task as it travels through the Redis queues.
///
/// Serialized as UTF-8 JSON. Only `task_id`, `type` and `trace_id` are
/// required on the wire; everything else has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Unique task identifier.
    pub task_id: String,
    /// Kind of work.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Trace this task belongs to.
    pub trace_id: String,
    /// Batch correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Parent task, if this task was spawned by another one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Depth in the task tree (0 for roots).
    #[serde(default)]
    pub level: u32,
    /// Scheduled execution time in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<i64>,
    /// Number of times this task has been dead-lettered and replayed.
    #[serde(default)]
    pub retry_count: u32,
    /// Absolute deadline in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    /// Handler-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueuedTask {
    /// Serializes this task to its queue representation.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a queue entry.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Extracts only the task id from a raw queue entry.
    ///
    /// Used where a full decode would reject entries that still need to be
    /// located, e.g. removal by id.
    pub fn peek_task_id(raw: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct IdOnly {
            task_id: String,
        }
        serde_json::from_str::<IdOnly>(raw).ok().map(|v| v.task_id)
    }

    /// Returns a copy with the retry counter advanced by one.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    /// Decodes the handler payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Durable task record owned by the task repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub task_type: TaskType,
    pub trace_id: String,
    pub group_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub level: u32,
    /// Insertion order within the trace.
    pub sequence: i64,
    pub payload: serde_json::Value,
    pub immediate: bool,
    pub execute_time: Option<i64>,
    pub deadline: Option<i64>,
    pub state: TaskState,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Builds the queue payload for this record.
    pub fn to_queued(&self, retry_count: u32) -> QueuedTask {
        QueuedTask {
            task_id: self.task_id.clone(),
            task_type: self.task_type,
            trace_id: self.trace_id.clone(),
            group_id: self.group_id.clone(),
            parent_task_id: self.parent_task_id.clone(),
            level: self.level,
            execute_time: self.execute_time,
            retry_count,
            deadline: self.deadline,
            payload: self.payload.clone(),
        }
    }
}

/// Backoff schedule applied when a handler fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_RETRY_SCHEDULE)
    }
}

impl RetrySchedule {
    pub fn from_secs(secs: &[u64]) -> Self {
        Self {
            delays: secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Parses a comma-separated list of seconds, e.g. `5,30,300`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut secs = Vec::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let v: u64 = part
                .parse()
                .map_err(|_| format!("'{}' is not a number of seconds", part))?;
            secs.push(v);
        }
        Ok(Self::from_secs(&secs))
    }

    /// Returns the backoff for a task that has already been retried
    /// `retry_count` times, or `None` once the schedule is exhausted.
    pub fn backoff_for(&self, retry_count: u32) -> Option<Duration> {
        self.delays.get(retry_count as usize).copied()
    }

    /// Number of retries the schedule allows.
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> QueuedTask {
        QueuedTask {
            task_id: "t-1".to_string(),
            task_type: TaskType::RunAlgorithm,
            trace_id: "trace-1".to_string(),
            group_id: Some("group-1".to_string()),
            parent_task_id: None,
            level: 0,
            execute_time: Some(1_700_000_000),
            retry_count: 0,
            deadline: None,
            payload: serde_json::json!({"algorithm": "alpha"}),
        }
    }

    #[test]
    fn test_decode_minimal_payload_uses_defaults() {
        let raw = r#"{"task_id":"a","type":"CollectResult","trace_id":"t"}"#;
        let task = QueuedTask::decode(raw).expect("minimal payload should decode");

        assert_eq!(task.task_type, TaskType::CollectResult);
        assert_eq!(task.level, 0);
        assert_eq!(task.retry_count, 0);
        assert!(task.group_id.is_none());
        assert!(task.payload.is_null());
    }

    #[test]
    fn test_decode_rejects_missing_trace() {
        let raw = r#"{"task_id":"a","type":"CollectResult"}"#;
        assert!(QueuedTask::decode(raw).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let raw = r#"{"task_id":"a","type":"Reboot","trace_id":"t"}"#;
        assert!(QueuedTask::decode(raw).is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let encoded = sample_task().encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");

        assert_eq!(value["type"], "RunAlgorithm");
        assert_eq!(value["trace_id"], "trace-1");
        assert_eq!(value["execute_time"], 1_700_000_000);
        assert!(value.get("parent_task_id").is_none());
    }

    #[test]
    fn test_peek_task_id_ignores_other_fields() {
        let raw = r#"{"task_id":"abc","type":"Nope"}"#;
        assert_eq!(QueuedTask::peek_task_id(raw).as_deref(), Some("abc"));
        assert_eq!(QueuedTask::peek_task_id("not json"), None);
    }

    #[test]
    fn test_next_attempt_increments_retry() {
        let task = sample_task();
        let next = task.next_attempt().next_attempt();
        assert_eq!(next.retry_count, 2);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_state_transitions() {
        use TaskState::*;

        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Ready));
        assert!(Failed.can_transition_to(Ready));
        assert!(Running.can_transition_to(Running));

        assert!(!Running.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Ready));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
    }

    #[test]
    fn test_retry_schedule_default() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.len(), 5);
        assert_eq!(schedule.backoff_for(0), Some(Duration::from_secs(5)));
        assert_eq!(schedule.backoff_for(4), Some(Duration::from_secs(7200)));
        assert_eq!(schedule.backoff_for(5), None);
    }

    #[test]
    fn test_retry_schedule_parse() {
        let schedule = RetrySchedule::parse("1, 2,3").expect("parse");
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.backoff_for(1), Some(Duration::from_secs(2)));

        assert!(RetrySchedule::parse("1,x").is_err());
        assert!(RetrySchedule::parse("").expect("empty").is_empty());
    }

    #[test]
    fn test_task_type_round_trip_names() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>(), Ok(t));
        }
        assert!("build".parse::<TaskType>().is_err());
    }
}
