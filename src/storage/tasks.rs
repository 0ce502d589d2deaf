//! Task records.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use super::database::{parse_column, Database, StorageError};
use super::injections::{DatasetVersion, ExecutionResult, FaultInjection};
use crate::scheduler::task::{Task, TaskState, TaskStatus, TaskType};

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub trace_id: Option<String>,
    pub group_id: Option<String>,
    pub task_type: Option<TaskType>,
    pub state: Option<TaskState>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Task counts by state, over enabled tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: u64,
    pub by_state: HashMap<TaskState, u64>,
}

impl TaskStats {
    pub fn count(&self, state: TaskState) -> u64 {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

/// A task with its neighbourhood preloaded.
#[derive(Debug, Clone)]
pub struct TaskWithChildren {
    pub task: Task,
    pub parent: Option<Task>,
    pub children: Vec<Task>,
    /// The datapack this task created or ran against.
    pub fault_injection: Option<FaultInjection>,
    pub execution_results: Vec<ExecutionResult>,
    pub dataset_versions: Vec<DatasetVersion>,
}

pub(crate) fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    let task_type: String = row.try_get("type")?;
    let state: String = row.try_get("state")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let level: i64 = row.try_get("level")?;

    Ok(Task {
        task_id: row.try_get("id")?,
        task_type: parse_column("type", &task_type)?,
        trace_id: row.try_get("trace_id")?,
        group_id: row.try_get("group_id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        level: u32::try_from(level)
            .map_err(|_| StorageError::InvalidData(format!("level: {}", level)))?,
        sequence: row.try_get("sequence")?,
        payload: serde_json::from_str(&payload)?,
        immediate: row.try_get::<i64, _>("immediate")? != 0,
        execute_time: row.try_get("execute_time")?,
        deadline: row.try_get("deadline")?,
        state: parse_column("state", &state)?,
        status: parse_column("status", &status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Inserts a task, or refreshes `execute_time`, `state` and `updated_at`
    /// when the id already exists. Returns the stored record.
    ///
    /// New tasks get the next `sequence` within their trace.
    pub async fn upsert_task(&self, task: &Task) -> Result<Task, StorageError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, type, trace_id, group_id, parent_task_id, level, sequence,
                payload, immediate, execute_time, deadline, state, status,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                (SELECT COALESCE(MAX(sequence) + 1, 0) FROM tasks WHERE trace_id = ?3),
                ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
            )
            ON CONFLICT(id) DO UPDATE SET
                execute_time = excluded.execute_time,
                state = excluded.state,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&task.task_id)
        .bind(task.task_type.as_str())
        .bind(&task.trace_id)
        .bind(&task.group_id)
        .bind(&task.parent_task_id)
        .bind(task.level as i64)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(task.immediate as i64)
        .bind(task.execute_time)
        .bind(task.deadline)
        .bind(task.state.as_str())
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        task_from_row(&row)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Moves a task to `state` if the lifecycle allows it.
    ///
    /// Returns `false` (and leaves the row alone) for transitions that would
    /// go backwards, so replays of an old update are harmless.
    pub async fn set_task_state(
        &self,
        task_id: &str,
        state: TaskState,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as("SELECT state FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let current: TaskState = match current {
            Some((s,)) => parse_column("state", &s)?,
            None => return Err(StorageError::NotFound(format!("task {}", task_id))),
        };

        if !current.can_transition_to(state) {
            debug!(task_id, from = %current, to = %state, "Skipping non-monotonic state update");
            return Ok(false);
        }

        sqlx::query("UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }

    pub async fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    /// Loads a task with its parent, children and the artifacts attached to it.
    pub async fn get_task_with_children(
        &self,
        task_id: &str,
    ) -> Result<TaskWithChildren, StorageError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("task {}", task_id)))?;

        let parent = match &task.parent_task_id {
            Some(parent_id) => self.get_task(parent_id).await?,
            None => None,
        };

        let children = sqlx::query(
            "SELECT * FROM tasks WHERE parent_task_id = ?1 ORDER BY level ASC, sequence ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(task_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let (fault_injection, execution_results) = match task.task_type {
            TaskType::InjectFault => {
                let injection = self.get_fault_injection_by_task(task_id).await?;
                let results = match &injection {
                    Some(fi) => self.list_execution_results_for_datapack(fi.id).await?,
                    None => Vec::new(),
                };
                (injection, results)
            }
            TaskType::RunAlgorithm | TaskType::CollectResult => {
                let results = self.list_execution_results_for_task(task_id).await?;
                let injection = match results.first() {
                    Some(r) => self.get_fault_injection(r.datapack_id).await?,
                    None => None,
                };
                (injection, results)
            }
            TaskType::BuildImage | TaskType::Custom => (None, Vec::new()),
        };

        let dataset_versions = match &fault_injection {
            Some(fi) => self.list_dataset_versions_for_injection(fi.id).await?,
            None => Vec::new(),
        };

        Ok(TaskWithChildren {
            task,
            parent,
            children,
            fault_injection,
            execution_results,
            dataset_versions,
        })
    }

    /// Lists tasks matching the filter, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM tasks WHERE 1 = 1");

        if let Some(trace_id) = &filter.trace_id {
            qb.push(" AND trace_id = ").push_bind(trace_id.clone());
        }
        if let Some(group_id) = &filter.group_id {
            qb.push(" AND group_id = ").push_bind(group_id.clone());
        }
        if let Some(task_type) = filter.task_type {
            qb.push(" AND type = ").push_bind(task_type.as_str());
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }

        qb.push(" ORDER BY created_at DESC, sequence DESC");

        if filter.limit.is_some() || filter.offset.is_some() {
            qb.push(" LIMIT ").push_bind(filter.limit.unwrap_or(-1));
            if let Some(offset) = filter.offset {
                qb.push(" OFFSET ").push_bind(offset);
            }
        }

        qb.build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    /// Tasks of a trace ordered by (level, sequence).
    pub async fn list_trace_tasks(&self, trace_id: &str) -> Result<Vec<Task>, StorageError> {
        sqlx::query("SELECT * FROM tasks WHERE trace_id = ?1 ORDER BY level ASC, sequence ASC")
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    pub async fn task_stats(&self) -> Result<TaskStats, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM tasks WHERE status = 'Enabled' GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TaskStats::default();
        for (state, count) in rows {
            let state: TaskState = parse_column("state", &state)?;
            stats.by_state.insert(state, count as u64);
            stats.total += count as u64;
        }
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) fn sample_task(task_id: &str, trace_id: &str, task_type: TaskType) -> Task {
    let now = Utc::now();
    Task {
        task_id: task_id.to_string(),
        task_type,
        trace_id: trace_id.to_string(),
        group_id: Some("group-1".to_string()),
        parent_task_id: None,
        level: 0,
        sequence: 0,
        payload: serde_json::json!({"k": "v"}),
        immediate: true,
        execute_time: None,
        deadline: None,
        state: TaskState::Pending,
        status: TaskStatus::Enabled,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_database;
    use crate::storage::injections::NewFaultInjection;

    #[tokio::test]
    async fn test_upsert_inserts_then_updates_selected_fields() {
        let db = test_database().await;
        let mut task = sample_task("t1", "trace", TaskType::Custom);
        let stored = db.upsert_task(&task).await.unwrap();
        assert_eq!(stored.state, TaskState::Pending);
        assert_eq!(stored.payload, serde_json::json!({"k": "v"}));

        task.state = TaskState::Queued;
        task.execute_time = Some(42);
        task.payload = serde_json::json!({"changed": true});
        task.group_id = Some("other".to_string());
        let stored = db.upsert_task(&task).await.unwrap();

        assert_eq!(stored.state, TaskState::Queued);
        assert_eq!(stored.execute_time, Some(42));
        assert_eq!(stored.payload, serde_json::json!({"k": "v"}));
        assert_eq!(stored.group_id.as_deref(), Some("group-1"));
    }

    #[tokio::test]
    async fn test_sequence_increments_within_trace() {
        let db = test_database().await;
        let a = db.upsert_task(&sample_task("a", "t", TaskType::Custom)).await.unwrap();
        let b = db.upsert_task(&sample_task("b", "t", TaskType::Custom)).await.unwrap();
        let c = db.upsert_task(&sample_task("c", "other", TaskType::Custom)).await.unwrap();

        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(c.sequence, 0);

        let again = db.upsert_task(&sample_task("a", "t", TaskType::Custom)).await.unwrap();
        assert_eq!(again.sequence, 0);
    }

    #[tokio::test]
    async fn test_set_state_is_monotonic() {
        let db = test_database().await;
        db.upsert_task(&sample_task("t", "trace", TaskType::Custom)).await.unwrap();

        assert!(db.set_task_state("t", TaskState::Ready).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Running).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Running).await.unwrap());
        assert!(!db.set_task_state("t", TaskState::Pending).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Failed).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Ready).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Running).await.unwrap());
        assert!(db.set_task_state("t", TaskState::Succeeded).await.unwrap());
        assert!(!db.set_task_state("t", TaskState::Ready).await.unwrap());

        let task = db.get_task("t").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_set_state_unknown_task() {
        let db = test_database().await;
        let err = db.set_task_state("nope", TaskState::Ready).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_status_soft_deletes() {
        let db = test_database().await;
        db.upsert_task(&sample_task("t", "trace", TaskType::Custom)).await.unwrap();
        db.set_task_status("t", TaskStatus::Deleted).await.unwrap();
        db.set_task_status("t", TaskStatus::Deleted).await.unwrap();

        let task = db.get_task("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Deleted);
        assert!(db.set_task_status("missing", TaskStatus::Deleted).await.is_err());
    }

    #[tokio::test]
    async fn test_list_tasks_filters() {
        let db = test_database().await;
        db.upsert_task(&sample_task("a", "t1", TaskType::BuildImage)).await.unwrap();
        db.upsert_task(&sample_task("b", "t1", TaskType::RunAlgorithm)).await.unwrap();
        db.upsert_task(&sample_task("c", "t2", TaskType::RunAlgorithm)).await.unwrap();
        db.set_task_state("c", TaskState::Ready).await.unwrap();

        let t1 = db.list_tasks(&TaskFilter::new().with_trace_id("t1")).await.unwrap();
        assert_eq!(t1.len(), 2);

        let algos = db
            .list_tasks(&TaskFilter::new().with_type(TaskType::RunAlgorithm))
            .await
            .unwrap();
        assert_eq!(algos.len(), 2);

        let ready = db
            .list_tasks(&TaskFilter::new().with_state(TaskState::Ready))
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task_id, "c");

        let page = db
            .list_tasks(&TaskFilter::new().with_limit(1).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_task_stats_counts_enabled_only() {
        let db = test_database().await;
        for id in ["a", "b", "c"] {
            db.upsert_task(&sample_task(id, "t", TaskType::Custom)).await.unwrap();
        }
        db.set_task_state("a", TaskState::Ready).await.unwrap();
        db.set_task_status("c", TaskStatus::Deleted).await.unwrap();

        let stats = db.task_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(TaskState::Ready), 1);
        assert_eq!(stats.count(TaskState::Pending), 1);
    }

    #[tokio::test]
    async fn test_get_with_children_preloads_injection() {
        let db = test_database().await;
        let root = sample_task("inject", "t", TaskType::InjectFault);
        db.upsert_task(&root).await.unwrap();

        let mut child = sample_task("algo", "t", TaskType::RunAlgorithm);
        child.parent_task_id = Some("inject".to_string());
        child.level = 1;
        db.upsert_task(&child).await.unwrap();

        let fi = db
            .create_fault_injection(&NewFaultInjection::new("fi-1", "{\"cpu\":1}").with_task("inject"))
            .await
            .unwrap();
        db.create_execution_result(Some("algo"), "alpha", fi.id).await.unwrap();

        let loaded = db.get_task_with_children("inject").await.unwrap();
        assert!(loaded.parent.is_none());
        assert_eq!(loaded.children.len(), 1);
        assert_eq!(loaded.fault_injection.as_ref().map(|f| f.id), Some(fi.id));
        assert_eq!(loaded.execution_results.len(), 1);

        let loaded = db.get_task_with_children("algo").await.unwrap();
        assert_eq!(loaded.parent.map(|p| p.task_id).as_deref(), Some("inject"));
        assert_eq!(loaded.fault_injection.map(|f| f.id), Some(fi.id));
    }
}
