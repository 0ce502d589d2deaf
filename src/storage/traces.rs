//! Trace rows derived from published events.
//!
//! A trace row is never the authority for task data; it is a summary that
//! is upserted on every event. Only `last_event`, `end_time`, `state` and
//! `updated_at` change after the first insert.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::database::{parse_column, Database, StorageError};
use crate::events::{EventName, EventPayload};
use crate::scheduler::task::{Task, TaskStatus, TaskType};

/// Summary state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TraceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceState::Pending => "Pending",
            TraceState::Running => "Running",
            TraceState::Completed => "Completed",
            TraceState::Failed => "Failed",
        }
    }

    /// State implied by one event of a trace that started with `first_task_type`.
    pub fn from_event(first_task_type: TaskType, payload: &EventPayload) -> Self {
        if payload.is_failure() {
            return TraceState::Failed;
        }
        match payload {
            EventPayload::ImageBuildSucceed(_) if first_task_type == TaskType::BuildImage => {
                TraceState::Completed
            }
            _ => TraceState::Running,
        }
    }
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TraceState::Pending),
            "Running" => Ok(TraceState::Running),
            "Completed" => Ok(TraceState::Completed),
            "Failed" => Ok(TraceState::Failed),
            other => Err(format!("unknown trace state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub trace_id: String,
    pub group_id: Option<String>,
    pub first_task_type: TaskType,
    pub last_event: Option<EventName>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: TraceState,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

/// A trace with its tasks ordered by (level, sequence).
#[derive(Debug, Clone)]
pub struct TraceDetail {
    pub trace: Trace,
    pub tasks: Vec<Task>,
}

fn trace_from_row(row: &SqliteRow) -> Result<Trace, StorageError> {
    let first_task_type: String = row.try_get("first_task_type")?;
    let last_event: Option<String> = row.try_get("last_event")?;
    let state: String = row.try_get("state")?;
    let status: String = row.try_get("status")?;

    Ok(Trace {
        trace_id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        first_task_type: parse_column("first_task_type", &first_task_type)?,
        last_event: last_event
            .as_deref()
            .map(|e| parse_column("last_event", e))
            .transpose()?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        state: parse_column("state", &state)?,
        status: parse_column("status", &status)?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Creates the trace row if missing. Existing rows are left untouched.
    pub async fn ensure_trace(
        &self,
        trace_id: &str,
        group_id: Option<&str>,
        first_task_type: TaskType,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO traces (id, group_id, first_task_type, start_time, state, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'Pending', 'Enabled', ?4, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(trace_id)
        .bind(group_id)
        .bind(first_task_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Folds one event into the trace row.
    ///
    /// `first_task_type` is only used when the row does not exist yet; the
    /// stored value decides how the event maps to a trace state. `Completed`
    /// is sticky; a later event never moves the trace out of it.
    pub async fn record_trace_event(
        &self,
        trace_id: &str,
        group_id: Option<&str>,
        first_task_type: TaskType,
        payload: &EventPayload,
        at: DateTime<Utc>,
    ) -> Result<Trace, StorageError> {
        let mut tx = self.pool.begin().await?;

        let stored: Option<(String,)> =
            sqlx::query_as("SELECT first_task_type FROM traces WHERE id = ?1")
                .bind(trace_id)
                .fetch_optional(&mut *tx)
                .await?;
        let first_task_type = match stored {
            Some((t,)) => parse_column("first_task_type", &t)?,
            None => first_task_type,
        };

        let state = TraceState::from_event(first_task_type, payload);
        let row = sqlx::query(
            r#"
            INSERT INTO traces (
                id, group_id, first_task_type, last_event, start_time, end_time,
                state, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 'Enabled', ?5, ?5)
            ON CONFLICT(id) DO UPDATE SET
                last_event = excluded.last_event,
                end_time = excluded.end_time,
                state = CASE WHEN traces.state = 'Completed' THEN traces.state ELSE excluded.state END,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(trace_id)
        .bind(group_id)
        .bind(first_task_type.as_str())
        .bind(payload.name().as_str())
        .bind(at)
        .bind(state.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let trace = trace_from_row(&row)?;

        tx.commit().await?;
        Ok(trace)
    }

    /// Marks a trace completed once its stream processor says so.
    pub async fn mark_trace_completed(&self, trace_id: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE traces SET state = 'Completed', end_time = ?1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("trace {}", trace_id)));
        }
        Ok(())
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceDetail>, StorageError> {
        let row = sqlx::query("SELECT * FROM traces WHERE id = ?1")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await?;

        let trace = match row {
            Some(row) => trace_from_row(&row)?,
            None => return Ok(None),
        };
        let tasks = self.list_trace_tasks(trace_id).await?;

        Ok(Some(TraceDetail { trace, tasks }))
    }

    /// Lists traces of a group, newest first.
    pub async fn list_traces(&self, group_id: &str) -> Result<Vec<Trace>, StorageError> {
        sqlx::query("SELECT * FROM traces WHERE group_id = ?1 ORDER BY start_time DESC")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(trace_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{FailureInfo, ImageBuildInfo, TaskStatusKind};
    use crate::storage::database::test_database;
    use crate::storage::tasks::sample_task;

    fn build_ok() -> EventPayload {
        EventPayload::ImageBuildSucceed(ImageBuildInfo {
            image: "img".to_string(),
            tag: "v1".to_string(),
            duration_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_record_event_upserts_selected_fields() {
        let db = test_database().await;
        let t0 = Utc::now();
        let running = EventPayload::status(TaskStatusKind::Running, None);

        let first = db
            .record_trace_event("tr", Some("g1"), TaskType::InjectFault, &running, t0)
            .await
            .unwrap();
        assert_eq!(first.state, TraceState::Running);
        assert_eq!(first.last_event, Some(EventName::TaskStatusUpdate));

        let later = t0 + chrono::Duration::seconds(5);
        let failed = EventPayload::FaultInjectFailed(FailureInfo {
            error: "no pods".to_string(),
        });
        let second = db
            .record_trace_event("tr", Some("g2"), TaskType::BuildImage, &failed, later)
            .await
            .unwrap();

        assert_eq!(second.state, TraceState::Failed);
        assert_eq!(second.last_event, Some(EventName::FaultInjectFailed));
        assert_eq!(second.group_id.as_deref(), Some("g1"));
        assert_eq!(second.first_task_type, TaskType::InjectFault);
        assert_eq!(second.start_time, first.start_time);
        assert_eq!(
            second.end_time.map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_build_only_trace_completes_and_stays_completed() {
        let db = test_database().await;
        let now = Utc::now();
        let trace = db
            .record_trace_event("b", None, TaskType::BuildImage, &build_ok(), now)
            .await
            .unwrap();
        assert_eq!(trace.state, TraceState::Completed);

        let running = EventPayload::status(TaskStatusKind::Completed, None);
        let trace = db
            .record_trace_event("b", None, TaskType::BuildImage, &running, now)
            .await
            .unwrap();
        assert_eq!(trace.state, TraceState::Completed);
    }

    #[test]
    fn test_build_success_in_longer_pipeline_is_running() {
        assert_eq!(
            TraceState::from_event(TaskType::InjectFault, &build_ok()),
            TraceState::Running
        );
    }

    #[tokio::test]
    async fn test_get_trace_orders_tasks_by_level_then_sequence() {
        let db = test_database().await;
        db.ensure_trace("tr", Some("g"), TaskType::InjectFault).await.unwrap();

        let mut deep = sample_task("deep", "tr", TaskType::CollectResult);
        deep.level = 2;
        db.upsert_task(&deep).await.unwrap();
        let mut mid_b = sample_task("mid-b", "tr", TaskType::RunAlgorithm);
        mid_b.level = 1;
        db.upsert_task(&mid_b).await.unwrap();
        db.upsert_task(&sample_task("root", "tr", TaskType::InjectFault)).await.unwrap();
        let mut mid_a = sample_task("mid-a", "tr", TaskType::RunAlgorithm);
        mid_a.level = 1;
        db.upsert_task(&mid_a).await.unwrap();

        let detail = db.get_trace("tr").await.unwrap().unwrap();
        let order: Vec<&str> = detail.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, vec!["root", "mid-b", "mid-a", "deep"]);
        assert_eq!(detail.trace.state, TraceState::Pending);
    }

    #[tokio::test]
    async fn test_mark_completed_and_list_by_group() {
        let db = test_database().await;
        db.ensure_trace("a", Some("g"), TaskType::InjectFault).await.unwrap();
        db.ensure_trace("b", Some("g"), TaskType::BuildImage).await.unwrap();
        db.ensure_trace("c", Some("other"), TaskType::BuildImage).await.unwrap();

        db.mark_trace_completed("a").await.unwrap();
        assert!(db.mark_trace_completed("missing").await.is_err());

        let traces = db.list_traces("g").await.unwrap();
        assert_eq!(traces.len(), 2);
        let a = traces.iter().find(|t| t.trace_id == "a").unwrap();
        assert_eq!(a.state, TraceState::Completed);
        assert!(db.get_trace("nope").await.unwrap().is_none());
    }
}
