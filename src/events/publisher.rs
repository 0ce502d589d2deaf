//! Event publishing.
//!
//! Publishing appends to the trace stream first; the stream is the source of
//! truth. The trace summary row is updated afterwards and failures there are
//! only logged, since it can always be rebuilt from the stream.

use std::sync::Arc;

use tracing::{debug, warn};

use super::store::EventStore;
use super::types::{CallerInfo, EventError, EventPayload, StreamId, TraceEvent};
use crate::scheduler::task::QueuedTask;
use crate::storage::Database;

/// Writes task events to the stream store and the trace summary.
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn EventStore>,
    db: Database,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn EventStore>, db: Database) -> Self {
        Self { store, db }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Publishes an event about `task` and returns the stream id it got.
    pub async fn publish(
        &self,
        task: &QueuedTask,
        payload: EventPayload,
        caller: CallerInfo,
    ) -> Result<StreamId, EventError> {
        let event = TraceEvent::new(&task.task_id, task.task_type, payload).with_caller(caller);
        let id = self.store.publish(&task.trace_id, &event).await?;

        debug!(
            trace_id = %task.trace_id,
            task_id = %task.task_id,
            event = %event.name(),
            id = %id,
            "Published event"
        );

        if let Err(e) = self
            .db
            .record_trace_event(
                &task.trace_id,
                task.group_id.as_deref(),
                task.task_type,
                &event.payload,
                id.timestamp(),
            )
            .await
        {
            warn!(trace_id = %task.trace_id, error = %e, "Failed to update trace summary");
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::store::MemoryEventStore;
    use crate::events::types::{ImageBuildInfo, TaskStatusKind};
    use crate::scheduler::task::TaskType;
    use crate::storage::database::test_database;
    use crate::storage::TraceState;
    use std::time::Duration;

    fn task(task_type: TaskType) -> QueuedTask {
        QueuedTask {
            task_id: "task-1".to_string(),
            task_type,
            trace_id: "trace-1".to_string(),
            group_id: Some("group-1".to_string()),
            parent_task_id: None,
            level: 0,
            execute_time: None,
            retry_count: 0,
            deadline: None,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_publish_appends_and_updates_trace() {
        let store = Arc::new(MemoryEventStore::default());
        let db = test_database().await;
        let publisher = EventPublisher::new(store.clone(), db.clone());

        publisher
            .publish(
                &task(TaskType::BuildImage),
                EventPayload::status(TaskStatusKind::Running, None),
                crate::caller_info!(),
            )
            .await
            .unwrap();
        let id = publisher
            .publish(
                &task(TaskType::BuildImage),
                EventPayload::ImageBuildSucceed(ImageBuildInfo {
                    image: "img".to_string(),
                    tag: "v1".to_string(),
                    duration_ms: 3,
                }),
                crate::caller_info!(),
            )
            .await
            .unwrap();

        let entries = store
            .read("trace-1", StreamId::ZERO, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].id, id);
        assert!(entries[1].file.ends_with("publisher.rs"));

        let trace = db.get_trace("trace-1").await.unwrap().unwrap().trace;
        assert_eq!(trace.state, TraceState::Completed);
        assert_eq!(trace.group_id.as_deref(), Some("group-1"));
    }

    #[tokio::test]
    async fn test_trace_failure_does_not_fail_publish() {
        let store = Arc::new(MemoryEventStore::default());
        let db = test_database().await;
        db.close().await;
        let publisher = EventPublisher::new(store.clone(), db);

        publisher
            .publish(
                &task(TaskType::Custom),
                EventPayload::status(TaskStatusKind::Completed, None),
                CallerInfo::default(),
            )
            .await
            .unwrap();
        assert_eq!(store.len("trace-1").await.unwrap(), 1);
    }
}
