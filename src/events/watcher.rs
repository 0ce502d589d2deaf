//! Waiting for a trace to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::processor::StreamProcessor;
use super::store::EventStore;
use super::types::{EventError, StreamId};
use crate::storage::Database;

/// Result of watching a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub completed: bool,
    pub has_issues: bool,
    pub finished_count: usize,
    pub events_seen: usize,
    pub last_id: Option<StreamId>,
}

/// Replays a trace stream into a [`StreamProcessor`] until it completes.
pub struct TraceWatcher {
    store: Arc<dyn EventStore>,
    db: Option<Database>,
    detector_algorithm: String,
    batch_size: usize,
    poll_block: Duration,
}

impl TraceWatcher {
    pub fn new(store: Arc<dyn EventStore>, detector_algorithm: impl Into<String>) -> Self {
        Self {
            store,
            db: None,
            detector_algorithm: detector_algorithm.into(),
            batch_size: 100,
            poll_block: Duration::from_secs(1),
        }
    }

    /// Marks the trace completed in the database when the processor completes.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_poll_block(mut self, block: Duration) -> Self {
        self.poll_block = block;
        self
    }

    /// Reads the trace from the beginning until the pipeline completes or
    /// `timeout` elapses. Entries whose payload does not match their kind
    /// are logged and skipped.
    pub async fn wait_for_completion(
        &self,
        trace_id: &str,
        expected_algorithms: &[String],
        timeout: Duration,
    ) -> Result<WatchOutcome, EventError> {
        let deadline = Instant::now() + timeout;
        let mut processor =
            StreamProcessor::new(expected_algorithms.iter().cloned(), self.detector_algorithm.clone());
        let mut cursor = StreamId::ZERO;
        let mut events_seen = 0;

        while !processor.is_completed() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let entries = self
                .store
                .read(trace_id, cursor, self.batch_size, remaining.min(self.poll_block))
                .await?;

            for entry in &entries {
                cursor = entry.id;
                events_seen += 1;
                if let Err(e) = processor.apply_entry(entry) {
                    warn!(trace_id, id = %entry.id, error = %e, "Skipping malformed event");
                }
                if processor.is_completed() {
                    break;
                }
            }
        }

        if processor.is_completed() {
            info!(trace_id, events = events_seen, "Trace completed");
            if let Some(db) = &self.db {
                if let Err(e) = db.mark_trace_completed(trace_id).await {
                    warn!(trace_id, error = %e, "Failed to mark trace completed");
                }
            }
        }

        Ok(WatchOutcome {
            completed: processor.is_completed(),
            has_issues: processor.has_issues(),
            finished_count: processor.finished_count(),
            events_seen,
            last_id: processor.last_id(),
        })
    }
}
