//! Pipeline completion over a trace's event stream.
//!
//! The processor folds events in stream order and answers one question: has
//! the pipeline of this trace finished for the expected set of algorithms?
//! Build-only traces end on `ImageBuildSucceed`; any error status ends the
//! trace; otherwise completion hinges on the detector outcome and on how many
//! of the expected algorithms have reported.

use std::collections::HashSet;

use tracing::debug;

use super::types::{EventError, EventPayload, StreamEntry, StreamId, TaskStatusKind, TraceEvent};
use crate::scheduler::task::TaskType;

/// Default name of the detector algorithm.
pub const DEFAULT_DETECTOR_ALGORITHM: &str = "detector";

/// What applying one entry did to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event was folded into the state.
    Processed,
    /// The entry was already seen (id not greater than the last one).
    Duplicate,
    /// The event kind is outside the closed set.
    Ignored,
}

/// Stateful reducer deciding pipeline completion.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    expected_algorithms: HashSet<String>,
    detector_algorithm: String,
    has_issues: bool,
    is_completed: bool,
    detector_task_id: Option<String>,
    /// Task ids of counted algorithm runs; a retried run counts once.
    finished_runs: HashSet<String>,
    finished_count: usize,
    last_id: Option<StreamId>,
}

impl StreamProcessor {
    pub fn new<I, S>(expected_algorithms: I, detector_algorithm: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected_algorithms: expected_algorithms.into_iter().map(Into::into).collect(),
            detector_algorithm: detector_algorithm.into(),
            has_issues: false,
            is_completed: false,
            detector_task_id: None,
            finished_runs: HashSet::new(),
            finished_count: 0,
            last_id: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    pub fn has_issues(&self) -> bool {
        self.has_issues
    }

    pub fn finished_count(&self) -> usize {
        self.finished_count
    }

    pub fn detector_task_id(&self) -> Option<&str> {
        self.detector_task_id.as_deref()
    }

    /// Id of the last entry applied, if any.
    pub fn last_id(&self) -> Option<StreamId> {
        self.last_id
    }

    /// Decodes and applies a raw stream entry.
    ///
    /// Entries at or below the last applied id are skipped, unknown event
    /// kinds are ignored, and payloads that do not fit their kind are errors.
    pub fn apply_entry(&mut self, entry: &StreamEntry) -> Result<Applied, EventError> {
        if self.last_id.is_some_and(|last| entry.id <= last) {
            return Ok(Applied::Duplicate);
        }

        let event = match entry.decode() {
            Ok(event) => event,
            Err(EventError::UnknownEvent(name)) => {
                debug!(id = %entry.id, event = %name, "Ignoring unknown event kind");
                self.last_id = Some(entry.id);
                return Ok(Applied::Ignored);
            }
            Err(e) => return Err(e),
        };

        self.last_id = Some(entry.id);
        self.apply(&event);
        Ok(Applied::Processed)
    }

    /// Applies a decoded event. Completion never retracts once reached.
    pub fn apply(&mut self, event: &TraceEvent) {
        match &event.payload {
            EventPayload::ImageBuildSucceed(_) => {
                self.is_completed = true;
            }
            EventPayload::DatapackNoAnomaly(_) | EventPayload::DatapackNoDetectorData(_) => {
                self.detector_task_id = Some(event.task_id.clone());
                self.has_issues = false;
            }
            EventPayload::DatapackResultCollection(_) => {
                self.detector_task_id = Some(event.task_id.clone());
                self.has_issues = true;
            }
            EventPayload::AlgoRunSucceed(info) | EventPayload::AlgoRunFailed(info) => {
                let name = &info.algorithm.name;
                if *name == self.detector_algorithm {
                    return;
                }
                let counts = self.expected_algorithms.is_empty()
                    || self.expected_algorithms.contains(name);
                if counts && self.finished_runs.insert(event.task_id.clone()) {
                    self.finished_count += 1;
                }
            }
            EventPayload::TaskStatusUpdate(status) => match status.status {
                TaskStatusKind::Error => {
                    self.is_completed = true;
                }
                TaskStatusKind::Completed if event.task_type == TaskType::CollectResult => {
                    let done = if self.detector_task_id.as_deref() == Some(event.task_id.as_str())
                    {
                        !self.has_issues || self.expected_algorithms.is_empty()
                    } else {
                        self.expected_algorithms.is_empty()
                            || self.finished_count == self.expected_algorithms.len()
                    };
                    self.is_completed |= done;
                }
                _ => {}
            },
            EventPayload::ImageBuildFailed(_)
            | EventPayload::FaultInjected(_)
            | EventPayload::FaultInjectFailed(_) => {}
        }
    }
}
