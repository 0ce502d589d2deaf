//! Per-trace event streams.
//!
//! Handlers publish typed [`TraceEvent`]s through an [`EventPublisher`],
//! which appends them to the trace's stream and folds them into the trace
//! summary. Consumers replay a stream through a [`StreamProcessor`] to decide
//! whether the pipeline of a trace has completed.

pub mod processor;
pub mod publisher;
pub mod store;
pub mod types;
pub mod watcher;

pub use processor::{Applied, StreamProcessor, DEFAULT_DETECTOR_ALGORITHM};
pub use publisher::EventPublisher;
pub use store::{stream_key, EventStore, MemoryEventStore, RedisEventStore, DEFAULT_STREAM_MAXLEN};
pub use types::{
    AlgorithmRef, AlgorithmRunInfo, CallerInfo, DatapackInfo, EventError, EventName, EventPayload,
    FailureInfo, ImageBuildInfo, InjectionInfo, StreamEntry, StreamId, TaskStatusInfo,
    TaskStatusKind, TraceEvent,
};
pub use watcher::{TraceWatcher, WatchOutcome};
