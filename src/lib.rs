//! rcabench-dispatch: Redis-backed task dispatch for RCA benchmarking.
//!
//! This library schedules benchmark tasks (image builds, fault injections,
//! algorithm runs, result collection) on Redis queues, executes them with a
//! bounded worker pool, and records their progress as per-trace event
//! streams.

// Core modules
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, DispatcherConfig};
pub use error::{Classify, ErrorKind};
pub use events::{EventError, EventPayload, EventPublisher, TraceWatcher};
pub use scheduler::{
    Dispatcher, DispatcherError, HandlerError, NewTask, QueueError, SubmitError, Submitter,
    TaskType,
};
pub use storage::{Database, StorageError};
