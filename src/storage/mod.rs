//! SQLite task repository.
//!
//! This module holds the durable side of the dispatcher: task records, the
//! datapack graph (fault injections, execution results and their rows) and
//! per-trace summaries.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rcabench_dispatch::storage::{Database, TaskFilter};
//!
//! let db = Database::connect("sqlite://rcabench.db").await?;
//! db.run_migrations().await?;
//!
//! let ready = db
//!     .list_tasks(&TaskFilter::new().with_state(TaskState::Ready).with_limit(10))
//!     .await?;
//!
//! let stats = db.cascade_delete_fault_injection(42).await?;
//! ```

pub mod database;
pub mod injections;
pub mod migrations;
pub mod schema;
pub mod tasks;
pub mod traces;

pub use database::{Database, StorageError};
pub use injections::{
    canonical_engine_config, CascadeStats, DatapackState, DatasetVersion, DetectorResult,
    ExecutionResult, ExecutionStatus, FaultInjection, GranularityResult, NewFaultInjection,
    RecordStatus, INVALID_LABEL,
};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use tasks::{TaskFilter, TaskStats, TaskWithChildren};
pub use traces::{Trace, TraceDetail, TraceState};
