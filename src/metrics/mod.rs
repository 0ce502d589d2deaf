//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use rcabench_dispatch::metrics::{init_metrics, export_metrics, MetricsCollector, TaskOutcome};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_task(TaskType::BuildImage, TaskOutcome::Succeeded, 12.0);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{DeadLetterReason, MetricsCollector, TaskOutcome};
pub use self::prometheus::{
    export_metrics, init_metrics, DEAD_LETTERED_TOTAL, GATE_SATURATED, PROMOTED_TOTAL,
    QUEUE_DEPTH, REGISTRY, TASKS_IN_FLIGHT, TASKS_TOTAL, TASK_DURATION,
};
