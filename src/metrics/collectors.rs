//! Metric recording helpers.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites do not
//! have to care whether `init_metrics()` ran. Every method is a no-op until
//! it has.

use super::prometheus::{
    DEAD_LETTERED_TOTAL, GATE_SATURATED, PROMOTED_TOTAL, QUEUE_DEPTH, TASKS_IN_FLIGHT,
    TASKS_TOTAL, TASK_DURATION,
};
use crate::scheduler::queue::{QueueName, QueueStats};
use crate::scheduler::task::TaskType;

/// Final outcome of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// Dropped because the task was deleted before it ran.
    Skipped,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Skipped => "skipped",
        }
    }
}

/// Why an entry went to the dead-letter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Handler failed; another attempt is scheduled.
    Retry,
    /// Handler failed and the retry schedule is used up.
    Exhausted,
    /// Handler failed with an error retrying cannot fix.
    Permanent,
    /// The queue entry could not be decoded.
    Poison,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Retry => "retry",
            DeadLetterReason::Exhausted => "exhausted",
            DeadLetterReason::Permanent => "permanent",
            DeadLetterReason::Poison => "poison",
        }
    }
}

/// Records dispatcher metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task attempt.
    pub fn record_task(&self, task_type: TaskType, outcome: TaskOutcome, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[task_type.as_str(), outcome.as_str()])
                .inc();
        }

        if outcome != TaskOutcome::Skipped {
            if let Some(task_duration) = TASK_DURATION.get() {
                task_duration
                    .with_label_values(&[task_type.as_str()])
                    .observe(duration_secs);
            }
        }

        tracing::trace!(
            task_type = %task_type,
            outcome = outcome.as_str(),
            duration_secs,
            "Recorded task metric"
        );
    }

    pub fn record_dead_letter(&self, reason: DeadLetterReason) {
        if let Some(dead) = DEAD_LETTERED_TOTAL.get() {
            dead.with_label_values(&[reason.as_str()]).inc();
        }
    }

    pub fn record_promoted(&self, count: usize) {
        if let Some(promoted) = PROMOTED_TOTAL.get() {
            promoted.inc_by(count as f64);
        }
    }

    pub fn record_gate_saturated(&self) {
        if let Some(saturated) = GATE_SATURATED.get() {
            saturated.inc();
        }
    }

    /// Update the depth gauges from a stats snapshot.
    pub fn update_queue_depths(&self, stats: &QueueStats) {
        let Some(queue_depth) = QUEUE_DEPTH.get() else {
            return;
        };
        for (queue, depth) in [
            (QueueName::Delayed, stats.delayed),
            (QueueName::Ready, stats.ready),
            (QueueName::DeadLetter, stats.dead),
        ] {
            queue_depth
                .with_label_values(&[queue.key()])
                .set(depth as f64);
        }
    }

    pub fn inc_in_flight(&self) {
        if let Some(in_flight) = TASKS_IN_FLIGHT.get() {
            in_flight.inc();
        }
    }

    pub fn dec_in_flight(&self) {
        if let Some(in_flight) = TASKS_IN_FLIGHT.get() {
            in_flight.dec();
        }
    }
}
