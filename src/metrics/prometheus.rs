//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the dispatcher and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all dispatcher metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished task attempts, labeled by task type and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler run time in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Entries per queue, labeled by queue key.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Tasks currently running in this process.
pub static TASKS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Times a worker found the concurrency gate full.
pub static GATE_SATURATED: OnceLock<Counter> = OnceLock::new();

/// Delayed tasks promoted to the ready list.
pub static PROMOTED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Entries written to the dead-letter set, labeled by reason.
pub static DEAD_LETTERED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; the first registry wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("rcabench_tasks_total", "Total number of finished task attempts"),
        &["type", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rcabench_task_duration_seconds",
            "Handler run time in seconds",
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["type"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("rcabench_queue_depth", "Number of entries per queue"),
        &["queue"],
    )?;

    let tasks_in_flight = Gauge::new(
        "rcabench_tasks_in_flight",
        "Number of tasks currently being handled",
    )?;

    let gate_saturated = Counter::new(
        "rcabench_gate_saturated_total",
        "Times the concurrency gate was full",
    )?;

    let promoted_total = Counter::new(
        "rcabench_promoted_total",
        "Delayed tasks promoted to the ready queue",
    )?;

    let dead_lettered_total = CounterVec::new(
        Opts::new(
            "rcabench_dead_lettered_total",
            "Entries written to the dead-letter queue",
        ),
        &["reason"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_flight.clone()))?;
    registry.register(Box::new(gate_saturated.clone()))?;
    registry.register(Box::new(promoted_total.clone()))?;
    registry.register(Box::new(dead_lettered_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_FLIGHT.set(tasks_in_flight);
    let _ = GATE_SATURATED.set(gate_saturated);
    let _ = PROMOTED_TOTAL.set(promoted_total);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is missing or
/// encoding breaks.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
