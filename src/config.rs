//! Dispatcher configuration.
//!
//! Every setting has a default and can be overridden through the
//! environment; the CLI layers its own flags on top.

use std::time::Duration;

use thiserror::Error;

use crate::events::DEFAULT_DETECTOR_ALGORITHM;
use crate::events::DEFAULT_STREAM_MAXLEN;
use crate::scheduler::task::{RetrySchedule, TaskType};

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Default execution budget per task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTimeouts {
    pub build_image: Duration,
    pub inject_fault: Duration,
    pub run_algorithm: Duration,
    pub collect_result: Duration,
    pub custom: Duration,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            build_image: Duration::from_secs(1800),
            inject_fault: Duration::from_secs(600),
            run_algorithm: Duration::from_secs(3600),
            collect_result: Duration::from_secs(600),
            custom: Duration::from_secs(1800),
        }
    }
}

impl TaskTimeouts {
    pub fn for_type(&self, task_type: TaskType) -> Duration {
        match task_type {
            TaskType::BuildImage => self.build_image,
            TaskType::InjectFault => self.inject_fault,
            TaskType::RunAlgorithm => self.run_algorithm,
            TaskType::CollectResult => self.collect_result,
            TaskType::Custom => self.custom,
        }
    }

    fn slot_mut(&mut self, task_type: TaskType) -> &mut Duration {
        match task_type {
            TaskType::BuildImage => &mut self.build_image,
            TaskType::InjectFault => &mut self.inject_fault,
            TaskType::RunAlgorithm => &mut self.run_algorithm,
            TaskType::CollectResult => &mut self.collect_result,
            TaskType::Custom => &mut self.custom,
        }
    }

    /// Environment variable holding the timeout of `task_type`.
    pub fn env_key(task_type: TaskType) -> &'static str {
        match task_type {
            TaskType::BuildImage => "BUILD_IMAGE_TIMEOUT_SECS",
            TaskType::InjectFault => "INJECT_FAULT_TIMEOUT_SECS",
            TaskType::RunAlgorithm => "RUN_ALGORITHM_TIMEOUT_SECS",
            TaskType::CollectResult => "COLLECT_RESULT_TIMEOUT_SECS",
            TaskType::Custom => "CUSTOM_TIMEOUT_SECS",
        }
    }
}

/// Configuration for the dispatcher process.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    // Stores
    /// Redis connection URL.
    pub redis_url: String,
    /// Task repository URL.
    pub database_url: String,

    // Workers
    /// Number of worker loops.
    pub num_workers: usize,
    /// Ceiling of the global concurrency gate.
    pub max_concurrency: u64,
    /// How long a worker blocks on the ready list.
    pub take_timeout: Duration,
    /// Sleep after the gate reports saturation.
    pub gate_backoff: Duration,
    /// Interval of the delayed-queue promotion loop.
    pub promote_tick: Duration,
    /// Interval of the dead-letter replay loop.
    pub dlq_replay_tick: Duration,
    /// How long shutdown waits for workers to drain.
    pub shutdown_timeout: Duration,

    // Task policy
    pub retry_schedule: RetrySchedule,
    pub task_timeouts: TaskTimeouts,

    // Events
    /// Approximate maximum length of each trace stream.
    pub stream_maxlen: usize,
    /// Algorithm whose runs classify datapacks instead of counting as results.
    pub detector_algorithm: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "sqlite://rcabench.db".to_string(),
            num_workers: 4,
            max_concurrency: 20,
            take_timeout: Duration::from_millis(1000),
            gate_backoff: Duration::from_millis(100),
            promote_tick: Duration::from_millis(500),
            dlq_replay_tick: Duration::from_millis(10_000),
            shutdown_timeout: Duration::from_secs(60),
            retry_schedule: RetrySchedule::default(),
            task_timeouts: TaskTimeouts::default(),
            stream_maxlen: DEFAULT_STREAM_MAXLEN,
            detector_algorithm: DEFAULT_DETECTOR_ALGORITHM.to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// Reads:
    /// - `REDIS_URL`, `DATABASE_URL`
    /// - `NUM_WORKERS`, `MAX_CONCURRENCY`
    /// - `TAKE_TIMEOUT_MS`, `GATE_BACKOFF_MS`, `PROMOTE_TICK_MS`, `DLQ_REPLAY_TICK_MS`
    /// - `SHUTDOWN_TIMEOUT_SECS`
    /// - `RETRY_SCHEDULE` (comma-separated seconds)
    /// - `STREAM_MAXLEN`, `DETECTOR_ALGORITHM_NAME`
    /// - `<TYPE>_TIMEOUT_SECS` for every task type
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = lookup("DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = lookup("NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "NUM_WORKERS")?;
        }
        if let Some(val) = lookup("MAX_CONCURRENCY") {
            config.max_concurrency = parse_env_value(&val, "MAX_CONCURRENCY")?;
        }
        if let Some(val) = lookup("TAKE_TIMEOUT_MS") {
            config.take_timeout = Duration::from_millis(parse_env_value(&val, "TAKE_TIMEOUT_MS")?);
        }
        if let Some(val) = lookup("GATE_BACKOFF_MS") {
            config.gate_backoff = Duration::from_millis(parse_env_value(&val, "GATE_BACKOFF_MS")?);
        }
        if let Some(val) = lookup("PROMOTE_TICK_MS") {
            config.promote_tick = Duration::from_millis(parse_env_value(&val, "PROMOTE_TICK_MS")?);
        }
        if let Some(val) = lookup("DLQ_REPLAY_TICK_MS") {
            config.dlq_replay_tick =
                Duration::from_millis(parse_env_value(&val, "DLQ_REPLAY_TICK_MS")?);
        }
        if let Some(val) = lookup("SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout =
                Duration::from_secs(parse_env_value(&val, "SHUTDOWN_TIMEOUT_SECS")?);
        }

        if let Some(val) = lookup("RETRY_SCHEDULE") {
            config.retry_schedule =
                RetrySchedule::parse(&val).map_err(|message| ConfigError::InvalidValue {
                    key: "RETRY_SCHEDULE".to_string(),
                    message,
                })?;
        }
        for task_type in TaskType::ALL {
            let key = TaskTimeouts::env_key(task_type);
            if let Some(val) = lookup(key) {
                *config.task_timeouts.slot_mut(task_type) =
                    Duration::from_secs(parse_env_value(&val, key)?);
            }
        }

        if let Some(val) = lookup("STREAM_MAXLEN") {
            config.stream_maxlen = parse_env_value(&val, "STREAM_MAXLEN")?;
        }
        if let Some(val) = lookup("DETECTOR_ALGORITHM_NAME") {
            config.detector_algorithm = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url must not be empty".to_string(),
            ));
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url must not be empty".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.take_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "take_timeout must be positive".to_string(),
            ));
        }
        if self.promote_tick.is_zero() || self.dlq_replay_tick.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tick intervals must be positive".to_string(),
            ));
        }
        if self.stream_maxlen == 0 {
            return Err(ConfigError::ValidationFailed(
                "stream_maxlen must be at least 1".to_string(),
            ));
        }
        if self.detector_algorithm.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "detector_algorithm must not be empty".to_string(),
            ));
        }
        if let Some(task_type) = TaskType::ALL
            .into_iter()
            .find(|t| self.task_timeouts.for_type(*t).is_zero())
        {
            return Err(ConfigError::ValidationFailed(format!(
                "timeout for {} must be positive",
                task_type
            )));
        }
        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn with_max_concurrency(mut self, max: u64) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_take_timeout(mut self, timeout: Duration) -> Self {
        self.take_timeout = timeout;
        self
    }

    pub fn with_gate_backoff(mut self, backoff: Duration) -> Self {
        self.gate_backoff = backoff;
        self
    }

    pub fn with_promote_tick(mut self, tick: Duration) -> Self {
        self.promote_tick = tick;
        self
    }

    pub fn with_dlq_replay_tick(mut self, tick: Duration) -> Self {
        self.dlq_replay_tick = tick;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.retry_schedule = schedule;
        self
    }

    pub fn with_task_timeout(mut self, task_type: TaskType, timeout: Duration) -> Self {
        *self.task_timeouts.slot_mut(task_type) = timeout;
        self
    }

    pub fn with_stream_maxlen(mut self, maxlen: usize) -> Self {
        self.stream_maxlen = maxlen;
        self
    }

    pub fn with_detector_algorithm(mut self, name: impl Into<String>) -> Self {
        self.detector_algorithm = name.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
