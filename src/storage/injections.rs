//! Fault injections, execution results and their dependents.
//!
//! The aggregates are linked by ids only. A fault injection (datapack) owns
//! its execution results; each execution result owns granularity rows,
//! detector rows and label links. Removal walks that graph explicitly inside
//! one transaction.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

use super::database::{parse_column, Database, StorageError};

/// Label key/value marking a datapack as unusable for dedup.
pub const INVALID_LABEL: (&str, &str) = ("tag", "invalid");

/// Progress of a datapack through injection, build and detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatapackState {
    Initial,
    InjectFailed,
    InjectSuccess,
    BuildFailed,
    BuildSuccess,
    DetectorFailed,
    DetectorSuccess,
}

impl DatapackState {
    pub const ALL: [DatapackState; 7] = [
        DatapackState::Initial,
        DatapackState::InjectFailed,
        DatapackState::InjectSuccess,
        DatapackState::BuildFailed,
        DatapackState::BuildSuccess,
        DatapackState::DetectorFailed,
        DatapackState::DetectorSuccess,
    ];

    /// States whose datapack has been built; these take part in dedup.
    pub const BUILT: [DatapackState; 3] = [
        DatapackState::BuildSuccess,
        DatapackState::DetectorFailed,
        DatapackState::DetectorSuccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatapackState::Initial => "Initial",
            DatapackState::InjectFailed => "InjectFailed",
            DatapackState::InjectSuccess => "InjectSuccess",
            DatapackState::BuildFailed => "BuildFailed",
            DatapackState::BuildSuccess => "BuildSuccess",
            DatapackState::DetectorFailed => "DetectorFailed",
            DatapackState::DetectorSuccess => "DetectorSuccess",
        }
    }
}

impl fmt::Display for DatapackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatapackState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatapackState::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown datapack state '{}'", s))
    }
}

/// Soft-delete flag shared by artifact rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    Enabled,
    Disabled,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Enabled => "Enabled",
            RecordStatus::Disabled => "Disabled",
            RecordStatus::Deleted => "Deleted",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Enabled" => Ok(RecordStatus::Enabled),
            "Disabled" => Ok(RecordStatus::Disabled),
            "Deleted" => Ok(RecordStatus::Deleted),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// Status of one algorithm execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Initial,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Initial => "Initial",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initial" => Ok(ExecutionStatus::Initial),
            "Running" => Ok(ExecutionStatus::Running),
            "Success" => Ok(ExecutionStatus::Success),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Canonical text form of an engine config, used as the dedup key.
///
/// Object keys come out sorted, so semantically equal configs compare equal.
pub fn canonical_engine_config(config: &serde_json::Value) -> Result<String, StorageError> {
    Ok(serde_json::to_string(config)?)
}

/// A recorded fault-injection run (datapack).
#[derive(Debug, Clone, PartialEq)]
pub struct FaultInjection {
    pub id: i64,
    pub task_id: Option<String>,
    pub name: String,
    pub fault_type: String,
    pub benchmark: String,
    pub pedestal: String,
    pub engine_config: String,
    pub display_config: Option<String>,
    pub pre_duration: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub state: DatapackState,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new fault injection.
#[derive(Debug, Clone, Default)]
pub struct NewFaultInjection {
    pub task_id: Option<String>,
    pub name: String,
    pub fault_type: String,
    pub benchmark: String,
    pub pedestal: String,
    pub engine_config: String,
    pub display_config: Option<String>,
    pub pre_duration: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub state: Option<DatapackState>,
}

impl NewFaultInjection {
    pub fn new(name: impl Into<String>, engine_config: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_config: engine_config.into(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_fault_type(mut self, fault_type: impl Into<String>) -> Self {
        self.fault_type = fault_type.into();
        self
    }

    pub fn with_benchmark(mut self, benchmark: impl Into<String>, pedestal: impl Into<String>) -> Self {
        self.benchmark = benchmark.into();
        self.pedestal = pedestal.into();
        self
    }

    pub fn with_window(mut self, pre_duration: i64, start_time: i64, end_time: i64) -> Self {
        self.pre_duration = pre_duration;
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        self
    }

    pub fn with_display_config(mut self, display_config: impl Into<String>) -> Self {
        self.display_config = Some(display_config.into());
        self
    }

    pub fn with_state(mut self, state: DatapackState) -> Self {
        self.state = Some(state);
        self
    }
}

/// One algorithm run against a datapack.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub id: i64,
    /// `None` for manual uploads.
    pub task_id: Option<String>,
    pub algorithm: String,
    pub datapack_id: i64,
    pub status: ExecutionStatus,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-service ranking produced by an RCA algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranularityResult {
    pub level: String,
    pub result: String,
    pub rank: i64,
    pub confidence: f64,
}

/// Per-span statistics produced by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorResult {
    pub span_name: String,
    #[serde(default)]
    pub issues: serde_json::Value,
    pub abnormal_avg_duration: Option<f64>,
    pub normal_avg_duration: Option<f64>,
    pub abnormal_succ_rate: Option<f64>,
    pub normal_succ_rate: Option<f64>,
    pub abnormal_p99: Option<f64>,
    pub normal_p99: Option<f64>,
}

impl DetectorResult {
    /// True when the detector flagged anything on this span.
    pub fn has_issues(&self) -> bool {
        match &self.issues {
            serde_json::Value::Null => false,
            serde_json::Value::Object(m) => !m.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::String(s) => !s.is_empty() && s != "{}",
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetVersion {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// Rows removed by a cascade delete, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub granularity_results: u64,
    pub detectors: u64,
    pub execution_result_labels: u64,
    pub execution_results: u64,
    pub fault_injection_labels: u64,
    pub dataset_fault_injections: u64,
}

impl CascadeStats {
    pub fn total(&self) -> u64 {
        self.granularity_results
            + self.detectors
            + self.execution_result_labels
            + self.execution_results
            + self.fault_injection_labels
            + self.dataset_fault_injections
    }
}

fn injection_from_row(row: &SqliteRow) -> Result<FaultInjection, StorageError> {
    let state: String = row.try_get("state")?;
    let status: String = row.try_get("status")?;
    Ok(FaultInjection {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        name: row.try_get("name")?,
        fault_type: row.try_get("fault_type")?,
        benchmark: row.try_get("benchmark")?,
        pedestal: row.try_get("pedestal")?,
        engine_config: row.try_get("engine_config")?,
        display_config: row.try_get("display_config")?,
        pre_duration: row.try_get("pre_duration")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        state: parse_column("state", &state)?,
        status: parse_column("status", &status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionResult, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        algorithm: row.try_get("algorithm")?,
        datapack_id: row.try_get("datapack_id")?,
        status: parse_column("status", &status)?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    // =========================================================================
    // Fault injections
    // =========================================================================

    pub async fn create_fault_injection(
        &self,
        new: &NewFaultInjection,
    ) -> Result<FaultInjection, StorageError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO fault_injections (
                task_id, name, fault_type, benchmark, pedestal, engine_config,
                display_config, pre_duration, start_time, end_time, state, status,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'Enabled', ?12, ?12)
            RETURNING *
            "#,
        )
        .bind(&new.task_id)
        .bind(&new.name)
        .bind(&new.fault_type)
        .bind(&new.benchmark)
        .bind(&new.pedestal)
        .bind(&new.engine_config)
        .bind(&new.display_config)
        .bind(new.pre_duration)
        .bind(new.start_time)
        .bind(new.end_time)
        .bind(new.state.unwrap_or(DatapackState::Initial).as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        injection_from_row(&row)
    }

    pub async fn get_fault_injection(&self, id: i64) -> Result<Option<FaultInjection>, StorageError> {
        let row = sqlx::query("SELECT * FROM fault_injections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(injection_from_row).transpose()
    }

    pub async fn get_fault_injection_by_task(
        &self,
        task_id: &str,
    ) -> Result<Option<FaultInjection>, StorageError> {
        let row = sqlx::query("SELECT * FROM fault_injections WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(injection_from_row).transpose()
    }

    pub async fn get_fault_injection_by_name(
        &self,
        name: &str,
    ) -> Result<Option<FaultInjection>, StorageError> {
        let row = sqlx::query("SELECT * FROM fault_injections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(injection_from_row).transpose()
    }

    pub async fn set_fault_injection_state(
        &self,
        id: i64,
        state: DatapackState,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE fault_injections SET state = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(state.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("fault injection {}", id)));
        }
        Ok(())
    }

    /// Returns the subset of `configs` that already have a built, non-deleted
    /// datapack not labelled invalid. Input order is preserved.
    pub async fn list_existing_engine_configs(
        &self,
        configs: &[String],
    ) -> Result<Vec<String>, StorageError> {
        if configs.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT fi.engine_config FROM fault_injections fi WHERE fi.engine_config IN (",
        );
        let mut separated = qb.separated(", ");
        for config in configs {
            separated.push_bind(config.clone());
        }
        qb.push(") AND fi.status != 'Deleted' AND fi.state IN (");
        let mut separated = qb.separated(", ");
        for state in DatapackState::BUILT {
            separated.push_bind(state.as_str());
        }
        qb.push(
            ") AND NOT EXISTS (
                SELECT 1 FROM fault_injection_labels fil
                JOIN labels l ON l.id = fil.label_id
                WHERE fil.fault_injection_id = fi.id AND l.key = ",
        );
        qb.push_bind(INVALID_LABEL.0)
            .push(" AND l.value = ")
            .push_bind(INVALID_LABEL.1)
            .push(")");

        let found: HashSet<String> = qb
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        let mut seen = HashSet::new();
        Ok(configs
            .iter()
            .filter(|c| found.contains(*c) && seen.insert(c.as_str()))
            .cloned()
            .collect())
    }

    /// Removes a datapack and everything hanging off it.
    ///
    /// Execution results and their rows are deleted outright; the injection
    /// itself is soft-deleted. Runs in one transaction.
    pub async fn cascade_delete_fault_injection(
        &self,
        id: i64,
    ) -> Result<CascadeStats, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut stats = CascadeStats::default();

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM fault_injections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("fault injection {}", id)));
        }

        let execution_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM execution_results WHERE datapack_id = ?1")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        if !execution_ids.is_empty() {
            let by_execution = "WHERE execution_result_id IN \
                 (SELECT id FROM execution_results WHERE datapack_id = ?1)";

            stats.granularity_results =
                sqlx::query(&format!("DELETE FROM granularity_results {}", by_execution))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            stats.detectors = sqlx::query(&format!("DELETE FROM detectors {}", by_execution))
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            stats.execution_result_labels =
                sqlx::query(&format!("DELETE FROM execution_result_labels {}", by_execution))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            stats.execution_results =
                sqlx::query("DELETE FROM execution_results WHERE datapack_id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
        }

        stats.fault_injection_labels =
            sqlx::query("DELETE FROM fault_injection_labels WHERE fault_injection_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        stats.dataset_fault_injections =
            sqlx::query("DELETE FROM dataset_fault_injections WHERE fault_injection_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        sqlx::query("UPDATE fault_injections SET status = 'Deleted', updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            fault_injection_id = id,
            execution_results = stats.execution_results,
            rows = stats.total(),
            "Cascade-deleted fault injection"
        );
        Ok(stats)
    }

    // =========================================================================
    // Execution results
    // =========================================================================

    pub async fn create_execution_result(
        &self,
        task_id: Option<&str>,
        algorithm: &str,
        datapack_id: i64,
    ) -> Result<ExecutionResult, StorageError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO execution_results (task_id, algorithm, datapack_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'Initial', ?4, ?4)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(algorithm)
        .bind(datapack_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        execution_from_row(&row)
    }

    pub async fn get_execution_result(
        &self,
        id: i64,
    ) -> Result<Option<ExecutionResult>, StorageError> {
        let row = sqlx::query("SELECT * FROM execution_results WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn set_execution_result_status(
        &self,
        id: i64,
        status: ExecutionStatus,
        duration_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE execution_results
            SET status = ?1, duration_ms = COALESCE(?2, duration_ms), updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(duration_ms)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("execution result {}", id)));
        }
        Ok(())
    }

    pub async fn list_execution_results_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<ExecutionResult>, StorageError> {
        sqlx::query("SELECT * FROM execution_results WHERE task_id = ?1 ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(execution_from_row)
            .collect()
    }

    pub async fn list_execution_results_for_datapack(
        &self,
        datapack_id: i64,
    ) -> Result<Vec<ExecutionResult>, StorageError> {
        sqlx::query("SELECT * FROM execution_results WHERE datapack_id = ?1 ORDER BY id")
            .bind(datapack_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(execution_from_row)
            .collect()
    }

    /// Stores the granularity rows of an execution. Rows are write-once:
    /// a second save for the same execution fails with `AlreadyExists`.
    pub async fn save_granularity_results(
        &self,
        execution_result_id: i64,
        results: &[GranularityResult],
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM granularity_results WHERE execution_result_id = ?1",
        )
        .bind(execution_result_id)
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Err(StorageError::AlreadyExists(format!(
                "granularity results for execution {}",
                execution_result_id
            )));
        }

        for result in results {
            sqlx::query(
                r#"
                INSERT INTO granularity_results (execution_result_id, level, result, rank, confidence)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(execution_result_id)
            .bind(&result.level)
            .bind(&result.result)
            .bind(result.rank)
            .bind(result.confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(results.len() as u64)
    }

    pub async fn save_detector_results(
        &self,
        execution_result_id: i64,
        results: &[DetectorResult],
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        for result in results {
            sqlx::query(
                r#"
                INSERT INTO detectors (
                    execution_result_id, span_name, issues,
                    abnormal_avg_duration, normal_avg_duration,
                    abnormal_succ_rate, normal_succ_rate,
                    abnormal_p99, normal_p99
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(execution_result_id)
            .bind(&result.span_name)
            .bind(serde_json::to_string(&result.issues)?)
            .bind(result.abnormal_avg_duration)
            .bind(result.normal_avg_duration)
            .bind(result.abnormal_succ_rate)
            .bind(result.normal_succ_rate)
            .bind(result.abnormal_p99)
            .bind(result.normal_p99)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(results.len() as u64)
    }

    pub async fn count_granularity_results(&self, execution_result_id: i64) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM granularity_results WHERE execution_result_id = ?1",
        )
        .bind(execution_result_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    pub async fn count_detector_results(&self, execution_result_id: i64) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM detectors WHERE execution_result_id = ?1",
        )
        .bind(execution_result_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    // =========================================================================
    // Labels and datasets
    // =========================================================================

    /// Returns the id of the label, creating it on first use.
    pub async fn ensure_label(&self, key: &str, value: &str) -> Result<i64, StorageError> {
        sqlx::query("INSERT INTO labels (key, value) VALUES (?1, ?2) ON CONFLICT(key, value) DO NOTHING")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM labels WHERE key = ?1 AND value = ?2")
            .bind(key)
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn attach_fault_injection_label(
        &self,
        fault_injection_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let label_id = self.ensure_label(key, value).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO fault_injection_labels (fault_injection_id, label_id) VALUES (?1, ?2)",
        )
        .bind(fault_injection_id)
        .bind(label_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attach_execution_result_label(
        &self,
        execution_result_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let label_id = self.ensure_label(key, value).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO execution_result_labels (execution_result_id, label_id) VALUES (?1, ?2)",
        )
        .bind(execution_result_id)
        .bind(label_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_dataset_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<DatasetVersion, StorageError> {
        let row = sqlx::query(
            "INSERT INTO dataset_versions (name, version, created_at) VALUES (?1, ?2, ?3) RETURNING *",
        )
        .bind(name)
        .bind(version)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(DatasetVersion {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn add_fault_injection_to_dataset(
        &self,
        dataset_version_id: i64,
        fault_injection_id: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO dataset_fault_injections (dataset_version_id, fault_injection_id) VALUES (?1, ?2)",
        )
        .bind(dataset_version_id)
        .bind(fault_injection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_dataset_versions_for_injection(
        &self,
        fault_injection_id: i64,
    ) -> Result<Vec<DatasetVersion>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT dv.id, dv.name, dv.version, dv.created_at
            FROM dataset_versions dv
            JOIN dataset_fault_injections dfi ON dfi.dataset_version_id = dv.id
            WHERE dfi.fault_injection_id = ?1
            ORDER BY dv.id
            "#,
        )
        .bind(fault_injection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DatasetVersion {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    version: row.try_get("version")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
