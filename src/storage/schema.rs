//! Database schema constants.
//!
//! All statements are idempotent (`IF NOT EXISTS`). Cross-table removal is
//! explicit in the repository code, so foreign keys carry no `ON DELETE`
//! actions.

/// Durable task records.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT    PRIMARY KEY,
    type            TEXT    NOT NULL,
    trace_id        TEXT    NOT NULL,
    group_id        TEXT,
    parent_task_id  TEXT,
    level           INTEGER NOT NULL DEFAULT 0,
    sequence        INTEGER NOT NULL DEFAULT 0,
    payload         TEXT    NOT NULL DEFAULT 'null',
    immediate       INTEGER NOT NULL DEFAULT 1,
    execute_time    INTEGER,
    deadline        INTEGER,
    state           TEXT    NOT NULL DEFAULT 'Pending',
    status          TEXT    NOT NULL DEFAULT 'Enabled',
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
)
"#;

/// One row per trace, upserted on every published event.
pub const CREATE_TRACES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    id              TEXT    PRIMARY KEY,
    group_id        TEXT,
    first_task_type TEXT    NOT NULL,
    last_event      TEXT,
    start_time      TEXT    NOT NULL,
    end_time        TEXT,
    state           TEXT    NOT NULL DEFAULT 'Pending',
    status          TEXT    NOT NULL DEFAULT 'Enabled',
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
)
"#;

pub const CREATE_FAULT_INJECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fault_injections (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id         TEXT    UNIQUE,
    name            TEXT    NOT NULL UNIQUE,
    fault_type      TEXT    NOT NULL,
    benchmark       TEXT    NOT NULL,
    pedestal        TEXT    NOT NULL,
    engine_config   TEXT    NOT NULL,
    display_config  TEXT,
    pre_duration    INTEGER NOT NULL DEFAULT 0,
    start_time      INTEGER,
    end_time        INTEGER,
    state           TEXT    NOT NULL DEFAULT 'Initial',
    status          TEXT    NOT NULL DEFAULT 'Enabled',
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
)
"#;

pub const CREATE_LABELS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS labels (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    key     TEXT    NOT NULL,
    value   TEXT    NOT NULL,
    UNIQUE(key, value)
)
"#;

pub const CREATE_FAULT_INJECTION_LABELS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fault_injection_labels (
    fault_injection_id  INTEGER NOT NULL REFERENCES fault_injections(id),
    label_id            INTEGER NOT NULL REFERENCES labels(id),
    PRIMARY KEY (fault_injection_id, label_id)
)
"#;

pub const CREATE_EXECUTION_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS execution_results (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id         TEXT,
    algorithm       TEXT    NOT NULL,
    datapack_id     INTEGER NOT NULL REFERENCES fault_injections(id),
    status          TEXT    NOT NULL DEFAULT 'Initial',
    duration_ms     INTEGER,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
)
"#;

pub const CREATE_EXECUTION_RESULT_LABELS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS execution_result_labels (
    execution_result_id INTEGER NOT NULL REFERENCES execution_results(id),
    label_id            INTEGER NOT NULL REFERENCES labels(id),
    PRIMARY KEY (execution_result_id, label_id)
)
"#;

pub const CREATE_GRANULARITY_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS granularity_results (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_result_id INTEGER NOT NULL REFERENCES execution_results(id),
    level               TEXT    NOT NULL,
    result              TEXT    NOT NULL,
    rank                INTEGER NOT NULL,
    confidence          REAL    NOT NULL
)
"#;

pub const CREATE_DETECTORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS detectors (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_result_id     INTEGER NOT NULL REFERENCES execution_results(id),
    span_name               TEXT    NOT NULL,
    issues                  TEXT    NOT NULL DEFAULT '{}',
    abnormal_avg_duration   REAL,
    normal_avg_duration     REAL,
    abnormal_succ_rate      REAL,
    normal_succ_rate        REAL,
    abnormal_p99            REAL,
    normal_p99              REAL
)
"#;

pub const CREATE_DATASET_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL,
    version     TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    UNIQUE(name, version)
)
"#;

pub const CREATE_DATASET_FAULT_INJECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_fault_injections (
    dataset_version_id  INTEGER NOT NULL REFERENCES dataset_versions(id),
    fault_injection_id  INTEGER NOT NULL REFERENCES fault_injections(id),
    PRIMARY KEY (dataset_version_id, fault_injection_id)
)
"#;

/// SQL for creating indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_trace ON tasks(trace_id, level, sequence);
CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(group_id);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
CREATE INDEX IF NOT EXISTS idx_traces_group ON traces(group_id);
CREATE INDEX IF NOT EXISTS idx_fault_injections_engine ON fault_injections(engine_config, state);
CREATE INDEX IF NOT EXISTS idx_execution_results_datapack ON execution_results(datapack_id);
CREATE INDEX IF NOT EXISTS idx_execution_results_task ON execution_results(task_id);
CREATE INDEX IF NOT EXISTS idx_granularity_results_exec ON granularity_results(execution_result_id);
CREATE INDEX IF NOT EXISTS idx_detectors_exec ON detectors(execution_result_id);
"#;

/// A named schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Schema steps in dependency order. Names are recorded once applied, so
/// new steps go at the end.
pub const MIGRATIONS: [Migration; 12] = [
    Migration { name: "0001_tasks", sql: CREATE_TASKS_TABLE },
    Migration { name: "0002_traces", sql: CREATE_TRACES_TABLE },
    Migration { name: "0003_fault_injections", sql: CREATE_FAULT_INJECTIONS_TABLE },
    Migration { name: "0004_labels", sql: CREATE_LABELS_TABLE },
    Migration { name: "0005_fault_injection_labels", sql: CREATE_FAULT_INJECTION_LABELS_TABLE },
    Migration { name: "0006_execution_results", sql: CREATE_EXECUTION_RESULTS_TABLE },
    Migration { name: "0007_execution_result_labels", sql: CREATE_EXECUTION_RESULT_LABELS_TABLE },
    Migration { name: "0008_granularity_results", sql: CREATE_GRANULARITY_RESULTS_TABLE },
    Migration { name: "0009_detectors", sql: CREATE_DETECTORS_TABLE },
    Migration { name: "0010_dataset_versions", sql: CREATE_DATASET_VERSIONS_TABLE },
    Migration { name: "0011_dataset_fault_injections", sql: CREATE_DATASET_FAULT_INJECTIONS_TABLE },
    Migration { name: "0012_indexes", sql: CREATE_INDEXES },
];

/// Every table the schema creates.
pub const TABLES: [&str; 11] = [
    "tasks",
    "traces",
    "fault_injections",
    "labels",
    "fault_injection_labels",
    "execution_results",
    "execution_result_labels",
    "granularity_results",
    "detectors",
    "dataset_versions",
    "dataset_fault_injections",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_statements_are_idempotent() {
        for migration in MIGRATIONS {
            assert!(migration.sql.contains("IF NOT EXISTS"), "{}", migration.name);
        }
    }

    #[test]
    fn test_migration_names_are_ordered_and_unique() {
        let names: Vec<_> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_every_table_has_a_create_statement() {
        let all: String = MIGRATIONS.iter().map(|m| m.sql).collect();
        for table in TABLES {
            assert!(
                all.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table)),
                "missing table {}",
                table
            );
        }
    }
}
