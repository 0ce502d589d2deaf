//! SQLite database client for the task repository.
//!
//! `Database` owns the connection pool. Task, injection and trace operations
//! live in sibling modules as further `impl Database` blocks.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use thiserror::Error;

use super::migrations::{MigrationError, MigrationRunner};

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected the write.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::AlreadyExists(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                StorageError::ConnectionFailed(err.to_string())
            }
            _ => StorageError::QueryFailed(err),
        }
    }
}

/// Parses a TEXT column into one of the crate's string-backed enums.
pub(crate) fn parse_column<T>(column: &str, value: &str) -> Result<T, StorageError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StorageError::InvalidData(format!("{}: {}", column, e)))
}

/// SQLite database client.
#[derive(Clone)]
pub struct Database {
    pub(super) pool: SqlitePool,
}

impl Database {
    /// Connects to the database, creating the file if it does not exist.
    ///
    /// Accepts `sqlite://path`, `sqlite:path` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = database_url, "Database opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database.
    ///
    /// A single connection is kept so every query sees the same database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations. Returns the number newly applied.
    pub async fn run_migrations(&self) -> Result<usize, StorageError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    /// Checks that the database answers queries.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let db = Database::in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotFound("task abc".to_string());
        assert_eq!(err.to_string(), "Record not found: task abc");

        let err = StorageError::AlreadyExists("fault_injections.name".to_string());
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unique_violation_maps_to_already_exists() {
        let db = test_database().await;
        sqlx::query("INSERT INTO labels (key, value) VALUES ('tag', 'x')")
            .execute(db.pool())
            .await
            .unwrap();

        let err: StorageError = sqlx::query("INSERT INTO labels (key, value) VALUES ('tag', 'x')")
            .execute(db.pool())
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());

        let db = Database::connect(&url).await.unwrap();
        assert!(db.run_migrations().await.unwrap() > 0);
        db.close().await;

        let db = Database::connect(&url).await.unwrap();
        assert_eq!(db.run_migrations().await.unwrap(), 0);
        db.ping().await.unwrap();
    }

    #[test]
    fn test_parse_column_reports_column() {
        let err = parse_column::<crate::scheduler::task::TaskState>("state", "Sleeping").unwrap_err();
        assert!(err.to_string().contains("state"));
    }
}
