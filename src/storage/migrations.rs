//! Schema migrations for the task repository.
//!
//! Each step of [`schema::MIGRATIONS`] is applied at most once and logged in
//! `_migrations` together with the time it ran.

use std::collections::HashSet;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{self, Migration};

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema step failed; nothing of that step was kept.
    #[error("Migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: String,
}

/// Applies [`schema::MIGRATIONS`] to a pool.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies every pending step in order and returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let pending = self.pending().await?;
        for migration in &pending {
            self.apply(migration).await?;
            debug!(migration = migration.name, "Applied migration");
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Task repository schema updated");
        }
        Ok(pending.len())
    }

    /// Steps not yet recorded as applied.
    pub async fn pending(&self) -> Result<Vec<Migration>, MigrationError> {
        let applied: HashSet<String> = self
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect();
        Ok(schema::MIGRATIONS
            .into_iter()
            .filter(|m| !applied.contains(m.name))
            .collect())
    }

    /// Applied steps in application order.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed {
                name: migration.name.to_string(),
                message: e.to_string(),
            })?;
        sqlx::query("INSERT INTO _migrations (name) VALUES (?1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed {
            name: "0001_tasks".to_string(),
            message: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "Migration 0001_tasks failed: syntax error");
    }

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let runner = MigrationRunner::new(memory_pool().await);

        let first = runner.run_migrations().await.unwrap();
        assert_eq!(first, schema::MIGRATIONS.len());
        assert!(runner.pending().await.unwrap().is_empty());

        let second = runner.run_migrations().await.unwrap();
        assert_eq!(second, 0);

        let applied = runner.list_applied_migrations().await.unwrap();
        assert_eq!(applied.len(), first);
        assert_eq!(applied[0].name, "0001_tasks");
    }

    #[tokio::test]
    async fn test_only_missing_steps_run() {
        let pool = memory_pool().await;
        let runner = MigrationRunner::new(pool.clone());
        runner.list_applied_migrations().await.unwrap();
        sqlx::query("INSERT INTO _migrations (name) VALUES ('0012_indexes')")
            .execute(&pool)
            .await
            .unwrap();

        let pending = runner.pending().await.unwrap();
        assert_eq!(pending.len(), schema::MIGRATIONS.len() - 1);
        assert!(pending.iter().all(|m| m.name != "0012_indexes"));
    }
}
