//! Database connection and schema management.
//!
//! Job records live in a single SQLite table. This module provides:
//! - Connection pool management
//! - WAL mode so status pollers never block the writing worker
//! - Automatic migration execution
//!
//! # Example
//!
//! ```no_run
//! use transfer_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("jobs.db")).await?;
//! // Hand db to a JobStore...
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Database connection wrapper with connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the job database at `db_path`.
    ///
    /// Enables WAL mode and a busy timeout, then runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// Limited to one connection: every `sqlite::memory:` connection is a
    /// separate database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const INSERT_JOB: &str = "INSERT INTO jobs (ticket_id, action, record, created_at, expires_at, updated_at) \
         VALUES ('t1', ?, '{}', '2026-01-01T00:00:00.000Z', '2026-01-06T00:00:00.000Z', '2026-01-01T00:00:00.000Z')";

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_jobs_table_exists_with_default_status() {
        let db = Database::new_in_memory().await.unwrap();

        sqlx::query(INSERT_JOB)
            .bind("download")
            .execute(db.pool())
            .await
            .unwrap();

        let (status,): (String,) = sqlx::query_as("SELECT status FROM jobs WHERE ticket_id = 't1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(status, "in_progress");
    }

    #[tokio::test]
    async fn test_jobs_action_constraint() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(INSERT_JOB)
            .bind("delete_everything")
            .execute(db.pool())
            .await;

        assert!(
            result.is_err(),
            "Invalid action should be rejected by CHECK constraint"
        );
    }

    #[tokio::test]
    async fn test_database_with_tempfile() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("jobs.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(
            db.is_wal_enabled().await.unwrap(),
            "WAL mode should be enabled for file-based database"
        );
        db.close().await;
    }
}
