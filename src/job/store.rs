//! SQLite persistence for progress records.
//!
//! Each record is stored whole as JSON and replaced in a single `UPDATE`, so
//! readers observe either the previous or the next record, never a mix.
//! Updates only apply while the row is `in_progress`; terminal records are
//! permanent.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

use super::record::{JobStatus, ProgressRecord};
use crate::db::Database;

/// Structured classification for store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out or is closed.
    Pool,
    /// Unclassified database failure.
    Other,
}

impl StoreDbErrorKind {
    fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Pool,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")) {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_check_violation()
                    || code
                        .as_deref()
                        .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "1555" || value == "2067")
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Pool => "pool",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors from the job store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Classification of the failure.
        kind: StoreDbErrorKind,
        /// Database error text.
        message: String,
    },

    /// A record with this ticket id already exists.
    #[error("ticket already exists: {0}")]
    DuplicateTicket(String),

    /// The ticket is unknown or already terminal, so it cannot change.
    #[error("ticket {0} is missing or already terminal")]
    TerminalOrMissing(String),

    /// A stored record could not be encoded or decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, FromRow)]
struct RecordRow {
    record: String,
}

/// Keyed store of [`ProgressRecord`]s.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTicket`] if the id is taken, or a
    /// database error.
    #[instrument(skip(self, record), fields(ticket_id = %record.ticket.ticket_id))]
    pub async fn create(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO jobs (ticket_id, action, status, record, created_at, expires_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.ticket.ticket_id)
        .bind(record.ticket.action.as_str())
        .bind(record.status.as_str())
        .bind(&json)
        .bind(timestamp(record.ticket.created_at))
        .bind(timestamp(record.ticket.expires_at))
        .bind(&now)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => {
                debug!("job record created");
                Ok(())
            }
            Err(err) => {
                let mapped = StoreError::from(err);
                if matches!(
                    mapped,
                    StoreError::Database {
                        kind: StoreDbErrorKind::ConstraintViolation,
                        ..
                    }
                ) {
                    Err(StoreError::DuplicateTicket(record.ticket.ticket_id.clone()))
                } else {
                    Err(mapped)
                }
            }
        }
    }

    /// Loads a record by ticket id.
    ///
    /// # Errors
    ///
    /// Returns a database error, or [`StoreError::Corrupt`] if the stored JSON
    /// is unreadable.
    pub async fn get(&self, ticket_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as("SELECT record FROM jobs WHERE ticket_id = ?")
            .bind(ticket_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|row| serde_json::from_str(&row.record).map_err(StoreError::from))
            .transpose()
    }

    /// Replaces an `in_progress` record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TerminalOrMissing`] when no `in_progress` row
    /// with this id exists.
    #[instrument(skip(self, record), fields(ticket_id = %record.ticket.ticket_id, status = %record.status))]
    pub async fn replace(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, record = ?, updated_at = ? \
             WHERE ticket_id = ? AND status = ?",
        )
        .bind(record.status.as_str())
        .bind(&json)
        .bind(timestamp(Utc::now()))
        .bind(&record.ticket.ticket_id)
        .bind(JobStatus::InProgress.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TerminalOrMissing(record.ticket.ticket_id.clone()));
        }
        Ok(())
    }

    /// Returns ids of records whose `expires_at` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ticket_id FROM jobs WHERE expires_at <= ? ORDER BY expires_at")
                .bind(timestamp(now))
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Deletes a record. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    #[instrument(skip(self))]
    pub async fn delete(&self, ticket_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE ticket_id = ?")
            .bind(ticket_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
