//! Error types for job submission and background pipelines.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::store::StoreError;
use crate::archive::ArchiveError;
use crate::provider::ProviderError;
use crate::tree::TreeBuildError;
use crate::validation::ValidationError;

/// Errors returned synchronously, before or while a ticket is issued.
#[derive(Debug, Error)]
pub enum JobError {
    /// The request was rejected before any ticket existed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The record could not be read or persisted.
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// Every queue slot is taken.
    #[error("job queue is full ({capacity} waiting jobs); retry later")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The runner has been shut down.
    #[error("job runner is shutting down")]
    ShuttingDown,

    /// A synchronous provider query failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A synchronous collection query failed.
    #[error(transparent)]
    Tree(#[from] TreeBuildError),
}

impl JobError {
    /// Returns the status code to report to the caller.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(err) => err.status_code(),
            Self::Store(_) => 500,
            Self::QueueFull { .. } | Self::ShuttingDown => 503,
            Self::Provider(err) => err.status_code(),
            Self::Tree(err) => err.status,
        }
    }
}

/// Errors that end a running job; written into the `failed` record.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The resource tree could not be built.
    #[error(transparent)]
    Tree(#[from] TreeBuildError),

    /// The archive could not be laid out or written.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Local filesystem failure.
    #[error("I/O failed at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Creates an I/O error for `path`.
    #[must_use]
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns the semantic status code recorded on the failed ticket.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Provider(err) => err.status_code(),
            Self::Tree(err) => err.status,
            Self::Archive(
                ArchiveError::DuplicatePath(_) | ArchiveError::UnsafePath(_) | ArchiveError::PathConflict(_),
            ) => 400,
            Self::Archive(_) | Self::Io { .. } | Self::Task(_) => 500,
        }
    }

    /// Returns the message recorded on the failed ticket.
    ///
    /// Provider failures keep the provider's own wording so clients see, for
    /// example, the exact invalid-token message.
    #[must_use]
    pub fn record_message(&self) -> String {
        match self {
            Self::Tree(err) => err.source.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::INVALID_TOKEN_MESSAGE;

    #[test]
    fn test_tree_failure_keeps_provider_message() {
        let err = PipelineError::from(TreeBuildError {
            resource_id: "r".to_string(),
            status: 401,
            source: ProviderError::invalid_token(),
        });
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.record_message(), INVALID_TOKEN_MESSAGE);
    }

    #[test]
    fn test_job_error_status_codes() {
        assert_eq!(JobError::QueueFull { capacity: 1 }.status_code(), 503);
        assert_eq!(
            JobError::from(ValidationError::UnknownProvider {
                name: "x".to_string()
            })
            .status_code(),
            404
        );
    }

    #[test]
    fn test_unsafe_archive_path_is_client_error() {
        let err = PipelineError::from(ArchiveError::UnsafePath("../x".to_string()));
        assert_eq!(err.status_code(), 400);
    }
}
