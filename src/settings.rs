//! Engine tuning knobs and their validation.

use std::path::PathBuf;

use thiserror::Error;

use crate::fixity::HashAlgorithm;
use crate::job::DuplicateAction;

/// Minimum listing/fetch fan-out.
pub const MIN_FAN_OUT: usize = 1;
/// Maximum listing/fetch fan-out.
pub const MAX_FAN_OUT: usize = 100;
/// Default listing/fetch fan-out.
pub const DEFAULT_FAN_OUT: usize = 10;

/// Maximum number of job workers.
pub const MAX_WORKERS: usize = 64;
/// Default number of job workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Maximum queued (not yet running) jobs.
pub const MAX_QUEUE_CAPACITY: usize = 10_000;
/// Default queued job capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Maximum ticket retention.
pub const MAX_RETENTION_DAYS: u32 = 365;
/// Default ticket retention.
pub const DEFAULT_RETENTION_DAYS: u32 = 5;

/// Default suffix template for disambiguated titles; `*` is replaced by N.
pub const DEFAULT_TITLE_TEMPLATE: &str = " (*)";

/// Invalid engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// Fan-out outside the allowed range.
    #[error("invalid fan_out_concurrency {value}: must be between {MIN_FAN_OUT} and {MAX_FAN_OUT}")]
    InvalidFanOut {
        /// The invalid value.
        value: usize,
    },

    /// Worker count outside the allowed range.
    #[error("invalid worker_count {value}: must be between 1 and {MAX_WORKERS}")]
    InvalidWorkerCount {
        /// The invalid value.
        value: usize,
    },

    /// Queue capacity outside the allowed range.
    #[error("invalid queue_capacity {value}: must be between 1 and {MAX_QUEUE_CAPACITY}")]
    InvalidQueueCapacity {
        /// The invalid value.
        value: usize,
    },

    /// Retention outside the allowed range.
    #[error("invalid retention_days {value}: must be between 1 and {MAX_RETENTION_DAYS}")]
    InvalidRetention {
        /// The invalid value.
        value: u32,
    },

    /// Title template must contain exactly one `*`.
    #[error("invalid duplicate_title_template '{template}': must contain exactly one '*'")]
    InvalidTitleTemplate {
        /// The invalid template.
        template: String,
    },
}

/// Runtime configuration for the job engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Directory holding per-job staging areas and produced zips.
    pub jobs_dir: PathBuf,
    /// Bound on concurrent provider calls within one job.
    pub fan_out_concurrency: usize,
    /// Number of jobs run at once.
    pub worker_count: usize,
    /// Number of accepted jobs that may wait for a worker.
    pub queue_capacity: usize,
    /// Days until a ticket becomes eligible for cleanup.
    pub retention_days: u32,
    /// Algorithm computed when neither side supplies one.
    pub default_hash_algorithm: HashAlgorithm,
    /// Upload policy when a same-titled file exists.
    pub duplicate_action: DuplicateAction,
    /// Suffix template for disambiguated titles.
    pub duplicate_title_template: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            jobs_dir: std::env::temp_dir().join("transfer-jobs"),
            fan_out_concurrency: DEFAULT_FAN_OUT,
            worker_count: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retention_days: DEFAULT_RETENTION_DAYS,
            default_hash_algorithm: HashAlgorithm::Sha256,
            duplicate_action: DuplicateAction::Rename,
            duplicate_title_template: DEFAULT_TITLE_TEMPLATE.to_string(),
        }
    }
}

impl EngineSettings {
    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`SettingsError`] found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_FAN_OUT..=MAX_FAN_OUT).contains(&self.fan_out_concurrency) {
            return Err(SettingsError::InvalidFanOut {
                value: self.fan_out_concurrency,
            });
        }
        if !(1..=MAX_WORKERS).contains(&self.worker_count) {
            return Err(SettingsError::InvalidWorkerCount {
                value: self.worker_count,
            });
        }
        if !(1..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            return Err(SettingsError::InvalidQueueCapacity {
                value: self.queue_capacity,
            });
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(SettingsError::InvalidRetention {
                value: self.retention_days,
            });
        }
        if self.duplicate_title_template.matches('*').count() != 1 {
            return Err(SettingsError::InvalidTitleTemplate {
                template: self.duplicate_title_template.clone(),
            });
        }
        Ok(())
    }
}
