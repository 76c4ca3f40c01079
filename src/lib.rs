//! Transfer Core Library
//!
//! Asynchronous transfer jobs between data-repository providers: download a
//! resource tree into a fixity-checked zip, upload a local tree, or move a
//! tree from one provider to another.
//!
//! # Architecture
//!
//! - [`provider`] - Provider capability trait, registry and adapters
//! - [`tree`] - Bounded fan-out resource tree traversal
//! - [`fixity`] - Hash verification of fetched files
//! - [`archive`] - Bag layout and zip packaging
//! - [`job`] - Tickets, progress records, worker pool and pipelines
//! - [`db`] - Database connection and schema management
//! - [`settings`] - Engine tuning knobs

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod db;
pub mod fixity;
pub mod job;
pub mod provider;
pub mod settings;
pub mod tree;
mod user_agent;
pub mod validation;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use fixity::HashAlgorithm;
pub use job::{
    DuplicateAction, JobError, JobRunner, JobStatus, JobStore, ProgressRecord, TransferOptions,
    UploadPayload,
};
pub use provider::{
    Action, CapabilityRegistry, GithubProvider, ProviderCapability, ProviderError, ResourceNode,
};
pub use settings::EngineSettings;
