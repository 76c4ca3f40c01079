//! Job tickets, progress records and the background pipelines.
//!
//! # Overview
//!
//! A caller submits a download, upload or transfer to the [`JobRunner`] and
//! gets a ticket id back immediately. The work runs on a worker task; its
//! [`ProgressRecord`] is persisted in the [`JobStore`] and can be polled
//! until it reaches `finished` or `failed`.

mod error;
mod pipeline;
mod progress;
mod record;
mod runner;
mod store;
mod upload;

pub use error::{JobError, PipelineError};
pub use pipeline::{CollectedDownload, DownloadRequest, UploadPayload, collect_download, job_dir};
pub use progress::{JobWriter, ProgressHandle};
pub use record::{
    ArtifactRef, FileMetadata, JobAction, JobOutcome, JobStatus, JobTicket, Phase, PhaseProgress,
    ProgressRecord,
};
pub use runner::{JobRunner, TransferOptions};
pub use store::{JobStore, StoreDbErrorKind, StoreError};
pub use upload::{DuplicateAction, UploadPlan, disambiguate_title, upload_tree};
