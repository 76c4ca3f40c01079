//! Ticket issuance and the background worker pool.
//!
//! Submissions are validated synchronously, take a slot in a bounded queue,
//! and get their `in_progress` record written before the ticket id is
//! returned. A fixed set of workers drains the queue; each job is run inside
//! its own task so a panic becomes a `failed` record instead of a lost
//! worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::error::JobError;
use super::pipeline::{JobWork, UploadPayload, execute};
use super::progress::JobWriter;
use super::record::{JobAction, JobStatus, JobTicket, ProgressRecord};
use super::store::{JobStore, StoreError};
use super::upload::DuplicateAction;
use crate::fixity::HashAlgorithm;
use crate::provider::{Action, CapabilityRegistry, ResourceNode};
use crate::settings::{EngineSettings, SettingsError};
use crate::tree::ResourceTreeBuilder;
use crate::validation::{ValidationError, hash_tokens, require_token};

const SOURCE_TOKEN: &str = "source_token";
const DESTINATION_TOKEN: &str = "destination_token";
const TOKEN: &str = "token";

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);
const UNEXPECTED_STOP_MESSAGE: &str = "The job stopped unexpectedly. Please try again later.";

struct QueuedJob {
    ticket_id: String,
    action: JobAction,
    work: JobWork,
}

/// Optional knobs for a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Existing destination container to upload into; `None` creates a new
    /// top-level resource.
    pub destination_resource_id: Option<String>,
    /// Duplicate policy; `None` uses the engine default.
    pub duplicate_action: Option<DuplicateAction>,
}

/// Accepts jobs and runs them on a bounded worker pool.
#[derive(Debug)]
pub struct JobRunner {
    registry: Arc<CapabilityRegistry>,
    store: JobStore,
    settings: Arc<EngineSettings>,
    sender: mpsc::Sender<QueuedJob>,
    active: Arc<DashMap<String, JobAction>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("ticket_id", &self.ticket_id)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// Validates `settings` and spawns the worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if any setting is out of range.
    #[instrument(skip_all, fields(workers = settings.worker_count, queue_capacity = settings.queue_capacity))]
    pub fn start(
        registry: Arc<CapabilityRegistry>,
        store: JobStore,
        settings: EngineSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let (sender, receiver) = mpsc::channel::<QueuedJob>(settings.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let active: Arc<DashMap<String, JobAction>> = Arc::new(DashMap::new());

        let workers = (0..settings.worker_count)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let store = store.clone();
                let settings = Arc::clone(&settings);
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else {
                            break;
                        };
                        run_job(worker, job, &store, &settings, &active).await;
                    }
                    debug!(worker, "job worker stopped");
                })
            })
            .collect();

        info!("job runner started");
        Ok(Self {
            registry,
            store,
            settings,
            sender,
            active,
            workers,
        })
    }

    /// Submits a download of `resource_id` from `source` into a local zip.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Validation`] for an unknown provider, unsupported
    /// action or blank token, and [`JobError::QueueFull`] when no slot is
    /// free. No ticket exists after an error.
    #[instrument(skip(self, token))]
    pub async fn download(&self, source: &str, token: &str, resource_id: &str) -> Result<String, JobError> {
        let capability = self.registry.resolve(source, Action::ResourceDownload)?;
        let token = require_token(token, TOKEN)?;
        self.submit(
            JobAction::Download,
            (source, None),
            hash_tokens(&[token]),
            JobWork::Download {
                source: capability,
                token: token.to_string(),
                resource_id: resource_id.to_string(),
            },
        )
        .await
    }

    /// Submits an upload of a local directory or archive to `destination`.
    ///
    /// With `resource_id` the payload goes into that container; without it
    /// each top-level folder of the payload becomes a new top-level resource.
    ///
    /// # Errors
    ///
    /// Same as [`download`](Self::download).
    #[instrument(skip(self, token, payload))]
    pub async fn upload(
        &self,
        destination: &str,
        token: &str,
        resource_id: Option<&str>,
        payload: UploadPayload,
        duplicate_action: Option<DuplicateAction>,
    ) -> Result<String, JobError> {
        let capability = self.registry.resolve(destination, Action::ResourceUpload)?;
        let token = require_token(token, TOKEN)?;
        let work = JobWork::Upload {
            destination: capability,
            token: token.to_string(),
            resource_id: resource_id.map(str::to_string),
            payload,
            duplicate_action: duplicate_action.unwrap_or(self.settings.duplicate_action),
            hash_algorithm: self.hash_algorithm_for(destination),
        };
        self.submit(
            JobAction::Upload,
            (destination, Some(destination)),
            hash_tokens(&[token]),
            work,
        )
        .await
    }

    /// Submits a provider-to-provider transfer of `resource_id`.
    ///
    /// # Errors
    ///
    /// Same as [`download`](Self::download); both providers and both tokens
    /// are checked before a ticket is issued.
    #[instrument(skip(self, source_token, destination_token, options))]
    pub async fn transfer(
        &self,
        source: &str,
        destination: &str,
        source_token: &str,
        destination_token: &str,
        resource_id: &str,
        options: TransferOptions,
    ) -> Result<String, JobError> {
        let source_capability = self.registry.resolve(source, Action::ResourceDownload)?;
        let destination_capability = self.registry.resolve(destination, Action::ResourceUpload)?;
        let source_token = require_token(source_token, SOURCE_TOKEN)?;
        let destination_token = require_token(destination_token, DESTINATION_TOKEN)?;

        let work = JobWork::Transfer {
            source: source_capability,
            destination: destination_capability,
            source_token: source_token.to_string(),
            destination_token: destination_token.to_string(),
            resource_id: resource_id.to_string(),
            destination_resource_id: options.destination_resource_id,
            duplicate_action: options.duplicate_action.unwrap_or(self.settings.duplicate_action),
            hash_algorithm: self.hash_algorithm_for(destination),
        };
        self.submit(
            JobAction::Transfer,
            (source, Some(destination)),
            hash_tokens(&[source_token, destination_token]),
            work,
        )
        .await
    }

    /// Returns the current record for a ticket, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Store`] if the record cannot be read.
    pub async fn status(&self, ticket_id: &str) -> Result<Option<ProgressRecord>, JobError> {
        Ok(self.store.get(ticket_id).await?)
    }

    /// Returns the record only to the caller holding the submitting token(s).
    ///
    /// Transfers were issued for the source and destination tokens together,
    /// in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::TokenMismatch`] when the tokens differ from
    /// the ones that created the ticket.
    pub async fn status_for_token(
        &self,
        ticket_id: &str,
        tokens: &[&str],
    ) -> Result<Option<ProgressRecord>, JobError> {
        let Some(record) = self.store.get(ticket_id).await? else {
            return Ok(None);
        };
        let trimmed: Vec<&str> = tokens.iter().map(|t| t.trim()).collect();
        if hash_tokens(&trimmed) != record.ticket.token_hash {
            return Err(ValidationError::TokenMismatch {
                ticket_id: ticket_id.to_string(),
            }
            .into());
        }
        Ok(Some(record))
    }

    /// Returns the zip produced by a finished download, if it still exists.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Store`] if the record cannot be read.
    pub async fn artifact(&self, ticket_id: &str) -> Result<Option<PathBuf>, JobError> {
        let Some(record) = self.store.get(ticket_id).await? else {
            return Ok(None);
        };
        if record.status != JobStatus::Finished {
            return Ok(None);
        }
        let path = record
            .result
            .and_then(|outcome| outcome.artifact)
            .map(|artifact| artifact.path);
        Ok(path.filter(|p| p.is_file()))
    }

    /// Lists every resource visible to `token`, parents before children.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Validation`] for an unknown provider, unsupported
    /// action or blank token, and [`JobError::Tree`] for a failed listing.
    #[instrument(skip(self, token))]
    pub async fn list_resources(&self, provider: &str, token: &str) -> Result<Vec<ResourceNode>, JobError> {
        let capability = self.registry.resolve(provider, Action::ResourceCollection)?;
        let token = require_token(token, TOKEN)?;
        let nodes = ResourceTreeBuilder::new(self.settings.fan_out_concurrency)
            .build_all(capability.as_ref(), token, None)
            .await?;
        Ok(nodes)
    }

    /// Describes one resource.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Validation`] for an unknown provider, unsupported
    /// action or blank token, and [`JobError::Provider`] for a failed lookup.
    #[instrument(skip(self, token))]
    pub async fn resource_detail(
        &self,
        provider: &str,
        token: &str,
        resource_id: &str,
    ) -> Result<ResourceNode, JobError> {
        let capability = self.registry.resolve(provider, Action::ResourceDetail)?;
        let token = require_token(token, TOKEN)?;
        Ok(capability.fetch_resource(token, resource_id).await?)
    }

    /// Number of jobs accepted and not yet terminal.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Engine settings in effect.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Backing store, for retention sweeps.
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Stops accepting jobs and waits for queued and running jobs to end.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "job worker panicked");
            }
        }
        info!("job runner stopped");
    }

    fn hash_algorithm_for(&self, provider: &str) -> HashAlgorithm {
        self.registry
            .target(provider)
            .and_then(|target| HashAlgorithm::first_supported(&target.supported_hash_algorithms))
            .unwrap_or(self.settings.default_hash_algorithm)
    }

    async fn submit(
        &self,
        action: JobAction,
        (source, destination): (&str, Option<&str>),
        token_hash: String,
        work: JobWork,
    ) -> Result<String, JobError> {
        let permit = self.sender.try_reserve().map_err(|err| match err {
            mpsc::error::TrySendError::Full(()) => JobError::QueueFull {
                capacity: self.settings.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(()) => JobError::ShuttingDown,
        })?;

        let ticket = JobTicket::issue(
            action,
            source,
            destination.map(str::to_string),
            token_hash,
            self.settings.retention_days,
        );
        let ticket_id = ticket.ticket_id.clone();
        match self.active.entry(ticket_id.clone()) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateTicket(ticket_id).into()),
            Entry::Vacant(slot) => {
                slot.insert(action);
            }
        }

        if let Err(err) = self.store.create(&ProgressRecord::new(ticket)).await {
            self.active.remove(&ticket_id);
            return Err(err.into());
        }

        permit.send(QueuedJob {
            ticket_id: ticket_id.clone(),
            action,
            work,
        });
        info!(ticket_id = %ticket_id, %action, "job accepted");
        Ok(ticket_id)
    }
}

async fn run_job(
    worker: usize,
    job: QueuedJob,
    store: &JobStore,
    settings: &Arc<EngineSettings>,
    active: &DashMap<String, JobAction>,
) {
    let QueuedJob {
        ticket_id,
        action,
        work,
    } = job;
    debug!(worker, ticket_id = %ticket_id, %action, "job started");

    let writer = JobWriter::new(store.clone(), ticket_id.clone());
    let task = {
        let writer = Arc::clone(&writer);
        let settings = Arc::clone(settings);
        tokio::spawn(async move { execute(&settings, &writer, work).await })
    };

    let recorded = match task.await {
        Ok(Ok(outcome)) => {
            let fixity_failures = outcome.failed_fixity.len();
            let finished = write_terminal(&ticket_id, || writer.finish(outcome.clone())).await;
            if finished.is_ok() {
                info!(ticket_id = %ticket_id, %action, fixity_failures, "job finished");
            }
            finished
        }
        Ok(Err(err)) => {
            let status_code = err.status_code();
            let message = err.record_message();
            warn!(ticket_id = %ticket_id, %action, status_code, error = %err, "job failed");
            write_terminal(&ticket_id, || writer.fail(status_code, message.clone())).await
        }
        Err(join_err) => {
            warn!(ticket_id = %ticket_id, %action, error = %join_err, "job task panicked");
            write_terminal(&ticket_id, || writer.fail(500, UNEXPECTED_STOP_MESSAGE)).await
        }
    };

    let recorded = match recorded {
        Err(StoreError::Database { .. } | StoreError::Corrupt(_)) => {
            warn!(ticket_id = %ticket_id, "could not record job result; marking the job failed");
            write_terminal(&ticket_id, || writer.fail(500, UNEXPECTED_STOP_MESSAGE)).await
        }
        other => other,
    };

    match recorded {
        // A missing or already-terminal record cannot be left in progress.
        Ok(()) | Err(StoreError::TerminalOrMissing(_)) => {
            active.remove(&ticket_id);
        }
        Err(err) => {
            error!(ticket_id = %ticket_id, error = %err, "job has no terminal record; ticket stays active");
        }
    }
}

/// Runs a terminal record write, retrying while the database reports errors.
async fn write_terminal<F, Fut>(ticket_id: &str, mut write: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Err(err @ StoreError::Database { .. }) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                warn!(ticket_id, attempt, error = %err, "terminal job write failed; retrying");
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
