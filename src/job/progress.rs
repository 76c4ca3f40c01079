//! Single-writer access to one ticket's progress record.
//!
//! A [`JobWriter`] is owned by the worker running the job. Every mutation is a
//! read-modify-write of the whole record under the writer's mutex, followed
//! by one atomic store replace. [`ProgressHandle`] is the narrow view handed to
//! the tree builder and upload walk.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::{JobOutcome, JobStatus, Phase, ProgressRecord};
use super::store::{JobStore, StoreError};

/// Serialized writer for one ticket.
#[derive(Debug)]
pub struct JobWriter {
    store: JobStore,
    ticket_id: String,
    lock: Mutex<()>,
}

impl JobWriter {
    /// Creates a writer for an existing record.
    #[must_use]
    pub fn new(store: JobStore, ticket_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            ticket_id: ticket_id.into(),
            lock: Mutex::new(()),
        })
    }

    /// Ticket this writer owns.
    #[must_use]
    pub fn ticket_id(&self) -> &str {
        &self.ticket_id
    }

    /// Applies `change` to the current record and stores the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TerminalOrMissing`] once the record is terminal,
    /// or a database error.
    pub async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ProgressRecord) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut record = self
            .store
            .get(&self.ticket_id)
            .await?
            .ok_or_else(|| StoreError::TerminalOrMissing(self.ticket_id.clone()))?;
        if record.status.is_terminal() {
            return Err(StoreError::TerminalOrMissing(self.ticket_id.clone()));
        }
        change(&mut record);
        self.store.replace(&record).await
    }

    /// Returns a progress view for `phase`.
    #[must_use]
    pub fn phase(self: &Arc<Self>, phase: Phase) -> ProgressHandle {
        ProgressHandle {
            writer: Arc::clone(self),
            phase,
        }
    }

    /// Marks the job `finished` with its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record is already terminal or cannot be written.
    pub async fn finish(&self, outcome: JobOutcome) -> Result<(), StoreError> {
        let message = if outcome.failed_fixity.is_empty() {
            "Job completed successfully.".to_string()
        } else {
            format!(
                "Job completed successfully, but {} file(s) failed fixity check.",
                outcome.failed_fixity.len()
            )
        };
        self.update(move |record| {
            record.status = JobStatus::Finished;
            record.status_code = Some(200);
            record.message = message;
            record.result = Some(outcome);
        })
        .await?;
        debug!(ticket_id = %self.ticket_id, "job finished");
        Ok(())
    }

    /// Marks the job `failed` with a status code and message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record is already terminal or cannot be written.
    pub async fn fail(&self, status_code: u16, message: impl Into<String>) -> Result<(), StoreError> {
        let message = message.into();
        self.update(move |record| {
            record.status = JobStatus::Failed;
            record.status_code = Some(status_code);
            record.message = message;
            record.result = None;
        })
        .await?;
        debug!(ticket_id = %self.ticket_id, status_code, "job failed");
        Ok(())
    }
}

/// Progress updates for one phase of a running job.
///
/// Counter writes are advisory: a failed write is logged and the job keeps
/// running.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    writer: Arc<JobWriter>,
    phase: Phase,
}

impl ProgressHandle {
    /// Sets the phase total. Only the first call takes effect.
    pub async fn set_total(&self, total: u64) {
        let phase = self.phase;
        self.apply(move |record| {
            let progress = record.phase_mut(phase);
            if progress.total_files.is_none() {
                progress.total_files = Some(total.max(progress.files_finished));
            }
        })
        .await;
    }

    /// Advances the phase counter by one, never past the total.
    pub async fn increment(&self) {
        let phase = self.phase;
        self.apply(move |record| {
            let progress = record.phase_mut(phase);
            let next = progress.files_finished.saturating_add(1);
            if progress.total_files.is_none_or(|total| next <= total) {
                progress.files_finished = next;
            }
        })
        .await;
    }

    /// Sets the phase message and mirrors it as the record's top-level message.
    pub async fn set_message(&self, message: impl Into<String>) {
        let phase = self.phase;
        let message = message.into();
        self.apply(move |record| {
            record.phase_mut(phase).message.clone_from(&message);
            record.message = message;
        })
        .await;
    }

    async fn apply<F>(&self, change: F)
    where
        F: FnOnce(&mut ProgressRecord) + Send,
    {
        if let Err(err) = self.writer.update(change).await {
            warn!(ticket_id = %self.writer.ticket_id, phase = ?self.phase, error = %err, "progress update dropped");
        }
    }
}
