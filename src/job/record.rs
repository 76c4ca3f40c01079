//! Job ticket and progress record types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a ticket tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Provider to local zip.
    Download,
    /// Local directory or archive to provider.
    Upload,
    /// Provider to provider.
    Transfer,
}

impl JobAction {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "upload" => Ok(Self::Upload),
            "transfer" => Ok(Self::Transfer),
            _ => Err(format!("invalid job action: {s}")),
        }
    }
}

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Work is still running.
    InProgress,
    /// Work completed; `result` is set.
    Finished,
    /// Work stopped on an error; `status_code` and `message` explain why.
    Failed,
}

impl JobStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `finished` and `failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Progress-tracked phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Listing the resource tree.
    Fetch,
    /// Fetching file bytes.
    Download,
    /// Writing to the destination.
    Upload,
}

/// Durable identity of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    /// UUID v4; the store key.
    pub ticket_id: String,
    /// What the job does.
    pub action: JobAction,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the record becomes eligible for cleanup.
    pub expires_at: DateTime<Utc>,
    /// Provider read from (upload jobs record the destination here too).
    pub source_provider: String,
    /// Provider written to, for upload and transfer.
    pub destination_provider: Option<String>,
    /// SHA-256 hex of the requesting token(s).
    pub token_hash: String,
}

impl JobTicket {
    /// Allocates a new ticket expiring `retention_days` from now.
    #[must_use]
    pub fn issue(
        action: JobAction,
        source_provider: impl Into<String>,
        destination_provider: Option<String>,
        token_hash: String,
        retention_days: u32,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            ticket_id: Uuid::new_v4().to_string(),
            action,
            created_at,
            expires_at: created_at + Duration::days(i64::from(retention_days)),
            source_provider: source_provider.into(),
            destination_provider,
            token_hash,
        }
    }
}

/// Counters for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// Number of units expected; set once.
    pub total_files: Option<u64>,
    /// Units completed; never decreases and never exceeds `total_files`.
    pub files_finished: u64,
    /// Latest phase message.
    pub message: String,
}

/// Reference to a produced zip file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Absolute path on the host.
    pub path: PathBuf,
    /// Suggested download file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
}

/// Per-file confirmation from an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Path relative to the uploaded root.
    pub action_root_path: String,
    /// Path reported by the destination.
    pub destination_path: String,
    /// File name on the destination.
    pub title: String,
    /// Destination hash for the selected algorithm, if reported.
    pub destination_hash: Option<String>,
}

/// Result payload of a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Zip produced by a download.
    pub artifact: Option<ArtifactRef>,
    /// Top-level destination resources created or written.
    pub destination_resource_ids: Vec<String>,
    /// Paths skipped by the duplicate policy or failing individually.
    pub resources_ignored: Vec<String>,
    /// Paths overwritten on the destination.
    pub resources_updated: Vec<String>,
    /// Paths whose hash did not verify.
    pub failed_fixity: Vec<String>,
    /// Username on the destination provider.
    pub destination_username: Option<String>,
    /// Per-file upload confirmations.
    pub file_metadata: Vec<FileMetadata>,
}

/// The pollable record for one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Ticket identity.
    pub ticket: JobTicket,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Semantic status code, set on terminal transition.
    pub status_code: Option<u16>,
    /// Latest top-level message.
    pub message: String,
    /// Per-phase counters.
    pub phases: BTreeMap<Phase, PhaseProgress>,
    /// Success payload.
    pub result: Option<JobOutcome>,
}

impl ProgressRecord {
    /// Creates the initial `in_progress` record for a ticket.
    #[must_use]
    pub fn new(ticket: JobTicket) -> Self {
        let phases = match ticket.action {
            JobAction::Download => vec![Phase::Fetch, Phase::Download],
            JobAction::Upload => vec![Phase::Upload],
            JobAction::Transfer => vec![Phase::Fetch, Phase::Download, Phase::Upload],
        };
        Self {
            ticket,
            status: JobStatus::InProgress,
            status_code: None,
            message: "In progress".to_string(),
            phases: phases
                .into_iter()
                .map(|phase| (phase, PhaseProgress::default()))
                .collect(),
            result: None,
        }
    }

    /// Returns the counters for `phase`, creating them if absent.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseProgress {
        self.phases.entry(phase).or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_strings() {
        for status in [JobStatus::InProgress, JobStatus::Finished, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_issue_sets_uuid_and_retention() {
        let ticket = JobTicket::issue(JobAction::Download, "github", None, "h".to_string(), 5);
        assert!(Uuid::parse_str(&ticket.ticket_id).is_ok());
        assert_eq!(ticket.expires_at - ticket.created_at, Duration::days(5));
    }

    #[test]
    fn test_new_record_has_phases_for_action() {
        let ticket = JobTicket::issue(JobAction::Transfer, "a", Some("b".to_string()), String::new(), 5);
        let record = ProgressRecord::new(ticket);
        assert_eq!(record.status, JobStatus::InProgress);
        assert_eq!(
            record.phases.keys().copied().collect::<Vec<_>>(),
            vec![Phase::Fetch, Phase::Download, Phase::Upload]
        );
    }

    #[test]
    fn test_file_metadata_serializes_camel_case() {
        let meta = FileMetadata {
            action_root_path: "/P/a.txt".to_string(),
            destination_path: "/repo/P/a.txt".to_string(),
            title: "a.txt".to_string(),
            destination_hash: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["actionRootPath"], "/P/a.txt");
        assert!(json["destinationHash"].is_null());
    }
}
