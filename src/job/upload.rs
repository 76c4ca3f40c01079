//! Upload walk: mirror a local directory onto a destination provider.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::error::PipelineError;
use super::progress::ProgressHandle;
use super::record::{FileMetadata, JobOutcome};
use crate::fixity::{HashAlgorithm, hash_bytes};
use crate::provider::{
    ProviderCapability, ProviderError, ResourceNode, UploadStatus, list_all_children, list_all_roots,
};

/// What to do when a file with the same title already exists on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    /// Leave the existing file alone.
    Ignore,
    /// Overwrite the existing file.
    Update,
    /// Upload under a disambiguated title.
    #[default]
    Rename,
}

impl DuplicateAction {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Update => "update",
            Self::Rename => "rename",
        }
    }
}

impl fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DuplicateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "update" => Ok(Self::Update),
            "rename" => Ok(Self::Rename),
            other => Err(format!(
                "invalid duplicate action '{other}': expected ignore, update or rename"
            )),
        }
    }
}

/// Returns `title`, or a variant not present in `existing`.
///
/// The variant inserts the template (with `*` replaced by N) before the
/// extension when `keep_extension` is set. N is one more than the largest
/// number already used with the same pattern, so the result only depends on
/// the destination's current titles.
#[must_use]
pub fn disambiguate_title<S: AsRef<str>>(
    title: &str,
    existing: &[S],
    template: &str,
    keep_extension: bool,
) -> String {
    if !existing.iter().any(|t| t.as_ref() == title) {
        return title.to_string();
    }

    let (prefix, suffix) = template.split_once('*').unwrap_or((template, ""));
    let (stem, extension) = match title.rfind('.') {
        Some(dot) if keep_extension && dot > 0 => title.split_at(dot),
        _ => (title, ""),
    };

    let pattern = format!(
        "^{}{}(\\d+){}{}$",
        regex::escape(stem),
        regex::escape(prefix),
        regex::escape(suffix),
        regex::escape(extension)
    );
    let highest = Regex::new(&pattern).ok().and_then(|re| {
        existing
            .iter()
            .filter_map(|t| re.captures(t.as_ref())?.get(1)?.as_str().parse::<u64>().ok())
            .max()
    });
    let n = highest.map_or(1, |h| h + 1);
    format!("{stem}{prefix}{n}{suffix}{extension}")
}

/// Everything the upload walk needs.
#[derive(Clone, Copy)]
pub struct UploadPlan<'a> {
    /// Destination capability.
    pub provider: &'a dyn ProviderCapability,
    /// Destination token.
    pub token: &'a str,
    /// Existing destination container, or `None` to create new roots.
    pub resource_id: Option<&'a str>,
    /// Local directory whose contents are uploaded.
    pub source_dir: &'a Path,
    /// Algorithm compared against destination hashes.
    pub hash_algorithm: HashAlgorithm,
    /// Same-title policy.
    pub duplicate_action: DuplicateAction,
    /// Suffix template for renamed titles.
    pub title_template: &'a str,
    /// Upload phase counters.
    pub progress: Option<&'a ProgressHandle>,
}

struct WalkEntry {
    relative: String,
    absolute: PathBuf,
    is_dir: bool,
}

fn walk(source_dir: &Path) -> Result<Vec<WalkEntry>, PipelineError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PipelineError::io(source_dir, e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(WalkEntry {
            relative,
            absolute: entry.path().to_path_buf(),
            is_dir: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

fn split_parent(relative: &str) -> (&str, &str) {
    relative.rsplit_once('/').unwrap_or(("", relative))
}

/// Destination containers and their known children, filled lazily.
struct DestinationIndex<'a> {
    plan: UploadPlan<'a>,
    containers: HashMap<String, ResourceNode>,
    children: HashMap<String, Vec<ResourceNode>>,
}

impl DestinationIndex<'_> {
    async fn children_of(&mut self, container: &ResourceNode) -> Result<&mut Vec<ResourceNode>, ProviderError> {
        if !self.children.contains_key(&container.id) {
            let listed = list_all_children(self.plan.provider, self.plan.token, container).await?;
            self.children.insert(container.id.clone(), listed);
        }
        Ok(self.children.entry(container.id.clone()).or_default())
    }

    fn remember_new(&mut self, parent: Option<&ResourceNode>, node: &ResourceNode) {
        self.children.insert(node.id.clone(), Vec::new());
        if let Some(parent) = parent {
            self.children
                .entry(parent.id.clone())
                .or_default()
                .push(node.clone());
        }
    }
}

/// Uploads the contents of `plan.source_dir` and reports what happened.
///
/// # Errors
///
/// Returns [`PipelineError`] for authentication failures (which abort the
/// walk), a top-level file without a destination container, or local I/O
/// failures. Other per-file provider failures are recorded in
/// `resources_ignored` instead.
#[instrument(skip_all, fields(provider = plan.provider.name(), resource_id = ?plan.resource_id, duplicate_action = %plan.duplicate_action))]
pub async fn upload_tree(plan: UploadPlan<'_>) -> Result<JobOutcome, PipelineError> {
    let provider = plan.provider;
    let token = plan.token;
    let identity = provider.authenticate(token).await?;

    let entries = walk(plan.source_dir)?;
    let file_count = u64::try_from(entries.iter().filter(|e| !e.is_dir).count()).unwrap_or(u64::MAX);
    if let Some(progress) = plan.progress {
        progress.set_total(file_count).await;
        progress
            .set_message(format!("Uploading files to {}.", provider.name()))
            .await;
    }

    let mut outcome = JobOutcome {
        destination_username: Some(identity.username),
        ..JobOutcome::default()
    };
    let mut index = DestinationIndex {
        plan,
        containers: HashMap::new(),
        children: HashMap::new(),
    };

    let mut root_titles: Vec<String> = Vec::new();
    match plan.resource_id {
        Some(id) => {
            let target = provider.fetch_resource(token, id).await?;
            if !target.is_container() {
                return Err(ProviderError::bad_request(format!(
                    "Resource with id '{id}' is not a container and cannot hold uploads."
                ))
                .into());
            }
            outcome.destination_resource_ids.push(target.id.clone());
            index.containers.insert(String::new(), target);
        }
        None => {
            if let Some(file) = entries.iter().find(|e| !e.is_dir && !e.relative.contains('/')) {
                return Err(ProviderError::bad_request(format!(
                    "'{}' is a top-level file; files must be uploaded into an existing container or inside a folder.",
                    file.relative
                ))
                .into());
            }
            root_titles = match list_all_roots(provider, token).await {
                Ok(roots) => roots.into_iter().map(|n| n.title).collect(),
                Err(ProviderError::Unsupported { .. }) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
        }
    }

    for entry in entries {
        let (parent_rel, name) = split_parent(&entry.relative);
        let parent = index.containers.get(parent_rel).cloned();

        if entry.is_dir {
            let node = match parent {
                None => {
                    let title = disambiguate_title(name, &root_titles, plan.title_template, false);
                    let node = provider.create_container(token, None, &title).await?;
                    info!(title = %node.title, id = %node.id, "created destination root");
                    root_titles.push(node.title.clone());
                    outcome.destination_resource_ids.push(node.id.clone());
                    index.remember_new(None, &node);
                    node
                }
                Some(parent) => {
                    let existing = index
                        .children_of(&parent)
                        .await?
                        .iter()
                        .find(|n| n.is_container() && n.title == name)
                        .cloned();
                    match existing {
                        Some(node) => node,
                        None => {
                            let node = provider.create_container(token, Some(&parent), name).await?;
                            debug!(path = %entry.relative, id = %node.id, "created destination container");
                            index.remember_new(Some(&parent), &node);
                            node
                        }
                    }
                }
            };
            index.containers.insert(entry.relative.clone(), node);
            continue;
        }

        let Some(parent) = parent else {
            // Unreachable: top-level files were rejected above and walkdir
            // yields every directory before its contents.
            outcome.resources_ignored.push(entry.relative.clone());
            continue;
        };

        let bytes = tokio::fs::read(&entry.absolute)
            .await
            .map_err(|e| PipelineError::io(&entry.absolute, e))?;
        let result = upload_one(&mut index, &parent, name, &bytes, &entry.relative, &mut outcome).await;
        if let Err(err) = result {
            if err.is_auth() {
                return Err(err.into());
            }
            warn!(path = %entry.relative, error = %err, "file upload failed; skipping");
            outcome.resources_ignored.push(entry.relative.clone());
        }
        if let Some(progress) = plan.progress {
            progress.increment().await;
        }
    }

    info!(
        uploaded = outcome.file_metadata.len(),
        ignored = outcome.resources_ignored.len(),
        updated = outcome.resources_updated.len(),
        "upload walk complete"
    );
    Ok(outcome)
}

async fn upload_one(
    index: &mut DestinationIndex<'_>,
    parent: &ResourceNode,
    name: &str,
    bytes: &[u8],
    relative: &str,
    outcome: &mut JobOutcome,
) -> Result<(), ProviderError> {
    let plan = index.plan;
    let siblings = index.children_of(parent).await?;
    let existing = siblings
        .iter()
        .find(|n| !n.is_container() && n.title == name)
        .cloned();

    let (title, overwrite) = match (&existing, plan.duplicate_action) {
        (None, _) => (name.to_string(), None),
        (Some(_), DuplicateAction::Ignore) => {
            debug!(path = relative, "duplicate ignored");
            outcome.resources_ignored.push(relative.to_string());
            return Ok(());
        }
        (Some(existing), DuplicateAction::Update) => (name.to_string(), Some(existing)),
        (Some(_), DuplicateAction::Rename) => {
            let titles: Vec<&str> = siblings.iter().map(|n| n.title.as_str()).collect();
            (disambiguate_title(name, &titles, plan.title_template, true), None)
        }
    };

    let uploaded = plan
        .provider
        .upload_file(plan.token, parent, &title, bytes, overwrite)
        .await?;

    match uploaded.status {
        UploadStatus::Unchanged => {
            outcome.resources_ignored.push(relative.to_string());
            return Ok(());
        }
        UploadStatus::Updated => outcome.resources_updated.push(relative.to_string()),
        UploadStatus::Created => {}
    }
    if existing.is_none() || plan.duplicate_action == DuplicateAction::Rename {
        index
            .children
            .entry(parent.id.clone())
            .or_default()
            .push(uploaded.node.clone());
    }

    let algorithm = plan.hash_algorithm.as_str();
    let destination_hash = uploaded.destination_hashes.get(algorithm).cloned();
    if let Some(reported) = &destination_hash {
        let local = hash_bytes(plan.hash_algorithm, bytes);
        if !reported.eq_ignore_ascii_case(&local) {
            warn!(path = relative, algorithm, "destination hash does not match uploaded bytes");
            outcome.failed_fixity.push(relative.to_string());
        }
    }

    outcome.file_metadata.push(FileMetadata {
        action_root_path: format!("/{relative}"),
        destination_path: uploaded.destination_path,
        title: uploaded.node.title,
        destination_hash,
    });
    Ok(())
}
