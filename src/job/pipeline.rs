//! Background pipelines for download, upload and transfer jobs.
//!
//! Each pipeline runs on one worker task and reports progress through
//! [`ProgressHandle`]s. Errors are returned to the worker, which writes them
//! into the terminal `failed` record.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, instrument, warn};

use super::error::PipelineError;
use super::progress::{JobWriter, ProgressHandle};
use super::record::{ArtifactRef, JobOutcome, Phase};
use super::upload::{DuplicateAction, UploadPlan, upload_tree};
use crate::archive::{ActionFile, ActionMetadata, ArchiveAssembler, DownloadBundle, extract_archive};
use crate::fixity::{FetchedFile, FixityReport, FixityVerifier, HashAlgorithm};
use crate::provider::{ProviderCapability, ProviderIdentity, ResourceNode};
use crate::settings::EngineSettings;
use crate::tree::ResourceTreeBuilder;

/// Local input for an upload job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPayload {
    /// Upload the contents of a directory.
    Directory(PathBuf),
    /// Extract a zip and upload its contents; a bag produced by a download is
    /// unwrapped to its `data/` directory.
    Archive(PathBuf),
}

/// Inputs for one download collection.
#[derive(Clone, Copy)]
pub struct DownloadRequest<'a> {
    /// Source capability.
    pub provider: &'a dyn ProviderCapability,
    /// Source token.
    pub token: &'a str,
    /// Resource to download.
    pub resource_id: &'a str,
    /// Bound on concurrent provider calls.
    pub fan_out: usize,
    /// Algorithm computed when the provider supplies none.
    pub default_algorithm: HashAlgorithm,
    /// `fetch` phase counters.
    pub fetch_progress: Option<&'a ProgressHandle>,
    /// `download` phase counters.
    pub download_progress: Option<&'a ProgressHandle>,
}

/// Everything fetched for a download, verified and ready to package.
#[derive(Debug)]
pub struct CollectedDownload {
    /// Account on the source provider.
    pub identity: ProviderIdentity,
    /// Requested resource.
    pub root: ResourceNode,
    /// Files and empty containers.
    pub bundle: DownloadBundle,
    /// Fixity results for `bundle.files`.
    pub fixity: FixityReport,
}

fn path_component(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" => "untitled".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

/// Computes the slash-separated path of every node, rooted at the first node.
fn node_paths(nodes: &[ResourceNode]) -> HashMap<&str, String> {
    let mut paths: HashMap<&str, String> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        let component = path_component(&node.title);
        let path = match node.container_id.as_deref().and_then(|parent| paths.get(parent)) {
            Some(parent_path) => format!("{parent_path}/{component}"),
            None => component,
        };
        paths.insert(node.id.as_str(), path);
    }
    paths
}

/// Fetches a resource (and its subtree) from the source provider.
///
/// # Errors
///
/// Returns [`PipelineError`] for the first provider or traversal failure;
/// partial results are discarded.
#[instrument(skip_all, fields(provider = request.provider.name(), resource_id = request.resource_id))]
pub async fn collect_download(request: DownloadRequest<'_>) -> Result<CollectedDownload, PipelineError> {
    let provider = request.provider;
    let token = request.token;

    let identity = provider.authenticate(token).await?;
    if let Some(progress) = request.fetch_progress {
        progress.set_message("Collecting resources to download.").await;
    }

    let root = provider.fetch_resource(token, request.resource_id).await?;
    let nodes = if root.is_container() {
        ResourceTreeBuilder::new(request.fan_out)
            .build_from(provider, token, &root, request.fetch_progress)
            .await?
    } else {
        let mut single = root.clone();
        single.container_id = None;
        vec![single]
    };

    let paths = node_paths(&nodes);
    let has_children: HashSet<&str> = nodes.iter().filter_map(|n| n.container_id.as_deref()).collect();
    let empty_containers: Vec<String> = nodes
        .iter()
        .filter(|n| n.is_container() && !has_children.contains(n.id.as_str()))
        .filter_map(|n| paths.get(n.id.as_str()).cloned())
        .collect();

    let items: Vec<(&ResourceNode, String)> = nodes
        .iter()
        .filter(|n| !n.is_container())
        .filter_map(|n| Some((n, paths.get(n.id.as_str())?.clone())))
        .collect();

    let download_progress = request.download_progress;
    if let Some(progress) = download_progress {
        progress.set_total(u64::try_from(items.len()).unwrap_or(u64::MAX)).await;
        progress.set_message("Downloading files from Source Target.").await;
    }
    debug!(files = items.len(), empty = empty_containers.len(), "fetching files");

    // Built eagerly so the spawned job future stays `Send`.
    let fetches: Vec<_> = items
        .into_iter()
        .map(|(item, path)| fetch_item(provider, token, item, path, download_progress))
        .collect();
    let mut files: Vec<FetchedFile> = stream::iter(fetches)
        .buffered(request.fan_out.max(1))
        .try_collect()
        .await?;

    let fixity = FixityVerifier::new(request.default_algorithm).verify(&mut files);
    if !fixity.mismatches.is_empty() {
        warn!(count = fixity.mismatches.len(), "downloaded files failed fixity");
    }

    Ok(CollectedDownload {
        identity,
        root,
        bundle: DownloadBundle {
            provider: provider.name().to_string(),
            resource_id: request.resource_id.to_string(),
            files,
            empty_containers,
        },
        fixity,
    })
}

async fn fetch_item(
    provider: &dyn ProviderCapability,
    token: &str,
    item: &ResourceNode,
    path: String,
    progress: Option<&ProgressHandle>,
) -> Result<FetchedFile, PipelineError> {
    let content = provider.fetch_file(token, item).await?;
    if let Some(progress) = progress {
        progress.increment().await;
    }
    Ok(FetchedFile::from_content(&item.title, path, content))
}

fn action_metadata(
    ticket_id: &str,
    action_type: &str,
    collected: &CollectedDownload,
    destination: (&str, Option<String>),
) -> ActionMetadata {
    ActionMetadata {
        id: ticket_id.to_string(),
        action_date_time: Utc::now(),
        action_type: action_type.to_string(),
        source_target_name: collected.bundle.provider.clone(),
        source_username: collected.identity.username.clone(),
        destination_target_name: destination.0.to_string(),
        destination_username: destination.1,
        keyword_enhancements: serde_json::json!({}),
        files: collected
            .bundle
            .files
            .iter()
            .map(|file| ActionFile {
                title: file.title.clone(),
                source_path: format!("/{}", file.relative_path),
                source_hashes: file.hashes.clone(),
                extra_metadata: file.extra_metadata.clone(),
            })
            .collect(),
    }
}

/// Per-job directory under the engine's jobs dir.
#[must_use]
pub fn job_dir(settings: &EngineSettings, ticket_id: &str) -> PathBuf {
    settings.jobs_dir.join(ticket_id)
}

/// Work resolved at submission time and executed by a worker.
pub(crate) enum JobWork {
    Download {
        source: Arc<dyn ProviderCapability>,
        token: String,
        resource_id: String,
    },
    Upload {
        destination: Arc<dyn ProviderCapability>,
        token: String,
        resource_id: Option<String>,
        payload: UploadPayload,
        duplicate_action: DuplicateAction,
        hash_algorithm: HashAlgorithm,
    },
    Transfer {
        source: Arc<dyn ProviderCapability>,
        destination: Arc<dyn ProviderCapability>,
        source_token: String,
        destination_token: String,
        resource_id: String,
        destination_resource_id: Option<String>,
        duplicate_action: DuplicateAction,
        hash_algorithm: HashAlgorithm,
    },
}

/// Runs one job to its outcome.
pub(crate) async fn execute(
    settings: &EngineSettings,
    writer: &Arc<JobWriter>,
    work: JobWork,
) -> Result<JobOutcome, PipelineError> {
    let ticket_id = writer.ticket_id().to_string();
    let fetch = writer.phase(Phase::Fetch);
    let download = writer.phase(Phase::Download);
    let upload = writer.phase(Phase::Upload);
    let workdir = job_dir(settings, &ticket_id);

    match work {
        JobWork::Download {
            source,
            token,
            resource_id,
        } => {
            let collected = collect_download(DownloadRequest {
                provider: source.as_ref(),
                token: &token,
                resource_id: &resource_id,
                fan_out: settings.fan_out_concurrency,
                default_algorithm: settings.default_hash_algorithm,
                fetch_progress: Some(&fetch),
                download_progress: Some(&download),
            })
            .await?;
            download.set_message("Packaging download.").await;
            write_download_zip(&ticket_id, collected, &workdir).await
        }
        JobWork::Upload {
            destination,
            token,
            resource_id,
            payload,
            duplicate_action,
            hash_algorithm,
        } => {
            let (source_dir, extracted) = match payload {
                UploadPayload::Directory(path) => (path, None),
                UploadPayload::Archive(path) => {
                    let target = workdir.join("extracted");
                    let extract_into = target.clone();
                    let extracted =
                        tokio::task::spawn_blocking(move || extract_archive(&path, &extract_into)).await?;
                    match extracted {
                        Ok(root) => (root, Some(target)),
                        Err(err) => {
                            remove_scratch(&target).await;
                            return Err(err.into());
                        }
                    }
                }
            };
            let uploaded = upload_tree(UploadPlan {
                provider: destination.as_ref(),
                token: &token,
                resource_id: resource_id.as_deref(),
                source_dir: &source_dir,
                hash_algorithm,
                duplicate_action,
                title_template: &settings.duplicate_title_template,
                progress: Some(&upload),
            })
            .await;
            if let Some(target) = extracted {
                remove_scratch(&target).await;
            }
            uploaded
        }
        JobWork::Transfer {
            source,
            destination,
            source_token,
            destination_token,
            resource_id,
            destination_resource_id,
            duplicate_action,
            hash_algorithm,
        } => {
            let collected = collect_download(DownloadRequest {
                provider: source.as_ref(),
                token: &source_token,
                resource_id: &resource_id,
                fan_out: settings.fan_out_concurrency,
                default_algorithm: hash_algorithm,
                fetch_progress: Some(&fetch),
                download_progress: Some(&download),
            })
            .await?;
            let download_failures = collected.fixity.failed_paths();

            let destination_identity = destination.authenticate(&destination_token).await?;
            let metadata = action_metadata(
                &ticket_id,
                "resource_transfer_in",
                &collected,
                (destination.name(), Some(destination_identity.username)),
            );
            let staging = workdir.join("staging");
            let layout = ArchiveAssembler::assemble(collected.bundle, &collected.fixity, &metadata)?;
            let staging_for_write = staging.clone();
            let written =
                tokio::task::spawn_blocking(move || layout.write_directory(&staging_for_write)).await?;
            let data_root = match written {
                Ok(root) => root,
                Err(err) => {
                    remove_scratch(&staging).await;
                    return Err(err.into());
                }
            };

            let uploaded = upload_tree(UploadPlan {
                provider: destination.as_ref(),
                token: &destination_token,
                resource_id: destination_resource_id.as_deref(),
                source_dir: &data_root,
                hash_algorithm,
                duplicate_action,
                title_template: &settings.duplicate_title_template,
                progress: Some(&upload),
            })
            .await;
            remove_scratch(&staging).await;

            let mut outcome = uploaded?;
            for path in download_failures {
                if !outcome.failed_fixity.contains(&path) {
                    outcome.failed_fixity.push(path);
                }
            }
            Ok(outcome)
        }
    }
}

async fn write_download_zip(
    ticket_id: &str,
    collected: CollectedDownload,
    workdir: &Path,
) -> Result<JobOutcome, PipelineError> {
    let metadata = action_metadata(ticket_id, "resource_download", &collected, ("local", None));
    let failed_fixity = collected.fixity.failed_paths();
    let layout = ArchiveAssembler::assemble(collected.bundle, &collected.fixity, &metadata)?;

    let file_name = format!("{}.zip", layout.base());
    let zip_path = workdir.join(&file_name);
    let target = zip_path.clone();
    tokio::task::spawn_blocking(move || layout.write_zip(&target)).await??;
    info!(path = %zip_path.display(), root = %collected.root.title, "download archive ready");

    Ok(JobOutcome {
        artifact: Some(ArtifactRef {
            path: zip_path,
            file_name,
            content_type: "application/zip".to_string(),
        }),
        failed_fixity,
        ..JobOutcome::default()
    })
}

/// Removes a job's extraction or staging directory.
async fn remove_scratch(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %dir.display(), error = %err, "failed to remove job scratch directory");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_node_paths_follow_parents() {
        let nodes = vec![
            ResourceNode::container("r", "project", "Proj"),
            ResourceNode::container("d", "folder", "a/b").within("r"),
            ResourceNode::item("f", "file", "x.txt").within("d"),
        ];
        let paths = node_paths(&nodes);
        assert_eq!(paths["r"], "Proj");
        assert_eq!(paths["d"], "Proj/a_b");
        assert_eq!(paths["f"], "Proj/a_b/x.txt");
    }

    #[test]
    fn test_path_component_rejects_dot_segments() {
        assert_eq!(path_component(".."), "__");
        assert_eq!(path_component("  "), "untitled");
        assert_eq!(path_component("ok name"), "ok name");
    }
}
