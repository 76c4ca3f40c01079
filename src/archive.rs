//! Deterministic bag layout for downloaded resources.
//!
//! A download produces:
//!
//! ```text
//! <base>/data/<relative_path>        one per fetched file
//! <base>/data/<empty container>/     one per empty container
//! <base>/fixity_info.json            JSON array of fixity entries
//! <base>/action_metadata.json        {"allKeywords": [], "actions": [...]}
//! ```
//!
//! The layout is computed and validated once, then written either as a zip
//! (download) or as a staging directory (transfer).

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::fixity::{FetchedFile, FixityReport};

/// Name of the fixity manifest inside the bag.
pub const FIXITY_FILE_NAME: &str = "fixity_info.json";
/// Name of the action metadata file inside the bag.
pub const METADATA_FILE_NAME: &str = "action_metadata.json";
/// Payload directory inside the bag.
pub const DATA_DIR: &str = "data";

/// Errors raised while laying out, writing or reading archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Filesystem failure.
    #[error("archive I/O failed at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Zip encoding or decoding failure.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Manifest serialization failure.
    #[error("failed to serialize archive metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Two files resolved to the same path.
    #[error("duplicate path in archive: {0}")]
    DuplicatePath(String),

    /// A path component would escape the bag.
    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),

    /// A file path is also used as a folder by another entry.
    #[error("path is both a file and a folder in archive: {0}")]
    PathConflict(String),

    /// The fixity manifest and the `data/` payload disagree.
    #[error(
        "fixity manifest does not match payload (missing from manifest: {missing_from_manifest:?}, missing from data: {missing_from_data:?})"
    )]
    ManifestMismatch {
        /// Payload files without a manifest entry.
        missing_from_manifest: Vec<String>,
        /// Manifest entries without a payload file.
        missing_from_data: Vec<String>,
    },
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Files and empty containers collected by a download.
#[derive(Debug, Clone, Default)]
pub struct DownloadBundle {
    /// Source provider name.
    pub provider: String,
    /// Requested resource id.
    pub resource_id: String,
    /// Fetched files, in traversal order.
    pub files: Vec<FetchedFile>,
    /// Paths of containers that had no children.
    pub empty_containers: Vec<String>,
}

/// Per-file record in the action metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFile {
    /// File name.
    pub title: String,
    /// Path on the source side.
    pub source_path: String,
    /// Hashes known for the file.
    pub source_hashes: BTreeMap<String, String>,
    /// Provider metadata passed through.
    pub extra_metadata: BTreeMap<String, serde_json::Value>,
}

/// One action entry in `action_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    /// Unique id of the action (the job ticket).
    pub id: String,
    /// When the action completed.
    pub action_date_time: DateTime<Utc>,
    /// "resource_download", "resource_upload" or "resource_transfer_in".
    pub action_type: String,
    /// Source provider name.
    pub source_target_name: String,
    /// Account on the source provider.
    pub source_username: String,
    /// Destination provider name ("local" for downloads).
    pub destination_target_name: String,
    /// Account on the destination, if any.
    pub destination_username: Option<String>,
    /// Keyword enrichment results, an empty object unless supplied.
    pub keyword_enhancements: serde_json::Value,
    /// Files moved by the action.
    pub files: Vec<ActionFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile<'a> {
    all_keywords: Vec<String>,
    actions: Vec<&'a ActionMetadata>,
}

/// Returns the bag directory name for a download.
#[must_use]
pub fn bag_name(provider: &str, resource_id: &str) -> String {
    sanitize_component(&format!("{provider}_download_{resource_id}"))
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Rejects `path` when one of its parent folders is a file in `files`.
fn ensure_no_file_ancestor(path: &str, files: &BTreeSet<&str>) -> Result<(), ArchiveError> {
    let mut ancestors = path.match_indices('/').map(|(at, _)| &path[..at]);
    match ancestors.find(|ancestor| files.contains(ancestor)) {
        Some(file) => Err(ArchiveError::PathConflict(file.to_string())),
        None => Ok(()),
    }
}

fn validate_relative(path: &str) -> Result<(), ArchiveError> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(ArchiveError::UnsafePath(path.to_string()));
    }
    if trimmed
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(ArchiveError::UnsafePath(path.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum Entry {
    Directory(String),
    File { name: String, bytes: Vec<u8> },
}

/// A validated bag ready to be written.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    base: String,
    entries: Vec<Entry>,
}

/// Computes bag layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveAssembler;

impl ArchiveAssembler {
    /// Validates the bundle against its fixity report and computes the layout.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::UnsafePath`], [`ArchiveError::DuplicatePath`] or
    /// [`ArchiveError::PathConflict`] for bad payload paths, [`ArchiveError::ManifestMismatch`] when the
    /// report and payload disagree, and [`ArchiveError::Serialize`] if the
    /// metadata cannot be encoded.
    #[instrument(skip_all, fields(provider = %bundle.provider, resource_id = %bundle.resource_id, files = bundle.files.len()))]
    pub fn assemble(
        bundle: DownloadBundle,
        fixity: &FixityReport,
        metadata: &ActionMetadata,
    ) -> Result<ArchiveLayout, ArchiveError> {
        let base = bag_name(&bundle.provider, &bundle.resource_id);

        let mut data_paths = BTreeSet::new();
        for file in &bundle.files {
            validate_relative(&file.relative_path)?;
            if !data_paths.insert(file.relative_path.as_str()) {
                return Err(ArchiveError::DuplicatePath(file.relative_path.clone()));
            }
        }
        for path in &data_paths {
            ensure_no_file_ancestor(path, &data_paths)?;
        }

        let manifest_paths: BTreeSet<&str> = fixity.entries.iter().map(|e| e.path.as_str()).collect();
        if manifest_paths.len() != fixity.entries.len() || manifest_paths != data_paths {
            return Err(ArchiveError::ManifestMismatch {
                missing_from_manifest: data_paths
                    .difference(&manifest_paths)
                    .map(|p| (*p).to_string())
                    .collect(),
                missing_from_data: manifest_paths
                    .difference(&data_paths)
                    .map(|p| (*p).to_string())
                    .collect(),
            });
        }

        let mut entries = Vec::with_capacity(bundle.files.len() + bundle.empty_containers.len() + 2);
        let mut directories = BTreeSet::new();
        for marker in &bundle.empty_containers {
            validate_relative(marker)?;
            let marker = marker.trim_end_matches('/');
            ensure_no_file_ancestor(marker, &data_paths)?;
            if data_paths.contains(marker) || !directories.insert(marker.to_string()) {
                return Err(ArchiveError::DuplicatePath(marker.to_string()));
            }
        }
        for directory in directories {
            entries.push(Entry::Directory(format!("{base}/{DATA_DIR}/{directory}/")));
        }
        for file in bundle.files {
            entries.push(Entry::File {
                name: format!("{base}/{DATA_DIR}/{}", file.relative_path),
                bytes: file.bytes,
            });
        }

        entries.push(Entry::File {
            name: format!("{base}/{FIXITY_FILE_NAME}"),
            bytes: serde_json::to_vec_pretty(&fixity.entries)?,
        });
        entries.push(Entry::File {
            name: format!("{base}/{METADATA_FILE_NAME}"),
            bytes: serde_json::to_vec_pretty(&MetadataFile {
                all_keywords: Vec::new(),
                actions: vec![metadata],
            })?,
        });

        debug!(base = %base, entries = entries.len(), "archive layout computed");
        Ok(ArchiveLayout { base, entries })
    }
}

impl ArchiveLayout {
    /// Bag directory name.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Entry names in write order; directories end with `/`.
    #[must_use]
    pub fn entry_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|entry| match entry {
                Entry::Directory(name) | Entry::File { name, .. } => name.as_str(),
            })
            .collect()
    }

    /// Writes the bag as a zip file, replacing `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] on I/O or zip failures; the partial file is
    /// removed on failure.
    #[instrument(skip_all, fields(base = %self.base, path = %path.display()))]
    pub fn write_zip(&self, path: &Path) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }

        let mut partial: OsString = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let result = self.write_zip_to(&partial);
        if result.is_err() {
            let _ = fs::remove_file(&partial);
            return result;
        }
        fs::rename(&partial, path).map_err(|e| ArchiveError::io(path, e))?;
        debug!("zip archive written");
        Ok(())
    }

    fn write_zip_to(&self, path: &Path) -> Result<(), ArchiveError> {
        let file = File::create(path).map_err(|e| ArchiveError::io(path, e))?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in &self.entries {
            match entry {
                Entry::Directory(name) => zip.add_directory(name.as_str(), options)?,
                Entry::File { name, bytes } => {
                    zip.start_file(name.as_str(), options)?;
                    zip.write_all(bytes).map_err(|e| ArchiveError::io(path, e))?;
                }
            }
        }
        let mut file = zip.finish()?;
        file.flush().map_err(|e| ArchiveError::io(path, e))?;
        Ok(())
    }

    /// Writes the bag under `dir` and returns the path of its `data/` directory.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] on filesystem failures.
    #[instrument(skip_all, fields(base = %self.base, dir = %dir.display()))]
    pub fn write_directory(&self, dir: &Path) -> Result<PathBuf, ArchiveError> {
        let data_root = dir.join(&self.base).join(DATA_DIR);
        fs::create_dir_all(&data_root).map_err(|e| ArchiveError::io(&data_root, e))?;

        for entry in &self.entries {
            match entry {
                Entry::Directory(name) => {
                    let target = dir.join(name.trim_end_matches('/'));
                    fs::create_dir_all(&target).map_err(|e| ArchiveError::io(&target, e))?;
                }
                Entry::File { name, bytes } => {
                    let target = dir.join(name);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
                    }
                    fs::write(&target, bytes).map_err(|e| ArchiveError::io(&target, e))?;
                }
            }
        }
        Ok(data_root)
    }
}

/// Extracts a zip into `target` and returns the directory to upload from.
///
/// An archive produced by a download (`<base>/data/...` next to its fixity
/// and metadata files) is unwrapped to its `data/` directory; any other
/// archive is uploaded from `target` itself.
///
/// # Errors
///
/// Returns [`ArchiveError::UnsafePath`] for entries escaping `target`, and
/// [`ArchiveError::Zip`] or [`ArchiveError::Io`] on read failures.
#[instrument(skip_all, fields(archive = %archive.display(), target = %target.display()))]
pub fn extract_archive(archive: &Path, target: &Path) -> Result<PathBuf, ArchiveError> {
    let file = File::open(archive).map_err(|e| ArchiveError::io(archive, e))?;
    let mut zip = ZipArchive::new(file)?;
    fs::create_dir_all(target).map_err(|e| ArchiveError::io(target, e))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(ArchiveError::UnsafePath(entry.name().to_string()));
        };
        let destination = target.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| ArchiveError::io(&destination, e))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        let mut output = File::create(&destination).map_err(|e| ArchiveError::io(&destination, e))?;
        io::copy(&mut entry, &mut output).map_err(|e| ArchiveError::io(&destination, e))?;
    }

    Ok(upload_root(target))
}

/// True when `dir` holds a bag written by [`ArchiveLayout`].
fn is_bag(dir: &Path) -> bool {
    dir.join(DATA_DIR).is_dir()
        && dir.join(FIXITY_FILE_NAME).is_file()
        && dir.join(METADATA_FILE_NAME).is_file()
}

fn upload_root(extracted: &Path) -> PathBuf {
    if is_bag(extracted) {
        return extracted.join(DATA_DIR);
    }
    let Ok(entries) = fs::read_dir(extracted) else {
        return extracted.to_path_buf();
    };
    let top: Vec<PathBuf> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
    if let [only] = top.as_slice()
        && only.is_dir()
        && is_bag(only)
    {
        return only.join(DATA_DIR);
    }
    extracted.to_path_buf()
}
