//! Declared provider capabilities loaded from `targets.json`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::registry::RegistryError;
use super::Action;

/// Built-in targets shipped with the binary.
const DEFAULT_TARGETS_JSON: &str = include_str!("../../targets.json");

/// Supported-action flags for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedActions {
    /// Listing every resource visible to a token.
    #[serde(default)]
    pub resource_collection: bool,
    /// Describing a single resource.
    #[serde(default)]
    pub resource_detail: bool,
    /// Downloading resources.
    #[serde(default)]
    pub resource_download: bool,
    /// Uploading resources.
    #[serde(default)]
    pub resource_upload: bool,
}

impl SupportedActions {
    /// Returns whether `action` is declared.
    #[must_use]
    pub fn supports(&self, action: Action) -> bool {
        match action {
            Action::ResourceCollection => self.resource_collection,
            Action::ResourceDetail => self.resource_detail,
            Action::ResourceDownload => self.resource_download,
            Action::ResourceUpload => self.resource_upload,
        }
    }

    /// Returns every declared action.
    #[must_use]
    pub fn declared(&self) -> Vec<Action> {
        Action::ALL
            .into_iter()
            .filter(|action| self.supports(*action))
            .collect()
    }
}

/// One provider entry from `targets.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Registry key.
    pub name: String,
    /// Display name.
    #[serde(default)]
    pub readable_name: String,
    /// Declared actions.
    pub supported_actions: SupportedActions,
    /// Hash algorithms the provider reports, in preference order.
    #[serde(default)]
    pub supported_hash_algorithms: Vec<String>,
}

/// Parses a JSON array of target specs.
///
/// # Errors
///
/// Returns [`RegistryError::Config`] for malformed JSON and
/// [`RegistryError::DuplicateTarget`] when a name repeats.
pub fn parse_targets(raw: &str) -> Result<Vec<TargetSpec>, RegistryError> {
    let targets: Vec<TargetSpec> =
        serde_json::from_str(raw).map_err(|e| RegistryError::Config(e.to_string()))?;

    let mut names = HashSet::new();
    for target in &targets {
        if target.name.trim().is_empty() {
            return Err(RegistryError::Config(
                "target name must not be empty".to_string(),
            ));
        }
        if !names.insert(target.name.as_str()) {
            return Err(RegistryError::DuplicateTarget(target.name.clone()));
        }
    }
    Ok(targets)
}

/// Loads target specs from a file.
///
/// # Errors
///
/// Returns [`RegistryError::Config`] if the file cannot be read or parsed.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_targets(path: &Path) -> Result<Vec<TargetSpec>, RegistryError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| RegistryError::Config(format!("{}: {e}", path.display())))?;
    let targets = parse_targets(&raw)?;
    debug!(count = targets.len(), "loaded targets");
    Ok(targets)
}

/// Returns the built-in target specs.
///
/// # Errors
///
/// Returns [`RegistryError`] only if the embedded file is malformed.
pub fn default_targets() -> Result<Vec<TargetSpec>, RegistryError> {
    parse_targets(DEFAULT_TARGETS_JSON)
}
