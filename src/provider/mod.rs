//! Provider capability interface and the registry that dispatches to it.
//!
//! The engine never speaks a provider's wire format. Each provider plugs in by
//! implementing [`ProviderCapability`], and the [`CapabilityRegistry`] maps a
//! `(provider name, action)` pair to the implementation declared for it in
//! the targets configuration.
//!
//! # Architecture
//!
//! - [`ProviderCapability`] - Async trait that individual providers implement
//! - [`CapabilityRegistry`] - `(name, action)` lookup table built at startup
//! - [`TargetSpec`] - Declared supported actions per provider (`targets.json`)
//! - [`GithubProvider`] - HTTP adapter for the GitHub REST API
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use transfer_core::provider::{
//!     Action, CapabilityRegistry, GithubProvider, ProviderCapability, default_targets,
//! };
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let github: Arc<dyn ProviderCapability> = Arc::new(GithubProvider::new()?);
//! let registry = CapabilityRegistry::build(default_targets()?, vec![github])?;
//! let capability = registry.resolve("github", Action::ResourceDownload)?;
//! println!("resolved {}", capability.name());
//! # Ok(())
//! # }
//! ```

mod error;
mod github;
mod registry;
mod targets;

pub use error::{INVALID_TOKEN_MESSAGE, ProviderError};
pub use github::{DEFAULT_API_BASE, GithubProvider};
pub use registry::{CapabilityRegistry, RegistryError};
pub use targets::{SupportedActions, TargetSpec, default_targets, load_targets, parse_targets};

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Whether a node can hold other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Project, repository, storage or folder.
    Container,
    /// A file.
    Item,
}

/// One entry in a normalized resource tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Provider-scoped opaque id.
    pub id: String,
    /// Container or item.
    pub kind: ResourceKind,
    /// Provider vocabulary for the kind ("project", "repo", "dir", "file").
    pub kind_name: String,
    /// Id of the parent node, if visible.
    pub container_id: Option<String>,
    /// Display title.
    pub title: String,
}

impl ResourceNode {
    /// Creates a container node.
    #[must_use]
    pub fn container(
        id: impl Into<String>,
        kind_name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ResourceKind::Container,
            kind_name: kind_name.into(),
            container_id: None,
            title: title.into(),
        }
    }

    /// Creates an item node.
    #[must_use]
    pub fn item(id: impl Into<String>, kind_name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ResourceKind::Item,
            kind_name: kind_name.into(),
            container_id: None,
            title: title.into(),
        }
    }

    /// Sets the parent reference.
    #[must_use]
    pub fn within(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Returns true for containers.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.kind == ResourceKind::Container
    }
}

/// One page of a child listing.
#[derive(Debug, Clone, Default)]
pub struct ChildPage {
    /// Nodes on this page.
    pub nodes: Vec<ResourceNode>,
    /// Cursor for the following page, if any.
    pub next: Option<String>,
}

impl ChildPage {
    /// Creates a final page.
    #[must_use]
    pub fn last(nodes: Vec<ResourceNode>) -> Self {
        Self { nodes, next: None }
    }
}

/// Bytes and provider metadata for one item.
#[derive(Debug, Clone, Default)]
pub struct FileContent {
    /// Raw file bytes.
    pub bytes: Vec<u8>,
    /// Provider-supplied hashes; `None` values mean the provider knows the
    /// algorithm but did not report a digest.
    pub hashes: BTreeMap<String, Option<String>>,
    /// Provider-specific metadata passed through unchanged.
    pub extra_metadata: BTreeMap<String, serde_json::Value>,
}

/// The account behind a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    /// Username reported by the provider.
    pub username: String,
}

/// Result of writing one file to a destination provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// A new file was created.
    Created,
    /// An existing file was overwritten.
    Updated,
    /// The destination already held identical content.
    Unchanged,
}

/// Confirmation of a single uploaded file.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// The destination node.
    pub node: ResourceNode,
    /// Slash-separated path on the destination.
    pub destination_path: String,
    /// What happened to the destination file.
    pub status: UploadStatus,
    /// Hashes reported by the destination, if any.
    pub destination_hashes: BTreeMap<String, String>,
}

/// Actions a provider can declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// List every resource visible to a token.
    ResourceCollection,
    /// Describe one resource.
    ResourceDetail,
    /// Fetch resource bytes.
    ResourceDownload,
    /// Write resources to the provider.
    ResourceUpload,
}

impl Action {
    /// All actions in declaration order.
    pub const ALL: [Self; 4] = [
        Self::ResourceCollection,
        Self::ResourceDetail,
        Self::ResourceDownload,
        Self::ResourceUpload,
    ];

    /// Returns the configuration key for this action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceCollection => "resource_collection",
            Self::ResourceDetail => "resource_detail",
            Self::ResourceDownload => "resource_download",
            Self::ResourceUpload => "resource_upload",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Uniform interface every provider adapter implements.
///
/// Implementations are provider-specific and opaque to the engine. Methods a
/// provider cannot serve keep their default body, which returns
/// [`ProviderError::Unsupported`]; [`implemented_actions`](Self::implemented_actions)
/// must list exactly the actions whose methods are overridden so the
/// registry can reject a configuration that promises more.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Returns the provider name used as the registry key.
    fn name(&self) -> &str;

    /// Returns the actions this adapter implements.
    fn implemented_actions(&self) -> &[Action];

    /// Validates the token and returns the account behind it.
    async fn authenticate(&self, token: &str) -> Result<ProviderIdentity, ProviderError>;

    /// Lists one page of top-level resources visible to the token.
    async fn list_roots(&self, _token: &str, _page: Option<&str>) -> Result<ChildPage, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "list_roots"))
    }

    /// Lists one page of direct children of a container.
    async fn list_children(
        &self,
        _token: &str,
        _parent: &ResourceNode,
        _page: Option<&str>,
    ) -> Result<ChildPage, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "list_children"))
    }

    /// Fetches a single resource description by id.
    async fn fetch_resource(&self, _token: &str, _id: &str) -> Result<ResourceNode, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "fetch_resource"))
    }

    /// Fetches the bytes of an item.
    async fn fetch_file(&self, _token: &str, _item: &ResourceNode) -> Result<FileContent, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "fetch_file"))
    }

    /// Creates a container under `parent`, or a new top-level container.
    async fn create_container(
        &self,
        _token: &str,
        _parent: Option<&ResourceNode>,
        _title: &str,
    ) -> Result<ResourceNode, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "create_container"))
    }

    /// Writes one file into `parent`, overwriting `existing` when given.
    async fn upload_file(
        &self,
        _token: &str,
        _parent: &ResourceNode,
        _title: &str,
        _bytes: &[u8],
        _existing: Option<&ResourceNode>,
    ) -> Result<UploadedFile, ProviderError> {
        Err(ProviderError::unsupported(self.name(), "upload_file"))
    }
}

/// Drains every page of `parent`'s children.
///
/// # Errors
///
/// Returns the first [`ProviderError`] reported by the provider, or
/// [`ProviderError::Transport`] when a page cursor comes back a second time.
pub async fn list_all_children(
    provider: &dyn ProviderCapability,
    token: &str,
    parent: &ResourceNode,
) -> Result<Vec<ResourceNode>, ProviderError> {
    let mut nodes = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();
    loop {
        let page = provider.list_children(token, parent, cursor.as_deref()).await?;
        nodes.extend(page.nodes);
        match page.next {
            Some(next) if !seen.insert(next.clone()) => {
                return Err(repeated_cursor(provider, &parent.id, &next));
            }
            Some(next) => cursor = Some(next),
            None => return Ok(nodes),
        }
    }
}

/// Drains every page of top-level resources.
///
/// # Errors
///
/// Returns the first [`ProviderError`] reported by the provider, or
/// [`ProviderError::Transport`] when a page cursor comes back a second time.
pub async fn list_all_roots(
    provider: &dyn ProviderCapability,
    token: &str,
) -> Result<Vec<ResourceNode>, ProviderError> {
    let mut nodes = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();
    loop {
        let page = provider.list_roots(token, cursor.as_deref()).await?;
        nodes.extend(page.nodes);
        match page.next {
            Some(next) if !seen.insert(next.clone()) => {
                return Err(repeated_cursor(provider, "top-level resources", &next));
            }
            Some(next) => cursor = Some(next),
            None => return Ok(nodes),
        }
    }
}

fn repeated_cursor(provider: &dyn ProviderCapability, listing: &str, cursor: &str) -> ProviderError {
    ProviderError::transport(
        provider.name(),
        None,
        format!("listing of '{listing}' returned page cursor '{cursor}' twice"),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct PagedProvider;

    #[async_trait]
    impl ProviderCapability for PagedProvider {
        fn name(&self) -> &str {
            "paged"
        }

        fn implemented_actions(&self) -> &[Action] {
            &[Action::ResourceCollection]
        }

        async fn authenticate(&self, _token: &str) -> Result<ProviderIdentity, ProviderError> {
            Ok(ProviderIdentity {
                username: "paged-user".to_string(),
            })
        }

        async fn list_children(
            &self,
            _token: &str,
            parent: &ResourceNode,
            page: Option<&str>,
        ) -> Result<ChildPage, ProviderError> {
            let index: usize = page.map_or(0, |p| p.parse().unwrap());
            let node = ResourceNode::item(format!("{}-{index}", parent.id), "file", "f");
            let next = (index < 2).then(|| (index + 1).to_string());
            Ok(ChildPage {
                nodes: vec![node],
                next,
            })
        }
    }

    #[tokio::test]
    async fn test_list_all_children_drains_pages() {
        let parent = ResourceNode::container("p", "folder", "Parent");
        let nodes = list_all_children(&PagedProvider, "t", &parent).await.unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["p-0", "p-1", "p-2"]);
    }

    struct LoopingProvider;

    #[async_trait]
    impl ProviderCapability for LoopingProvider {
        fn name(&self) -> &str {
            "looping"
        }

        fn implemented_actions(&self) -> &[Action] {
            &[Action::ResourceCollection]
        }

        async fn authenticate(&self, _token: &str) -> Result<ProviderIdentity, ProviderError> {
            Ok(ProviderIdentity {
                username: "looping-user".to_string(),
            })
        }

        async fn list_roots(&self, _token: &str, page: Option<&str>) -> Result<ChildPage, ProviderError> {
            let node = ResourceNode::container(format!("r-{}", page.unwrap_or("first")), "folder", "r");
            Ok(ChildPage {
                nodes: vec![node],
                next: Some("again".to_string()),
            })
        }

        async fn list_children(
            &self,
            _token: &str,
            parent: &ResourceNode,
            page: Option<&str>,
        ) -> Result<ChildPage, ProviderError> {
            // Cycles between two cursors.
            let next = if page == Some("a") { "b" } else { "a" };
            Ok(ChildPage {
                nodes: vec![ResourceNode::item(format!("{}-{next}", parent.id), "file", "f")],
                next: Some(next.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_repeated_cursor_stops_listing() {
        let err = list_all_roots(&LoopingProvider, "t").await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport { status: None, .. }));
        assert_eq!(err.status_code(), 502);

        let parent = ResourceNode::container("p", "folder", "Parent");
        let err = list_all_children(&LoopingProvider, "t", &parent).await.unwrap_err();
        assert!(err.to_string().contains("returned page cursor 'a' twice"));
    }

    #[tokio::test]
    async fn test_default_methods_report_unsupported() {
        let err = list_all_roots(&PagedProvider, "t").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Unsupported {
                operation: "list_roots",
                ..
            }
        ));
    }

    #[test]
    fn test_action_keys_match_config_names() {
        let keys: Vec<&str> = Action::ALL.iter().map(Action::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "resource_collection",
                "resource_detail",
                "resource_download",
                "resource_upload"
            ]
        );
    }

    #[test]
    fn test_node_builders() {
        let node = ResourceNode::item("1", "file", "a.txt").within("root");
        assert!(!node.is_container());
        assert_eq!(node.container_id.as_deref(), Some("root"));
    }
}
