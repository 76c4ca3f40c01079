//! Level-batched breadth-first traversal of a provider's resource tree.
//!
//! Each level's child listings run concurrently (bounded by the configured
//! fan-out) and are awaited as one batch before the next level starts, so the
//! flat output always lists a parent before any of its children.

use std::collections::{HashMap, HashSet};

use futures_util::{StreamExt, TryStreamExt, stream};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::job::ProgressHandle;
use crate::provider::{ProviderCapability, ProviderError, ResourceNode, list_all_children, list_all_roots};

/// Pseudo resource id reported when the top-level listing fails.
pub const ROOT_LISTING_ID: &str = "<roots>";

/// A listing call failed; the whole build is abandoned.
#[derive(Debug, Clone, Error)]
#[error("failed to list resources under '{resource_id}': {source}")]
pub struct TreeBuildError {
    /// The container whose listing failed.
    pub resource_id: String,
    /// Status code recorded on the failed job.
    pub status: u16,
    /// Underlying provider failure.
    #[source]
    pub source: ProviderError,
}

impl TreeBuildError {
    fn new(resource_id: &str, source: ProviderError) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            status: source.status_code(),
            source,
        }
    }
}

/// Builds flat, parent-first node lists from a provider.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTreeBuilder {
    concurrency: usize,
}

impl ResourceTreeBuilder {
    /// Creates a builder issuing at most `concurrency` listings at once.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Builds the tree rooted at `root`.
    ///
    /// The returned list starts with `root` (as a root, `container_id = None`)
    /// followed by its descendants level by level.
    ///
    /// # Errors
    ///
    /// Returns [`TreeBuildError`] for the first listing that fails.
    #[instrument(skip(self, provider, token, root, progress), fields(provider = provider.name(), root = %root.id))]
    pub async fn build_from(
        &self,
        provider: &dyn ProviderCapability,
        token: &str,
        root: &ResourceNode,
        progress: Option<&ProgressHandle>,
    ) -> Result<Vec<ResourceNode>, TreeBuildError> {
        let mut root = root.clone();
        root.container_id = None;

        let mut traversal = Traversal::default();
        traversal.push(root.clone());
        let frontier = if root.is_container() { vec![root] } else { Vec::new() };
        self.run_levels(&mut traversal, provider, token, frontier, progress)
            .await?;
        debug!(nodes = traversal.nodes.len(), "resource tree built");
        Ok(traversal.nodes)
    }

    /// Builds every tree visible to the token, starting from the top-level listing.
    ///
    /// A listed node whose parent is not in the listing is treated as a root.
    /// Listed nodes whose parent is visible are placed under that parent even
    /// if the traversal never rediscovers them.
    ///
    /// # Errors
    ///
    /// Returns [`TreeBuildError`] for the first listing that fails.
    #[instrument(skip(self, provider, token, progress), fields(provider = provider.name()))]
    pub async fn build_all(
        &self,
        provider: &dyn ProviderCapability,
        token: &str,
        progress: Option<&ProgressHandle>,
    ) -> Result<Vec<ResourceNode>, TreeBuildError> {
        let listed = list_all_roots(provider, token)
            .await
            .map_err(|source| TreeBuildError::new(ROOT_LISTING_ID, source))?;
        if let Some(progress) = progress {
            progress.increment().await;
        }

        let listed_ids: HashSet<&str> = listed.iter().map(|n| n.id.as_str()).collect();
        let mut traversal = Traversal::default();
        let mut roots = Vec::new();
        for node in &listed {
            match node.container_id.as_deref() {
                Some(parent) if listed_ids.contains(parent) && parent != node.id => {
                    traversal
                        .deferred
                        .entry(parent.to_string())
                        .or_default()
                        .push(node.clone());
                }
                _ => {
                    let mut root = node.clone();
                    root.container_id = None;
                    roots.push(root);
                }
            }
        }

        let mut frontier = Vec::new();
        for root in roots {
            if traversal.push(root.clone()) && root.is_container() {
                frontier.push(root);
            }
        }
        self.run_levels(&mut traversal, provider, token, frontier, progress)
            .await?;

        // Only a parent cycle in the listing can leave nodes unplaced.
        let leftovers: Vec<ResourceNode> = listed
            .into_iter()
            .filter(|node| !traversal.seen.contains(&node.id))
            .collect();
        for mut node in leftovers {
            if traversal.seen.contains(&node.id) {
                continue;
            }
            node.container_id = None;
            traversal.push(node.clone());
            let frontier = if node.is_container() { vec![node] } else { Vec::new() };
            self.run_levels(&mut traversal, provider, token, frontier, progress)
                .await?;
        }

        debug!(nodes = traversal.nodes.len(), "resource collection built");
        Ok(traversal.nodes)
    }

    async fn run_levels(
        &self,
        traversal: &mut Traversal,
        provider: &dyn ProviderCapability,
        token: &str,
        mut frontier: Vec<ResourceNode>,
        progress: Option<&ProgressHandle>,
    ) -> Result<(), TreeBuildError> {
        let mut depth = 0_usize;
        while !frontier.is_empty() {
            debug!(depth, containers = frontier.len(), "listing level");
            // Built eagerly so the spawned job future stays `Send`.
            let level: Vec<_> = frontier
                .iter()
                .map(|parent| list_level_entry(provider, token, parent, progress))
                .collect();
            let listings: Vec<Vec<ResourceNode>> = stream::iter(level)
                .buffered(self.concurrency)
                .try_collect()
                .await?;

            let mut next = Vec::new();
            for (parent, children) in frontier.iter().zip(listings) {
                let adopted = traversal.deferred.remove(&parent.id).unwrap_or_default();
                for mut child in children.into_iter().chain(adopted) {
                    child.container_id = Some(parent.id.clone());
                    if traversal.push(child.clone()) && child.is_container() {
                        next.push(child);
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        Ok(())
    }
}

async fn list_level_entry(
    provider: &dyn ProviderCapability,
    token: &str,
    parent: &ResourceNode,
    progress: Option<&ProgressHandle>,
) -> Result<Vec<ResourceNode>, TreeBuildError> {
    let children = list_all_children(provider, token, parent)
        .await
        .map_err(|source| TreeBuildError::new(&parent.id, source))?;
    if let Some(progress) = progress {
        progress.increment().await;
    }
    Ok(children)
}

#[derive(Default)]
struct Traversal {
    nodes: Vec<ResourceNode>,
    seen: HashSet<String>,
    deferred: HashMap<String, Vec<ResourceNode>>,
}

impl Traversal {
    /// Appends `node` unless its id was already emitted.
    fn push(&mut self, node: ResourceNode) -> bool {
        if !self.seen.insert(node.id.clone()) {
            return false;
        }
        self.nodes.push(node);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::provider::{Action, ChildPage, ProviderIdentity};

    const PAGE_SIZE: usize = 2;

    #[derive(Default)]
    struct FakeTree {
        roots: Vec<ResourceNode>,
        children: HashMap<String, Vec<ResourceNode>>,
        failing: HashSet<String>,
        listed: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeTree {
        fn with_children(mut self, parent: &str, nodes: Vec<ResourceNode>) -> Self {
            self.children.insert(parent.to_string(), nodes);
            self
        }
    }

    #[async_trait]
    impl ProviderCapability for FakeTree {
        fn name(&self) -> &str {
            "fake"
        }

        fn implemented_actions(&self) -> &[Action] {
            &[Action::ResourceCollection, Action::ResourceDetail]
        }

        async fn authenticate(&self, _token: &str) -> Result<ProviderIdentity, ProviderError> {
            Ok(ProviderIdentity {
                username: "fake".to_string(),
            })
        }

        async fn list_roots(&self, _token: &str, _page: Option<&str>) -> Result<ChildPage, ProviderError> {
            Ok(ChildPage::last(self.roots.clone()))
        }

        async fn list_children(
            &self,
            _token: &str,
            parent: &ResourceNode,
            page: Option<&str>,
        ) -> Result<ChildPage, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&parent.id) {
                return Err(ProviderError::invalid_token());
            }
            self.listed.lock().unwrap().push(parent.id.clone());

            let all = self.children.get(&parent.id).cloned().unwrap_or_default();
            let start: usize = page.map_or(0, |p| p.parse().unwrap());
            let end = (start + PAGE_SIZE).min(all.len());
            let next = (end < all.len()).then(|| end.to_string());
            Ok(ChildPage {
                nodes: all[start..end].to_vec(),
                next,
            })
        }
    }

    fn folder(id: &str) -> ResourceNode {
        ResourceNode::container(id, "folder", id)
    }

    fn file(id: &str) -> ResourceNode {
        ResourceNode::item(id, "file", id)
    }

    fn assert_parent_first(nodes: &[ResourceNode]) {
        for (index, node) in nodes.iter().enumerate() {
            if let Some(parent) = &node.container_id {
                assert!(
                    nodes[..index].iter().any(|n| &n.id == parent),
                    "{} appears before its parent {parent}",
                    node.id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_build_from_orders_levels_and_drains_pages() {
        let provider = FakeTree::default()
            .with_children("root", vec![folder("a"), file("f1"), file("f2"), folder("b")])
            .with_children("a", vec![file("a1"), folder("a2")])
            .with_children("a2", vec![file("deep")]);

        let nodes = ResourceTreeBuilder::new(4)
            .build_from(&provider, "t", &folder("root"), None)
            .await
            .unwrap();

        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["root", "a", "f1", "f2", "b", "a1", "a2", "deep"]);
        assert!(nodes[0].container_id.is_none());
        assert_eq!(nodes[5].container_id.as_deref(), Some("a"));
        assert_parent_first(&nodes);
    }

    #[tokio::test]
    async fn test_build_from_aborts_on_listing_failure() {
        let mut provider = FakeTree::default()
            .with_children("root", vec![folder("a"), folder("b")])
            .with_children("a", vec![file("x")]);
        provider.failing.insert("b".to_string());

        let err = ResourceTreeBuilder::new(2)
            .build_from(&provider, "t", &folder("root"), None)
            .await
            .unwrap_err();
        assert_eq!(err.resource_id, "b");
        assert_eq!(err.status, 401);
    }

    #[tokio::test]
    async fn test_build_from_skips_already_seen_ids() {
        let provider = FakeTree::default()
            .with_children("root", vec![folder("a"), folder("b")])
            .with_children("a", vec![file("shared")])
            .with_children("b", vec![file("shared")]);

        let nodes = ResourceTreeBuilder::new(2)
            .build_from(&provider, "t", &folder("root"), None)
            .await
            .unwrap();
        let shared = nodes.iter().filter(|n| n.id == "shared").count();
        assert_eq!(shared, 1);
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_bound() {
        let many: Vec<ResourceNode> = (0..12).map(|i| folder(&format!("c{i}"))).collect();
        let provider = FakeTree::default().with_children("root", many);

        ResourceTreeBuilder::new(3)
            .build_from(&provider, "t", &folder("root"), None)
            .await
            .unwrap();
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_build_all_treats_invisible_parent_as_root() {
        let mut provider = FakeTree::default()
            .with_children("p1", vec![file("p1-file")])
            .with_children("sub", vec![file("sub-file")]);
        provider.roots = vec![
            folder("sub").within("p1"),
            folder("p1"),
            folder("orphan").within("hidden-parent"),
        ];

        let nodes = ResourceTreeBuilder::new(2)
            .build_all(&provider, "t", None)
            .await
            .unwrap();

        let orphan = nodes.iter().find(|n| n.id == "orphan").unwrap();
        assert!(orphan.container_id.is_none());
        let sub = nodes.iter().find(|n| n.id == "sub").unwrap();
        assert_eq!(sub.container_id.as_deref(), Some("p1"));
        assert!(nodes.iter().any(|n| n.id == "sub-file"));
        assert_parent_first(&nodes);
        assert_eq!(nodes.iter().filter(|n| n.id == "sub").count(), 1);
    }
}
