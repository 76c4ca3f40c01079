//! In-memory provider and runner setup shared by the job integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use transfer_core::fixity::{HashAlgorithm, hash_bytes};
use transfer_core::job::{JobRunner, JobStatus, JobStore, ProgressRecord};
use transfer_core::provider::{
    Action, CapabilityRegistry, ChildPage, FileContent, ProviderCapability, ProviderError,
    ProviderIdentity, ResourceNode, SupportedActions, TargetSpec, UploadStatus, UploadedFile,
};
use transfer_core::{Database, EngineSettings};

/// Token every memory provider accepts.
pub const GOOD_TOKEN: &str = "good-token";

const PAGE_SIZE: usize = 2;

#[derive(Default)]
struct State {
    nodes: Vec<ResourceNode>,
    files: HashMap<String, Vec<u8>>,
    next_id: usize,
}

/// Provider backed by a node list, with call counters and failure injection.
pub struct MemoryProvider {
    name: String,
    actions: Vec<Action>,
    state: Mutex<State>,
    failing_fetches: Mutex<HashSet<String>>,
    reported_hashes: Mutex<HashMap<String, String>>,
    gate: Option<Semaphore>,
    pub fetch_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
}

impl MemoryProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            actions: Action::ALL.to_vec(),
            state: Mutex::new(State::default()),
            failing_fetches: Mutex::new(HashSet::new()),
            reported_hashes: Mutex::new(HashMap::new()),
            gate: None,
            fetch_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Restricts the implemented actions.
    pub fn with_actions(mut self, actions: &[Action]) -> Self {
        self.actions = actions.to_vec();
        self
    }

    /// Makes `authenticate` wait until [`open_gate`](Self::open_gate).
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn add_container(&self, id: &str, title: &str, parent: Option<&str>) {
        let mut node = ResourceNode::container(id, "folder", title);
        node.container_id = parent.map(str::to_string);
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn add_file(&self, id: &str, title: &str, parent: &str, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state
            .nodes
            .push(ResourceNode::item(id, "file", title).within(parent));
        state.files.insert(id.to_string(), bytes.to_vec());
    }

    /// Makes `fetch_file` fail for `id` with a 500.
    pub fn fail_fetch(&self, id: &str) {
        self.failing_fetches.lock().unwrap().insert(id.to_string());
    }

    /// Makes `fetch_file` report `digest` as the sha256 of `id`.
    pub fn report_sha256(&self, id: &str, digest: &str) {
        self.reported_hashes
            .lock()
            .unwrap()
            .insert(id.to_string(), digest.to_string());
    }

    /// Titles of the direct children of `parent` (roots when `None`), sorted.
    pub fn titles_under(&self, parent: Option<&str>) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut titles: Vec<String> = state
            .nodes
            .iter()
            .filter(|n| n.container_id.as_deref() == parent)
            .map(|n| n.title.clone())
            .collect();
        titles.sort();
        titles
    }

    /// Id of the first node titled `title` under `parent`.
    pub fn id_of(&self, parent: Option<&str>, title: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.container_id.as_deref() == parent && n.title == title)
            .map(|n| n.id.clone())
    }

    pub fn bytes_of(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(id).cloned()
    }

    fn check(&self, token: &str) -> Result<(), ProviderError> {
        if token == GOOD_TOKEN {
            Ok(())
        } else {
            Err(ProviderError::invalid_token())
        }
    }

    fn path_of(state: &State, node: &ResourceNode) -> String {
        let mut parts = vec![node.title.clone()];
        let mut parent = node.container_id.clone();
        while let Some(id) = parent {
            match state.nodes.iter().find(|n| n.id == id) {
                Some(p) => {
                    parts.push(p.title.clone());
                    parent = p.container_id.clone();
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn page(nodes: Vec<ResourceNode>, page: Option<&str>) -> ChildPage {
        let offset: usize = page.and_then(|p| p.parse().ok()).unwrap_or(0);
        let end = (offset + PAGE_SIZE).min(nodes.len());
        let next = (end < nodes.len()).then(|| end.to_string());
        ChildPage {
            nodes: nodes[offset.min(end)..end].to_vec(),
            next,
        }
    }
}

#[async_trait]
impl ProviderCapability for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn implemented_actions(&self) -> &[Action] {
        &self.actions
    }

    async fn authenticate(&self, token: &str) -> Result<ProviderIdentity, ProviderError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.check(token)?;
        Ok(ProviderIdentity {
            username: format!("{}-user", self.name),
        })
    }

    async fn list_roots(&self, token: &str, page: Option<&str>) -> Result<ChildPage, ProviderError> {
        self.check(token)?;
        let roots: Vec<ResourceNode> = {
            let state = self.state.lock().unwrap();
            state
                .nodes
                .iter()
                .filter(|n| n.container_id.is_none())
                .cloned()
                .collect()
        };
        Ok(Self::page(roots, page))
    }

    async fn list_children(
        &self,
        token: &str,
        parent: &ResourceNode,
        page: Option<&str>,
    ) -> Result<ChildPage, ProviderError> {
        self.check(token)?;
        let children: Vec<ResourceNode> = {
            let state = self.state.lock().unwrap();
            state
                .nodes
                .iter()
                .filter(|n| n.container_id.as_deref() == Some(parent.id.as_str()))
                .cloned()
                .collect()
        };
        Ok(Self::page(children, page))
    }

    async fn fetch_resource(&self, token: &str, id: &str) -> Result<ResourceNode, ProviderError> {
        self.check(token)?;
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(id))
    }

    async fn fetch_file(&self, token: &str, item: &ResourceNode) -> Result<FileContent, ProviderError> {
        self.check(token)?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_fetches.lock().unwrap().contains(&item.id) {
            return Err(ProviderError::transport(
                format!("memory://{}/{}", self.name, item.id),
                Some(500),
                "injected failure",
            ));
        }
        let bytes = self
            .bytes_of(&item.id)
            .ok_or_else(|| ProviderError::not_found(&item.id))?;
        let mut hashes = BTreeMap::new();
        if let Some(digest) = self.reported_hashes.lock().unwrap().get(&item.id) {
            hashes.insert("sha256".to_string(), Some(digest.clone()));
        }
        Ok(FileContent {
            bytes,
            hashes,
            extra_metadata: BTreeMap::new(),
        })
    }

    async fn create_container(
        &self,
        token: &str,
        parent: Option<&ResourceNode>,
        title: &str,
    ) -> Result<ResourceNode, ProviderError> {
        self.check(token)?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let mut node = ResourceNode::container(format!("new-c{}", state.next_id), "folder", title);
        node.container_id = parent.map(|p| p.id.clone());
        state.nodes.push(node.clone());
        Ok(node)
    }

    async fn upload_file(
        &self,
        token: &str,
        parent: &ResourceNode,
        title: &str,
        bytes: &[u8],
        existing: Option<&ResourceNode>,
    ) -> Result<UploadedFile, ProviderError> {
        self.check(token)?;
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let (node, status) = match existing {
            Some(existing) => {
                let unchanged = state.files.get(&existing.id).map(Vec::as_slice) == Some(bytes);
                let status = if unchanged {
                    UploadStatus::Unchanged
                } else {
                    UploadStatus::Updated
                };
                (existing.clone(), status)
            }
            None => {
                state.next_id += 1;
                let node = ResourceNode::item(format!("new-f{}", state.next_id), "file", title)
                    .within(parent.id.clone());
                state.nodes.push(node.clone());
                (node, UploadStatus::Created)
            }
        };
        state.files.insert(node.id.clone(), bytes.to_vec());
        let destination_path = Self::path_of(&state, &node);
        let mut destination_hashes = BTreeMap::new();
        destination_hashes.insert(
            HashAlgorithm::Sha256.as_str().to_string(),
            hash_bytes(HashAlgorithm::Sha256, bytes),
        );
        Ok(UploadedFile {
            node,
            destination_path,
            status,
            destination_hashes,
        })
    }
}

/// Test settings: small pool, jobs under `dir`.
pub fn settings(dir: &TempDir) -> EngineSettings {
    EngineSettings {
        jobs_dir: dir.path().join("jobs"),
        fan_out_concurrency: 3,
        worker_count: 2,
        queue_capacity: 8,
        ..EngineSettings::default()
    }
}

/// Declares every provider with all actions it implements.
pub fn targets_for(providers: &[Arc<MemoryProvider>]) -> Vec<TargetSpec> {
    providers
        .iter()
        .map(|p| TargetSpec {
            name: p.name().to_string(),
            readable_name: p.name().to_string(),
            supported_actions: SupportedActions {
                resource_collection: p.actions.contains(&Action::ResourceCollection),
                resource_detail: p.actions.contains(&Action::ResourceDetail),
                resource_download: p.actions.contains(&Action::ResourceDownload),
                resource_upload: p.actions.contains(&Action::ResourceUpload),
            },
            supported_hash_algorithms: vec!["sha256".to_string()],
        })
        .collect()
}

/// Starts a runner over the given providers and an in-memory store.
pub async fn start_runner(providers: &[Arc<MemoryProvider>], settings: EngineSettings) -> JobRunner {
    let capabilities: Vec<Arc<dyn ProviderCapability>> = providers
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn ProviderCapability>)
        .collect();
    let registry = CapabilityRegistry::build(targets_for(providers), capabilities).unwrap();
    let store = JobStore::new(Database::new_in_memory().await.unwrap());
    JobRunner::start(Arc::new(registry), store, settings).unwrap()
}

/// Polls until the ticket is terminal, collecting every observed record.
pub async fn wait_terminal(runner: &JobRunner, ticket_id: &str) -> (ProgressRecord, Vec<ProgressRecord>) {
    let mut seen = Vec::new();
    for _ in 0..1000 {
        let record = runner.status(ticket_id).await.unwrap().unwrap();
        if record.status != JobStatus::InProgress {
            return (record, seen);
        }
        seen.push(record);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("ticket {ticket_id} did not finish");
}

/// Project with two files and one empty folder.
pub fn seed_project(provider: &MemoryProvider) {
    provider.add_container("p1", "Proj", None);
    provider.add_file("f1", "a.txt", "p1", b"hello");
    provider.add_container("d1", "sub", Some("p1"));
    provider.add_file("f2", "b.txt", "d1", b"world");
    provider.add_container("d2", "empty", Some("p1"));
}
