//! GitHub REST adapter.
//!
//! Repositories are top-level containers, directories are nested containers
//! and blobs are items. Node ids are `"{repo_id}"` for a repository and
//! `"{repo_id}:{path}"` for anything inside one, so every id can be resolved
//! without extra state. Repository full names are cached after first lookup.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use super::{
    Action, ChildPage, FileContent, ProviderCapability, ProviderError, ProviderIdentity,
    ResourceNode, UploadStatus, UploadedFile,
};
use crate::user_agent;

/// Public GitHub API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Repositories requested per listing page (GitHub maximum).
const PER_PAGE: usize = 100;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 120;

const JSON_ACCEPT: &str = "application/vnd.github+json";
const RAW_ACCEPT: &str = "application/vnd.github.raw";

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubRepo {
    id: u64,
    name: String,
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct GithubEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Listing(Vec<GithubEntry>),
    Single(GithubEntry),
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: GithubEntry,
}

/// Repository id plus slash-separated path inside it (empty for the root).
#[derive(Debug, PartialEq, Eq)]
struct Location {
    repo_id: String,
    path: String,
}

fn parse_id(id: &str) -> Result<Location, ProviderError> {
    let (repo_id, path) = id.split_once(':').unwrap_or((id, ""));
    if repo_id.is_empty() || !repo_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProviderError::not_found(id));
    }
    Ok(Location {
        repo_id: repo_id.to_string(),
        path: path.trim_matches('/').to_string(),
    })
}

fn node_id(repo_id: &str, path: &str) -> String {
    if path.is_empty() {
        repo_id.to_string()
    } else {
        format!("{repo_id}:{path}")
    }
}

fn parent_id(repo_id: &str, path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => node_id(repo_id, parent),
        None => repo_id.to_string(),
    }
}

fn join_path(base: &str, title: &str) -> String {
    if base.is_empty() {
        title.to_string()
    } else {
        format!("{base}/{title}")
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn contents_path(full_name: &str, path: &str) -> String {
    format!("/repos/{full_name}/contents/{}", encode_path(path))
}

fn repo_node(repo: &GithubRepo) -> ResourceNode {
    ResourceNode::container(repo.id.to_string(), "repo", &repo.name)
}

fn entry_node(repo_id: &str, entry: &GithubEntry) -> Option<ResourceNode> {
    let id = node_id(repo_id, &entry.path);
    let node = match entry.kind.as_str() {
        "dir" => ResourceNode::container(id, "dir", &entry.name),
        "file" => ResourceNode::item(id, "file", &entry.name),
        _ => return None,
    };
    Some(node.within(parent_id(repo_id, &entry.path)))
}

async fn send(url: &str, builder: RequestBuilder, resource_id: &str) -> Result<Response, ProviderError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ProviderError::transport(url, None, e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        debug!(url, status = status.as_u16(), resource_id, "GitHub returned error status");
        Err(ProviderError::from_status(status.as_u16(), url, resource_id))
    }
}

/// [`ProviderCapability`] for the GitHub REST API.
#[derive(Debug)]
pub struct GithubProvider {
    client: Client,
    base_url: String,
    repos: DashMap<String, String>,
}

impl GithubProvider {
    /// Creates an adapter for the public GitHub API.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_options(DEFAULT_API_BASE, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates an adapter for a custom API root (GitHub Enterprise, tests).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::BadRequest`] for an invalid URL.
    pub fn with_base_url(base_url: &str) -> Result<Self, ProviderError> {
        Self::with_options(base_url, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates an adapter with explicit API root and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::BadRequest`] for an invalid or non-HTTP URL and
    /// [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn with_options(
        base_url: &str,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let parsed = Url::parse(base_url).map_err(|e| {
            ProviderError::bad_request(format!("invalid GitHub API base URL '{base_url}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderError::bad_request(format!(
                "GitHub API base URL must be http(s): {base_url}"
            )));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(|e| ProviderError::transport(base_url, None, e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            repos: DashMap::new(),
        })
    }

    fn request(&self, method: Method, token: &str, path: &str, accept: &str) -> (String, RequestBuilder) {
        let url = format!("{}{path}", self.base_url);
        let builder = self
            .client
            .request(method, &url)
            .header(AUTHORIZATION, format!("token {token}"))
            .header(ACCEPT, accept);
        (url, builder)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        resource_id: &str,
    ) -> Result<T, ProviderError> {
        let (url, builder) = self.request(Method::GET, token, path, JSON_ACCEPT);
        let response = send(&url, builder, resource_id).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::transport(&url, None, format!("invalid response body: {e}")))
    }

    fn remember(&self, repo: &GithubRepo) {
        self.repos.insert(repo.id.to_string(), repo.full_name.clone());
    }

    async fn fetch_repo(&self, token: &str, repo_id: &str) -> Result<GithubRepo, ProviderError> {
        let repo: GithubRepo = self
            .get_json(token, &format!("/repositories/{repo_id}"), repo_id)
            .await?;
        self.remember(&repo);
        Ok(repo)
    }

    async fn full_name(&self, token: &str, repo_id: &str) -> Result<String, ProviderError> {
        if let Some(cached) = self.repos.get(repo_id) {
            return Ok(cached.value().clone());
        }
        Ok(self.fetch_repo(token, repo_id).await?.full_name)
    }

    async fn existing_sha(&self, token: &str, full_name: &str, existing: &ResourceNode) -> Result<String, ProviderError> {
        let location = parse_id(&existing.id)?;
        match self
            .get_json::<ContentsResponse>(token, &contents_path(full_name, &location.path), &existing.id)
            .await?
        {
            ContentsResponse::Single(entry) if !entry.sha.is_empty() => Ok(entry.sha),
            _ => Err(ProviderError::bad_request(format!(
                "'{}' is not a file on the destination",
                existing.title
            ))),
        }
    }
}

#[async_trait]
impl ProviderCapability for GithubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn implemented_actions(&self) -> &[Action] {
        &Action::ALL
    }

    #[instrument(skip(self, token))]
    async fn authenticate(&self, token: &str) -> Result<ProviderIdentity, ProviderError> {
        let user: GithubUser = self.get_json(token, "/user", "user").await?;
        Ok(ProviderIdentity {
            username: user.login,
        })
    }

    #[instrument(skip(self, token))]
    async fn list_roots(&self, token: &str, page: Option<&str>) -> Result<ChildPage, ProviderError> {
        let page_number: u32 = page
            .map(str::parse)
            .transpose()
            .map_err(|_| ProviderError::bad_request("invalid repository page cursor"))?
            .unwrap_or(1);
        let repos: Vec<GithubRepo> = self
            .get_json(
                token,
                &format!("/user/repos?per_page={PER_PAGE}&page={page_number}"),
                "user",
            )
            .await?;

        let next = (repos.len() == PER_PAGE).then(|| (page_number + 1).to_string());
        let nodes = repos
            .iter()
            .map(|repo| {
                self.remember(repo);
                repo_node(repo)
            })
            .collect();
        Ok(ChildPage { nodes, next })
    }

    #[instrument(skip(self, token, parent), fields(parent = %parent.id))]
    async fn list_children(
        &self,
        token: &str,
        parent: &ResourceNode,
        _page: Option<&str>,
    ) -> Result<ChildPage, ProviderError> {
        let location = parse_id(&parent.id)?;
        let full_name = self.full_name(token, &location.repo_id).await?;
        let listing = self
            .get_json::<ContentsResponse>(token, &contents_path(&full_name, &location.path), &parent.id)
            .await;

        match listing {
            Ok(ContentsResponse::Listing(entries)) => Ok(ChildPage::last(
                entries
                    .iter()
                    .filter_map(|entry| entry_node(&location.repo_id, entry))
                    .collect(),
            )),
            Ok(ContentsResponse::Single(_)) => Ok(ChildPage::default()),
            // An empty repository has no contents endpoint.
            Err(ProviderError::NotFound { .. }) if location.path.is_empty() => Ok(ChildPage::default()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, token))]
    async fn fetch_resource(&self, token: &str, id: &str) -> Result<ResourceNode, ProviderError> {
        let location = parse_id(id)?;
        let repo = self.fetch_repo(token, &location.repo_id).await?;
        if location.path.is_empty() {
            return Ok(repo_node(&repo));
        }

        let contents: ContentsResponse = self
            .get_json(token, &contents_path(&repo.full_name, &location.path), id)
            .await?;
        match contents {
            ContentsResponse::Listing(_) => {
                let title = location
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(location.path.as_str());
                Ok(ResourceNode::container(id, "dir", title)
                    .within(parent_id(&location.repo_id, &location.path)))
            }
            ContentsResponse::Single(entry) => entry_node(&location.repo_id, &entry).ok_or_else(|| {
                ProviderError::bad_request(format!(
                    "resource '{id}' has unsupported type '{}'",
                    entry.kind
                ))
            }),
        }
    }

    #[instrument(skip(self, token, item), fields(item = %item.id))]
    async fn fetch_file(&self, token: &str, item: &ResourceNode) -> Result<FileContent, ProviderError> {
        let location = parse_id(&item.id)?;
        let full_name = self.full_name(token, &location.repo_id).await?;
        let (url, builder) = self.request(
            Method::GET,
            token,
            &contents_path(&full_name, &location.path),
            RAW_ACCEPT,
        );
        let response = send(&url, builder, &item.id).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::transport(&url, None, e.to_string()))?;
        Ok(FileContent {
            bytes: bytes.to_vec(),
            ..FileContent::default()
        })
    }

    #[instrument(skip(self, token, parent))]
    async fn create_container(
        &self,
        token: &str,
        parent: Option<&ResourceNode>,
        title: &str,
    ) -> Result<ResourceNode, ProviderError> {
        // Directories exist implicitly once a file is written beneath them.
        if let Some(parent) = parent {
            let location = parse_id(&parent.id)?;
            let path = join_path(&location.path, title);
            return Ok(
                ResourceNode::container(node_id(&location.repo_id, &path), "dir", title)
                    .within(parent.id.clone()),
            );
        }

        let (url, builder) = self.request(Method::POST, token, "/user/repos", JSON_ACCEPT);
        let response = send(&url, builder.json(&serde_json::json!({ "name": title })), title).await?;
        let repo: GithubRepo = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(&url, None, format!("invalid response body: {e}")))?;
        self.remember(&repo);
        debug!(repo = %repo.full_name, "created repository");
        Ok(repo_node(&repo))
    }

    #[instrument(skip(self, token, parent, bytes, existing), fields(parent = %parent.id, size = bytes.len()))]
    async fn upload_file(
        &self,
        token: &str,
        parent: &ResourceNode,
        title: &str,
        bytes: &[u8],
        existing: Option<&ResourceNode>,
    ) -> Result<UploadedFile, ProviderError> {
        let location = parse_id(&parent.id)?;
        let full_name = self.full_name(token, &location.repo_id).await?;
        let path = join_path(&location.path, title);

        let mut body = serde_json::json!({
            "message": format!("Upload {path}"),
            "content": STANDARD.encode(bytes),
        });
        if let Some(existing) = existing {
            body["sha"] = serde_json::Value::String(self.existing_sha(token, &full_name, existing).await?);
        }

        let (url, builder) = self.request(Method::PUT, token, &contents_path(&full_name, &path), JSON_ACCEPT);
        let response = send(&url, builder.json(&body), &parent.id).await?;
        let status = if response.status() == StatusCode::CREATED {
            UploadStatus::Created
        } else {
            UploadStatus::Updated
        };
        let put: PutResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(&url, None, format!("invalid response body: {e}")))?;

        let node = entry_node(&location.repo_id, &put.content)
            .unwrap_or_else(|| ResourceNode::item(node_id(&location.repo_id, &path), "file", title))
            .within(parent.id.clone());
        let repo_name = full_name.rsplit('/').next().unwrap_or(full_name.as_str());

        Ok(UploadedFile {
            node,
            destination_path: format!("/{repo_name}/{path}"),
            status,
            destination_hashes: std::collections::BTreeMap::new(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_repo_and_path() {
        assert_eq!(
            parse_id("42").unwrap(),
            Location {
                repo_id: "42".to_string(),
                path: String::new()
            }
        );
        assert_eq!(parse_id("42:docs/a.txt").unwrap().path, "docs/a.txt");
        assert!(matches!(
            parse_id("not-a-repo"),
            Err(ProviderError::NotFound { .. })
        ));
        assert!(parse_id(":x").is_err());
    }

    #[test]
    fn test_parent_id_walks_up_one_level() {
        assert_eq!(parent_id("7", "a/b/c.txt"), "7:a/b");
        assert_eq!(parent_id("7", "c.txt"), "7");
    }

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("my dir/a b.txt"), "my%20dir/a%20b.txt");
        assert_eq!(contents_path("o/r", ""), "/repos/o/r/contents/");
    }

    #[test]
    fn test_entry_node_skips_symlinks() {
        let entry = GithubEntry {
            name: "link".to_string(),
            path: "x/link".to_string(),
            kind: "symlink".to_string(),
            sha: String::new(),
        };
        assert!(entry_node("1", &entry).is_none());

        let file = GithubEntry {
            kind: "file".to_string(),
            ..entry
        };
        let node = entry_node("1", &file).unwrap();
        assert_eq!(node.id, "1:x/link");
        assert_eq!(node.container_id.as_deref(), Some("1:x"));
    }

    #[test]
    fn test_with_options_rejects_non_http_base() {
        assert!(matches!(
            GithubProvider::with_base_url("ftp://example.com"),
            Err(ProviderError::BadRequest { .. })
        ));
        assert!(GithubProvider::with_base_url("not a url").is_err());
    }
}
