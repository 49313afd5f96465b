//! GitHub-backed remote.
//!
//! Documents live as files on one branch of a repository. Reads and
//! compare-and-swap writes go through the contents API, where a file's git
//! blob SHA is its version. History compaction uses the Git Data API to
//! build a parentless commit and force-move the branch onto it.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{is_data_file, RemoteFileStore};
use crate::config::RemoteConfig;
use crate::error::{Result, StoreError};
use crate::retry::parse_retry_after;
use crate::types::{CommitInfo, Quota, RemoteFile, Snapshot, Timestamp, Version};

const METADATA_PATH: &str = "db/metadata.json";

#[derive(Deserialize)]
struct ContentsFile {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Deserialize)]
struct PutResponse {
    content: ShaOnly,
}

#[derive(Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Deserialize)]
struct DirEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: ShaOnly,
}

#[derive(Deserialize)]
struct GitCommit {
    tree: ShaOnly,
}

#[derive(Deserialize)]
struct GitTree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Deserialize)]
struct GitBlob {
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Deserialize)]
struct RateLimitCore {
    limit: u64,
    remaining: u64,
    reset: u64,
}

/// [`RemoteFileStore`] over the GitHub REST API.
pub struct GitHubRemote {
    client: Client,
    api: Url,
    owner: String,
    repo: String,
    branch: String,
    write_allowed: bool,
    branch_ready: OnceCell<()>,
    last_quota: Mutex<Option<Quota>>,
}

impl std::fmt::Debug for GitHubRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubRemote")
            .field("api", &self.api.as_str())
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("write_allowed", &self.write_allowed)
            .finish()
    }
}

impl GitHubRemote {
    pub fn new(config: &RemoteConfig, write_allowed: bool) -> Result<Self> {
        let api = Url::parse(&config.base_url)
            .map_err(|e| StoreError::Config(format!("Invalid base URL {}: {}", config.base_url, e)))?;
        if api.cannot_be_a_base() {
            return Err(StoreError::Config(format!(
                "Base URL cannot hold paths: {}",
                config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("token {}", config.token.expose()))
            .map_err(|_| StoreError::Config("Access token contains invalid characters".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github.v3+json"));
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|_| StoreError::Config("User agent contains invalid characters".into()))?;
        headers.insert(USER_AGENT, agent);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StoreError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            write_allowed,
            branch_ready: OnceCell::new(),
            last_quota: Mutex::new(None),
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.api.clone();
        // `new` rejected cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn repo_url<'a>(&'a self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        self.url(
            ["repos", self.owner.as_str(), self.repo.as_str()]
                .into_iter()
                .chain(segments),
        )
    }

    fn contents_url(&self, path: &str) -> Url {
        self.repo_url(std::iter::once("contents").chain(path.split('/').filter(|s| !s.is_empty())))
    }

    fn head_ref_url(&self, branch: &str, singular: bool) -> Url {
        let kind = if singular { "ref" } else { "refs" };
        self.repo_url(["git", kind, "heads"].into_iter().chain(branch.split('/')))
    }

    /// Send a request, recording any quota headers on the response.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        if let Some(quota) = quota_from_headers(response.headers()) {
            *self.last_quota.lock() = Some(quota);
        }
        Ok(response)
    }

    async fn read_blob(&self, sha: &str) -> Result<Vec<u8>> {
        let response = self
            .send(self.client.get(self.repo_url(["git", "blobs", sha])))
            .await?;
        let blob: GitBlob = check(response).await?.json().await?;
        match blob.encoding.as_str() {
            "base64" => decode_wrapped_base64(&blob.content),
            "utf-8" => Ok(blob.content.into_bytes()),
            other => Err(StoreError::InvalidFormat(format!("Unknown blob encoding: {}", other))),
        }
    }

    async fn head_commit(&self) -> Result<String> {
        let response = self.send(self.client.get(self.head_ref_url(&self.branch, true))).await?;
        let head: GitRef = check(response).await?.json().await?;
        Ok(head.object.sha)
    }

    async fn put_contents(
        &self,
        path: &str,
        bytes: &[u8],
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version> {
        let body = PutContents {
            message,
            content: STANDARD.encode(bytes),
            branch: &self.branch,
            sha: expected.map(Version::as_str),
        };
        let response = self
            .send(self.client.put(self.contents_url(path)).json(&body))
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            debug!(path, status = status.as_u16(), "Write rejected as stale");
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected.cloned(),
            });
        }

        let put: PutResponse = check(response).await?.json().await?;
        Ok(Version::new(put.content.sha))
    }

    /// Make sure the target branch exists before the first write.
    ///
    /// Failures are logged and the write proceeds; if the branch really is
    /// missing the write itself reports it.
    async fn ensure_branch(&self) {
        let ready = self
            .branch_ready
            .get_or_try_init(|| self.create_branch_if_missing())
            .await;
        if let Err(e) = ready {
            warn!(branch = %self.branch, error = %e, "Could not prepare branch");
        }
    }

    async fn create_branch_if_missing(&self) -> Result<()> {
        let branch_url = self.repo_url(std::iter::once("branches").chain(self.branch.split('/')));
        let response = self.send(self.client.get(branch_url)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return check(response).await.map(|_| ());
        }

        info!(branch = %self.branch, "Creating database branch");

        let response = self.send(self.client.get(self.repo_url(std::iter::empty()))).await?;
        let repo: RepoInfo = check(response).await?.json().await?;

        let response = self
            .send(self.client.get(self.head_ref_url(&repo.default_branch, true)))
            .await?;
        let base: GitRef = check(response).await?.json().await?;

        let payload = json!({
            "ref": format!("refs/heads/{}", self.branch),
            "sha": base.object.sha,
        });
        let response = self
            .send(self.client.post(self.repo_url(["git", "refs"])).json(&payload))
            .await?;
        check(response).await?;

        let metadata = json!({
            "created_at": Timestamp::now().as_secs(),
            "version": "1.0",
            "description": "repodb database",
        });
        let bytes = serde_json::to_vec_pretty(&metadata)?;
        let message = format!("Initialize {} database branch", self.branch);
        match self.put_contents(METADATA_PATH, &bytes, None, &message).await {
            Ok(_) | Err(StoreError::VersionConflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteFileStore for GitHubRemote {
    async fn read(&self, path: &str) -> Result<Option<RemoteFile>> {
        let request = self
            .client
            .get(self.contents_url(path))
            .query(&[("ref", self.branch.as_str())]);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let file: ContentsFile = check(response).await?.json().await?;
        let bytes = match (file.encoding.as_deref(), file.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() => decode_wrapped_base64(content)?,
            // Large files come back without inline content.
            _ => self.read_blob(&file.sha).await?,
        };

        debug!(path, version = %file.sha, "Read remote file");
        Ok(Some(RemoteFile {
            bytes,
            version: Version::new(file.sha),
        }))
    }

    async fn write(
        &self,
        path: &str,
        bytes: &[u8],
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version> {
        if !self.write_allowed {
            return Err(StoreError::WriteDisabled(path.to_string()));
        }
        self.ensure_branch().await;

        let version = self.put_contents(path, bytes, expected, message).await?;
        debug!(path, version = %version, "Wrote remote file");
        Ok(version)
    }

    async fn quota(&self) -> Result<Quota> {
        let response = self.send(self.client.get(self.url(["rate_limit"]))).await?;
        let body: RateLimitBody = check(response).await?.json().await?;
        let quota = Quota {
            limit: body.resources.core.limit,
            remaining: body.resources.core.remaining,
            reset_at: body.resources.core.reset,
        };
        *self.last_quota.lock() = Some(quota);
        Ok(quota)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let request = self
            .client
            .get(self.contents_url(prefix))
            .query(&[("ref", self.branch.as_str())]);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let entries: Vec<DirEntry> = check(response).await?.json().await?;
        let mut paths: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == "file" && is_data_file(&e.path))
            .map(|e| e.path)
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn snapshot(&self, paths: &[String]) -> Result<Snapshot> {
        let head = self.head_commit().await?;

        let response = self
            .send(self.client.get(self.repo_url(["git", "commits", head.as_str()])))
            .await?;
        let commit: GitCommit = check(response).await?.json().await?;

        let request = self
            .client
            .get(self.repo_url(["git", "trees", commit.tree.sha.as_str()]))
            .query(&[("recursive", "1")]);
        let response = self.send(request).await?;
        let tree: GitTree = check(response).await?.json().await?;
        if tree.truncated {
            return Err(StoreError::InvalidOperation(
                "Repository tree too large for a single snapshot".into(),
            ));
        }

        let files = tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob" && paths.contains(&e.path))
            .map(|e| (e.path, Version::new(e.sha)))
            .collect();

        Ok(Snapshot { head, files })
    }

    async fn replace_history(&self, snapshot: &Snapshot, message: &str) -> Result<CommitInfo> {
        if !self.write_allowed {
            return Err(StoreError::WriteDisabled(self.branch.clone()));
        }

        let entries: Vec<_> = snapshot
            .files
            .iter()
            .map(|(path, version)| {
                json!({
                    "path": path,
                    "mode": "100644",
                    "type": "blob",
                    "sha": version.as_str(),
                })
            })
            .collect();
        let response = self
            .send(
                self.client
                    .post(self.repo_url(["git", "trees"]))
                    .json(&json!({ "tree": entries })),
            )
            .await?;
        let tree: ShaOnly = check(response).await?.json().await?;

        let payload = json!({ "message": message, "tree": tree.sha, "parents": [] });
        let response = self
            .send(self.client.post(self.repo_url(["git", "commits"])).json(&payload))
            .await?;
        let commit: ShaOnly = check(response).await?.json().await?;

        // The ref update below cannot be made conditional, so check as late
        // as possible. A write landing after this check is still orphaned.
        let found = self.head_commit().await?;
        if found != snapshot.head {
            return Err(StoreError::CompactionRaced {
                expected: snapshot.head.clone(),
                found,
            });
        }

        let payload = json!({ "sha": commit.sha, "force": true });
        let response = self
            .send(self.client.patch(self.head_ref_url(&self.branch, false)).json(&payload))
            .await?;
        check(response).await?;

        info!(branch = %self.branch, commit = %commit.sha, "Replaced branch history");
        Ok(CommitInfo {
            id: commit.sha,
            message: message.to_string(),
        })
    }

    fn observed_quota(&self) -> Option<Quota> {
        *self.last_quota.lock()
    }

    fn write_allowed(&self) -> bool {
        self.write_allowed
    }
}

/// Pass successful responses through; turn the rest into errors.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &headers, &body))
}

/// Map a failed response onto the error taxonomy.
pub(crate) fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> StoreError {
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && body.to_lowercase().contains("rate limit"));

    if rate_limited {
        return StoreError::RateLimited {
            retry_after: retry_after_from(headers),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Authentication(format!("{}: {}", status, truncate(body)))
        }
        s if s.is_server_error() => StoreError::Network(format!("{}: {}", s, truncate(body))),
        s => StoreError::Remote {
            status: s.as_u16(),
            message: truncate(body).to_string(),
        },
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Wait hint from `Retry-After`, or from an exhausted `x-ratelimit-reset`.
pub(crate) fn retry_after_from(headers: &HeaderMap) -> Option<Duration> {
    if let Some(hint) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
    {
        return Some(hint);
    }

    if header_u64(headers, "x-ratelimit-remaining") == Some(0) {
        let reset = header_u64(headers, "x-ratelimit-reset")?;
        return Some(Duration::from_secs(
            reset.saturating_sub(Timestamp::now().as_secs()),
        ));
    }
    None
}

/// Quota carried on every API response.
pub(crate) fn quota_from_headers(headers: &HeaderMap) -> Option<Quota> {
    Some(Quota {
        limit: header_u64(headers, "x-ratelimit-limit")?,
        remaining: header_u64(headers, "x-ratelimit-remaining")?,
        reset_at: header_u64(headers, "x-ratelimit-reset")?,
    })
}

/// The contents API wraps base64 at 60 columns.
fn decode_wrapped_base64(content: &str) -> Result<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}
