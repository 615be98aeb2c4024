//! Hosted model hub backend.
//!
//! Talks to a Hugging Face compatible hub over HTTP:
//! - tree listing: `GET /api/models/{repo}/tree/{revision}?recursive=true`
//! - file download: `GET /{repo}/resolve/{revision}/{path}`
//! - commits: `POST /api/models/{repo}/commit/{revision}` (NDJSON body)
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_core::storage::{ArtifactRepository, HubRepository, DEFAULT_HUB_ENDPOINT};
//!
//! # async fn example() -> kiln_core::Result<()> {
//! let hub = HubRepository::new(DEFAULT_HUB_ENDPOINT, std::env::var("HF_TOKEN").ok());
//! let files = hub.list_files("aws-neuron/optimum-neuron-cache", "main").await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, LINK};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{collect_folder_files, join_repo_path, ArtifactRepository};
use crate::error::{KilnError, Result};

/// One entry of a tree listing.
#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
}

/// Hub client with explicitly injected credentials.
pub struct HubRepository {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubRepository {
    /// Create a hub client for `endpoint`, authenticating with `token` if set.
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, token)
    }

    /// Create a hub client reusing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, endpoint: &str, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// Base endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn tree_url(&self, repo_id: &str, revision: &str) -> String {
        format!(
            "{}/api/models/{}/tree/{}?recursive=true",
            self.endpoint,
            repo_id,
            encode_revision(revision)
        )
    }

    /// Every segment of `path` is percent-encoded; `revision` is one segment.
    fn resolve_url(&self, repo_id: &str, revision: &str, path: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| KilnError::Config(format!("invalid hub endpoint {}: {e}", self.endpoint)))?;
        url.path_segments_mut()
            .map_err(|()| KilnError::Config(format!("invalid hub endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(repo_id.split('/'))
            .push("resolve")
            .push(revision)
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn commit_url(&self, repo_id: &str, revision: &str) -> String {
        format!(
            "{}/api/models/{}/commit/{}",
            self.endpoint,
            repo_id,
            encode_revision(revision)
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    async fn commit(&self, repo_id: &str, revision: &str, body: String) -> Result<()> {
        let resp = self
            .authorized(self.client.post(self.commit_url(repo_id, revision)))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

impl ArtifactRepository for HubRepository {
    async fn list_files(&self, repo_id: &str, revision: &str) -> Result<Vec<String>> {
        let mut url = self.tree_url(repo_id, revision);
        let mut files = Vec::new();

        loop {
            let resp = self.authorized(self.client.get(&url)).send().await?;
            let resp = check_status(resp).await?;
            let next = next_page(resp.headers());

            let entries: Vec<TreeEntry> = resp.json().await?;
            files.extend(
                entries
                    .into_iter()
                    .filter(|e| e.kind == "file")
                    .map(|e| e.path),
            );

            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(repo_id = %repo_id, revision = %revision, count = files.len(), "Listed hub files");
        files.sort();
        Ok(files)
    }

    async fn download_file(
        &self,
        repo_id: &str,
        revision: &str,
        path: &str,
        dest: &Path,
    ) -> Result<u64> {
        let resp = self
            .authorized(self.client.get(self.resolve_url(repo_id, revision, path)?))
            .send()
            .await?;
        let mut resp = check_status(resp).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn upload_file(
        &self,
        repo_id: &str,
        revision: &str,
        path_in_repo: &str,
        data: Bytes,
    ) -> Result<()> {
        let summary = format!("Upload {path_in_repo}");
        let body = commit_body(&summary, &[(path_in_repo.to_string(), data)]);
        self.commit(repo_id, revision, body).await
    }

    /// Uploads the whole folder as a single commit.
    async fn upload_folder(
        &self,
        repo_id: &str,
        revision: &str,
        local_dir: &Path,
        path_in_repo: &str,
    ) -> Result<usize> {
        let files = collect_folder_files(local_dir)?;
        let mut payload = Vec::with_capacity(files.len());
        for (relative, path) in &files {
            let data = tokio::fs::read(path).await?;
            payload.push((join_repo_path(path_in_repo, relative), Bytes::from(data)));
        }

        let summary = format!("Upload {path_in_repo}");
        self.commit(repo_id, revision, commit_body(&summary, &payload))
            .await?;
        Ok(files.len())
    }
}

/// Build the NDJSON commit payload: one header line, then one line per file.
fn commit_body(summary: &str, files: &[(String, Bytes)]) -> String {
    let mut lines = Vec::with_capacity(files.len() + 1);
    lines.push(
        json!({
            "key": "header",
            "value": { "summary": summary, "description": "" },
        })
        .to_string(),
    );
    for (path, data) in files {
        lines.push(
            json!({
                "key": "file",
                "value": {
                    "content": base64::engine::general_purpose::STANDARD.encode(data),
                    "path": path,
                    "encoding": "base64",
                },
            })
            .to_string(),
        );
    }
    lines.join("\n")
}

/// Turn non-success statuses into errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = resp.url().to_string();
    let text = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        Err(KilnError::NotFound(url))
    } else {
        Err(KilnError::Transport(format!(
            "{} returned {}: {}",
            url,
            status.as_u16(),
            text
        )))
    }
}

/// Extract the `rel="next"` target of a `Link` header.
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Revisions like `refs/pr/1` must be a single path segment.
fn encode_revision(revision: &str) -> String {
    revision.replace('/', "%2F")
}
