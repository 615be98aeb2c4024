//! Artifact repository abstraction.
//!
//! A repository is a versioned file store addressed by a repository id and a
//! revision. Backends:
//! - Local directory mirror (always available)
//! - Hosted model hub over HTTP (with `hub` feature)

mod local;

#[cfg(feature = "hub")]
mod hub;

pub use local::LocalRepository;

#[cfg(feature = "hub")]
pub use hub::HubRepository;

use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};
use bytes::Bytes;

/// Public hub endpoint.
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Revision used when none is specified.
pub const DEFAULT_REVISION: &str = "main";

/// Trait for remote artifact repositories.
///
/// All methods are async to support both local and remote stores. Only the
/// `upload_*` methods mutate the repository.
#[allow(async_fn_in_trait)]
pub trait ArtifactRepository: Send + Sync {
    /// List every file in the repository at `revision` as `/`-separated
    /// paths relative to the repository root.
    async fn list_files(&self, repo_id: &str, revision: &str) -> Result<Vec<String>>;

    /// Download one file to `dest`, creating parent directories.
    ///
    /// Returns the number of bytes written.
    async fn download_file(
        &self,
        repo_id: &str,
        revision: &str,
        path: &str,
        dest: &Path,
    ) -> Result<u64>;

    /// Upload `data` to `path_in_repo`.
    async fn upload_file(
        &self,
        repo_id: &str,
        revision: &str,
        path_in_repo: &str,
        data: Bytes,
    ) -> Result<()>;

    /// Upload every file under `local_dir` beneath `path_in_repo`.
    ///
    /// Returns the number of files uploaded.
    async fn upload_folder(
        &self,
        repo_id: &str,
        revision: &str,
        local_dir: &Path,
        path_in_repo: &str,
    ) -> Result<usize> {
        let files = collect_folder_files(local_dir)?;
        for (relative, path) in &files {
            let data = tokio::fs::read(path).await?;
            let target = join_repo_path(path_in_repo, relative);
            self.upload_file(repo_id, revision, &target, Bytes::from(data))
                .await?;
        }
        Ok(files.len())
    }
}

/// Collect all regular files below `dir` as `(relative posix path, absolute path)`,
/// sorted by relative path.
pub fn collect_folder_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Err(KilnError::NotFound(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| KilnError::Storage(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| KilnError::Storage(e.to_string()))?;
        files.push((to_posix(relative), entry.path().to_path_buf()));
    }

    files.sort();
    Ok(files)
}

/// Join repository path segments with `/`, ignoring empty parts.
#[must_use]
pub fn join_repo_path(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

/// Render a relative filesystem path with `/` separators.
#[must_use]
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
