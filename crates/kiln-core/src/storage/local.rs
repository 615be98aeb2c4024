//! Local filesystem repository backend.

use super::{to_posix, ArtifactRepository};
use crate::error::{KilnError, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Repository mirror on a local or shared filesystem.
///
/// Files live at `root/<repo_id>/<revision>/<path>`.
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    /// Create a new local repository backend.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the mirror.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn revision_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.root.join(repo_id).join(revision)
    }

    fn file_path(&self, repo_id: &str, revision: &str, path: &str) -> PathBuf {
        let mut full = self.revision_dir(repo_id, revision);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push(segment);
        }
        full
    }
}

/// Suffix of files still being written by `upload_file`.
const UPLOAD_SUFFIX: &str = ".kiln-upload";

impl ArtifactRepository for LocalRepository {
    async fn list_files(&self, repo_id: &str, revision: &str) -> Result<Vec<String>> {
        let dir = self.revision_dir(repo_id, revision);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry.map_err(|e| KilnError::Storage(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&dir) {
                let key = to_posix(relative);
                // Skip in-flight uploads
                if !key.ends_with(UPLOAD_SUFFIX) {
                    files.push(key);
                }
            }
        }

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
        let src = self.file_path(repo_id, revision, path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KilnError::NotFound(format!("{repo_id}@{revision}:{path}"))
            } else {
                KilnError::Io(e)
            }
        })
    }

    async fn upload_file(
        &self,
        repo_id: &str,
        revision: &str,
        path_in_repo: &str,
        data: Bytes,
    ) -> Result<()> {
        let path = self.file_path(repo_id, revision, path_in_repo);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write atomically via temp file + rename
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(UPLOAD_SUFFIX);
        let temp_path = path.with_file_name(temp_name);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}
