//! Named scratch directories.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// A directory at a fixed path that is removed, with its content, on drop.
///
/// Unlike a randomly named temporary directory, creation fails with
/// [`io::ErrorKind::AlreadyExists`] if the path is already taken, so two
/// users can never share one.
#[derive(Debug)]
pub struct StaticTempDir {
    path: PathBuf,
}

impl StaticTempDir {
    /// Create the directory (and missing parents).
    ///
    /// Removal on drop is synchronous.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "{} already exists, cannot use it as a temporary directory",
                        path.display()
                    ),
                )
            } else {
                e
            }
        })?;
        Ok(Self { path })
    }

    /// Path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StaticTempDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temporary directory");
            }
        }
    }
}
