//! Remote cache for sharing compiled models across machines.
//!
//! Compiled artifacts live in hosted repositories under their
//! [`CachePath`](crate::keys::CachePath). [`HubCache`] looks them up,
//! downloads them into a local cache directory on a hit and publishes newly
//! compiled artifacts after a miss.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_cache::config::{HubCacheConfig, RuntimeDefaults};
//! use kiln_cache::keys::{FingerprintBuilder, PretrainedModel};
//! use kiln_cache::remote::HubCache;
//! use kiln_core::{Precision, StateDict};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = HubCache::from_config(HubCacheConfig::from_env()?);
//!
//! let model = PretrainedModel::new("bert", StateDict::new());
//! let fingerprint = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
//!     .build(&RuntimeDefaults::from_env())?;
//!
//! if !cache.download(&fingerprint, None, false).await? {
//!     // compile, then publish
//!     cache.upload(&fingerprint, "/tmp/compiled".as_ref(), None, false).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! There is no mutual exclusion between processes populating the same cache
//! path: two callers may both miss, compile and upload. The repository's own
//! commit semantics decide which artifact ends up stored.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use kiln_core::storage::{join_repo_path, ArtifactRepository};
use kiln_core::KilnError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{CacheRepo, ConfigError, HubCacheConfig};
use crate::keys::{CachePath, CompilableModel, FingerprintError, ModelFingerprint};
use crate::staging::StaticTempDir;

/// Errors that can occur in remote cache operations.
#[derive(Error, Debug)]
pub enum RemoteCacheError {
    /// Configuration error, surfaced unchanged.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Repository (transport or storage) error.
    #[error("Repository error: {0}")]
    Repository(#[from] KilnError),

    /// Fingerprint could not be hashed.
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A repository path would resolve outside the download target.
    #[error("repository path {0} escapes the download directory")]
    UnsafePath(String),

    /// Staging directory could not be created.
    #[error("cannot create staging directory {}: {source}", .path.display())]
    Staging {
        /// Staging directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Result type for remote cache operations.
pub type Result<T> = std::result::Result<T, RemoteCacheError>;

/// A cache entry located in a remote repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    /// Repository identifier.
    pub repo_id: String,
    /// Folder within the repository (the `/`-joined cache path).
    pub folder: String,
    /// Revision the entry was found in or written to.
    pub revision: String,
}

impl CachedArtifact {
    fn new(repo: &CacheRepo, cache_path: &CachePath) -> Self {
        Self {
            repo_id: repo.repo_id.clone(),
            folder: cache_path.as_posix(),
            revision: repo.revision.clone(),
        }
    }
}

/// Lookup, download and publish of compiled artifacts.
///
/// Every operation runs to completion on the calling task; nothing is
/// scheduled in the background and failures are never retried.
pub struct HubCache<R: ArtifactRepository> {
    repository: R,
    config: HubCacheConfig,
}

#[cfg(feature = "hub")]
impl HubCache<kiln_core::HubRepository> {
    /// Create a cache client talking to the hub configured in `config`.
    pub fn from_config(config: HubCacheConfig) -> Self {
        let repository = kiln_core::HubRepository::new(&config.endpoint, config.token.clone());
        Self::new(repository, config)
    }
}

impl<R: ArtifactRepository> HubCache<R> {
    /// Create a cache client over an explicit repository handle.
    pub fn new(repository: R, config: HubCacheConfig) -> Self {
        Self { repository, config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &HubCacheConfig {
        &self.config
    }

    /// Get the underlying repository.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Find the first configured repository holding `fingerprint`.
    ///
    /// Repositories are scanned in configuration order. A repository holds
    /// the entry if any of its files sits directly in the cache path folder.
    pub async fn find<M: CompilableModel + ?Sized>(
        &self,
        fingerprint: &ModelFingerprint<'_, M>,
    ) -> Result<Option<CachedArtifact>> {
        let cache_path = fingerprint.cache_path()?;
        self.find_path(&cache_path).await
    }

    async fn find_path(&self, cache_path: &CachePath) -> Result<Option<CachedArtifact>> {
        for repo in &self.config.repos {
            if self.exists_in(repo, cache_path).await? {
                debug!(repo_id = %repo.repo_id, revision = %repo.revision, cache_path = %cache_path, "Cache hit");
                return Ok(Some(CachedArtifact::new(repo, cache_path)));
            }
        }

        debug!(cache_path = %cache_path, "Cache miss");
        Ok(None)
    }

    async fn exists_in(&self, repo: &CacheRepo, cache_path: &CachePath) -> Result<bool> {
        let files = self
            .repository
            .list_files(&repo.repo_id, &repo.revision)
            .await?;
        Ok(files.iter().any(|f| cache_path.contains_file(f)))
    }

    /// Download the entry for `fingerprint`, returning whether it was found.
    ///
    /// Files land in `target`, or the configured local cache root when
    /// `target` is `None`. With `preserve_remote_tree` the repository layout
    /// `<cache_path>/<files>` is kept; otherwise the files are placed
    /// directly in the target directory.
    pub async fn download<M: CompilableModel + ?Sized>(
        &self,
        fingerprint: &ModelFingerprint<'_, M>,
        target: Option<&Path>,
        preserve_remote_tree: bool,
    ) -> Result<bool> {
        let target = match target {
            Some(dir) => dir.to_path_buf(),
            None => self
                .config
                .cache_root
                .dir()
                .map(Path::to_path_buf)
                .ok_or(ConfigError::CacheDisabled)?,
        };

        let cache_path = fingerprint.cache_path()?;
        let Some(artifact) = self.find_path(&cache_path).await? else {
            return Ok(false);
        };

        let files: Vec<(String, String)> = self
            .repository
            .list_files(&artifact.repo_id, &artifact.revision)
            .await?
            .into_iter()
            .filter_map(|file| {
                let relative = cache_path.strip_from(&file)?.to_string();
                Some((file, relative))
            })
            .collect();

        debug!(
            repo_id = %artifact.repo_id,
            cache_path = %cache_path,
            files = files.len(),
            preserve_remote_tree,
            "Downloading cached model"
        );
        tokio::fs::create_dir_all(&target).await?;

        let bytes = if preserve_remote_tree {
            self.download_files(&artifact, &files, &target, true).await?
        } else {
            let staging_path =
                target.join(format!(".kiln-staging-{}", cache_path.overall_hash));
            let staging = StaticTempDir::create(&staging_path).await.map_err(|source| {
                RemoteCacheError::Staging {
                    path: staging_path.clone(),
                    source,
                }
            })?;

            let bytes = self
                .download_files(&artifact, &files, staging.path(), false)
                .await?;
            move_contents(staging.path(), &target).await?;
            bytes
        };

        info!(
            repo_id = %artifact.repo_id,
            cache_path = %cache_path,
            files = files.len(),
            bytes,
            target = %target.display(),
            "Downloaded cached model"
        );
        Ok(true)
    }

    /// Download `(repo path, path relative to the cache path)` pairs below `dest_root`.
    async fn download_files(
        &self,
        artifact: &CachedArtifact,
        files: &[(String, String)],
        dest_root: &Path,
        keep_tree: bool,
    ) -> Result<u64> {
        let mut bytes = 0;
        for (file, relative) in files {
            let dest = local_path(dest_root, if keep_tree { file } else { relative })?;
            bytes += self
                .repository
                .download_file(&artifact.repo_id, &artifact.revision, file, &dest)
                .await?;
        }
        Ok(bytes)
    }

    /// Publish a compiled artifact for `fingerprint`.
    ///
    /// A directory is uploaded as a tree below the cache path, a single file
    /// as `<cache_path>/<file name>`. `repo_id` defaults to the first
    /// configured repository.
    ///
    /// Unless `overwrite` is set, nothing is written when the destination
    /// already holds an entry. The returned record then describes the
    /// existing destination; callers cannot tell a skip from an upload
    /// through the return value.
    pub async fn upload<M: CompilableModel + ?Sized>(
        &self,
        fingerprint: &ModelFingerprint<'_, M>,
        local_path: &Path,
        repo_id: Option<&str>,
        overwrite: bool,
    ) -> Result<CachedArtifact> {
        let repo = self.upload_repo(repo_id)?;
        let cache_path = fingerprint.cache_path()?;
        let artifact = CachedArtifact::new(&repo, &cache_path);

        if !overwrite && self.exists_in(&repo, &cache_path).await? {
            info!(
                local_path = %local_path.display(),
                repo_id = %repo.repo_id,
                cache_path = %cache_path,
                "Did not push the cached model because it already exists in the repository; \
                 pass overwrite to replace it"
            );
            return Ok(artifact);
        }

        let folder = cache_path.as_posix();
        let metadata = tokio::fs::metadata(local_path).await?;
        let count = if metadata.is_dir() {
            self.repository
                .upload_folder(&repo.repo_id, &repo.revision, local_path, &folder)
                .await?
        } else {
            let file_name = local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "{} has no file name",
                        local_path.display()
                    ))
                })?;
            let data = tokio::fs::read(local_path).await?;
            self.repository
                .upload_file(
                    &repo.repo_id,
                    &repo.revision,
                    &join_repo_path(&folder, &file_name),
                    Bytes::from(data),
                )
                .await?;
            1
        };

        info!(
            repo_id = %repo.repo_id,
            cache_path = %cache_path,
            files = count,
            "Pushed cached model"
        );
        Ok(artifact)
    }

    fn upload_repo(&self, repo_id: Option<&str>) -> Result<CacheRepo> {
        match repo_id {
            Some(id) => Ok(self
                .config
                .repo(id)
                .cloned()
                .unwrap_or_else(|| CacheRepo::new(id))),
            None => self.config.default_repo().cloned().ok_or_else(|| {
                ConfigError::Invalid("no cache repository configured".into()).into()
            }),
        }
    }
}

/// Map a `/`-separated repository path below `root`.
///
/// `.` and `..` segments are refused; empty ones are skipped.
fn local_path(root: &Path, repo_path: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in repo_path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(RemoteCacheError::UnsafePath(repo_path.to_string()));
        }
        path.push(segment);
    }
    Ok(path)
}

/// Move every entry of `from` into `to`, replacing existing entries.
async fn move_contents(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let dest = to.join(entry.file_name());
        match tokio::fs::symlink_metadata(&dest).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&dest).await?,
            Ok(_) => tokio::fs::remove_file(&dest).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::rename(entry.path(), &dest).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheRoot, RuntimeDefaults};
    use crate::keys::{FingerprintBuilder, PretrainedModel};
    use kiln_core::{LocalRepository, Precision, StateDict, Tensor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Local repository counting write calls.
    struct CountingRepository {
        inner: LocalRepository,
        writes: AtomicUsize,
    }

    impl CountingRepository {
        fn new(root: &Path) -> Self {
            Self {
                inner: LocalRepository::new(root).unwrap(),
                writes: AtomicUsize::new(0),
            }
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl ArtifactRepository for CountingRepository {
        async fn list_files(&self, repo_id: &str, revision: &str) -> kiln_core::Result<Vec<String>> {
            self.inner.list_files(repo_id, revision).await
        }

        async fn download_file(
            &self,
            repo_id: &str,
            revision: &str,
            path: &str,
            dest: &Path,
        ) -> kiln_core::Result<u64> {
            self.inner.download_file(repo_id, revision, path, dest).await
        }

        async fn upload_file(
            &self,
            repo_id: &str,
            revision: &str,
            path_in_repo: &str,
            data: Bytes,
        ) -> kiln_core::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner
                .upload_file(repo_id, revision, path_in_repo, data)
                .await
        }
    }

    fn model() -> PretrainedModel {
        let mut dict = StateDict::new();
        dict.insert(
            "classifier.weight",
            Tensor::new(vec![2, 2], Precision::Float32, vec![0u8; 16]).unwrap(),
        );
        PretrainedModel::new("bert", dict)
    }

    fn defaults() -> RuntimeDefaults {
        RuntimeDefaults::new(2, Some("2.10".into()))
    }

    fn config(repos: &[&str]) -> HubCacheConfig {
        HubCacheConfig::new(repos.iter().map(|r| CacheRepo::new(*r)).collect())
            .with_cache_root(CacheRoot::Disabled)
    }

    fn compiled_dir(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("compiled");
        std::fs::create_dir_all(dir.join("graph")).unwrap();
        std::fs::write(dir.join("model.neff"), b"neff").unwrap();
        std::fs::write(dir.join("graph/ops.json"), b"{}").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_find_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a", "org/b"]),
        );
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();

        assert!(cache.find(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_first_repo_in_order() {
        let tmp = TempDir::new().unwrap();
        let repo = LocalRepository::new(tmp.path().join("hub")).unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let folder = fp.cache_path().unwrap().as_posix();

        for repo_id in ["org/b", "org/c"] {
            repo.upload_file(
                repo_id,
                "main",
                &format!("{folder}/model.neff"),
                Bytes::from_static(b"neff"),
            )
            .await
            .unwrap();
        }

        let cache = HubCache::new(repo, config(&["org/a", "org/b", "org/c"]));
        let found = cache.find(&fp).await.unwrap().unwrap();
        assert_eq!(
            found,
            CachedArtifact {
                repo_id: "org/b".into(),
                folder,
                revision: "main".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_find_ignores_nested_files() {
        let tmp = TempDir::new().unwrap();
        let repo = LocalRepository::new(tmp.path().join("hub")).unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let folder = fp.cache_path().unwrap().as_posix();

        // Only a file nested below the cache path: its parent is not the cache path
        repo.upload_file("org/a", "main", &format!("{folder}/graph/ops.json"), Bytes::new())
            .await
            .unwrap();

        let cache = HubCache::new(repo, config(&["org/a"]));
        assert!(cache.find(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_requires_target() {
        let tmp = TempDir::new().unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();

        let err = cache.download(&fp, None, false).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteCacheError::Config(ConfigError::CacheDisabled)
        ));
    }

    #[tokio::test]
    async fn test_download_miss_is_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let target = tmp.path().join("target");

        assert!(!cache.download(&fp, Some(&target), false).await.unwrap());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_download_flattens_by_default() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        cache
            .upload(&fp, &compiled_dir(&tmp), None, false)
            .await
            .unwrap();

        let target = tmp.path().join("target");
        assert!(cache.download(&fp, Some(&target), false).await.unwrap());

        assert_eq!(std::fs::read(target.join("model.neff")).unwrap(), b"neff");
        assert!(target.join("graph/ops.json").exists());
        assert!(!target.join("2.10").exists());

        let mut names: Vec<_> = std::fs::read_dir(&target)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        // Staging directory removed
        assert_eq!(names, vec!["graph".to_string(), "model.neff".to_string()]);
    }

    #[tokio::test]
    async fn test_download_preserves_tree() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        cache
            .upload(&fp, &compiled_dir(&tmp), None, false)
            .await
            .unwrap();

        let target = tmp.path().join("target");
        assert!(cache.download(&fp, Some(&target), true).await.unwrap());

        let nested = target.join(fp.cache_path().unwrap().to_path_buf());
        assert!(nested.join("model.neff").exists());
        assert!(nested.join("graph/ops.json").exists());
    }

    #[tokio::test]
    async fn test_download_staging_collision_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        cache
            .upload(&fp, &compiled_dir(&tmp), None, false)
            .await
            .unwrap();

        let target = tmp.path().join("target");
        let hash = &fp.compute_hash().unwrap().overall_hash;
        std::fs::create_dir_all(target.join(format!(".kiln-staging-{hash}"))).unwrap();

        let err = cache.download(&fp, Some(&target), false).await.unwrap_err();
        assert!(matches!(err, RemoteCacheError::Staging { .. }));
    }

    #[tokio::test]
    async fn test_download_defaults_to_cache_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("neuron-compile-cache");
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]).with_cache_root(CacheRoot::Dir(root.clone())),
        );
        cache
            .upload(&fp, &compiled_dir(&tmp), None, false)
            .await
            .unwrap();

        assert!(cache.download(&fp, None, true).await.unwrap());
        assert!(root
            .join(fp.cache_path().unwrap().to_path_buf())
            .join("model.neff")
            .exists());
    }

    #[tokio::test]
    async fn test_upload_single_file() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let file = tmp.path().join("model.neff");
        std::fs::write(&file, b"neff").unwrap();

        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&["org/a"]),
        );
        let record = cache.upload(&fp, &file, None, false).await.unwrap();

        let files = cache
            .repository()
            .list_files("org/a", "main")
            .await
            .unwrap();
        assert_eq!(files, vec![format!("{}/model.neff", record.folder)]);
        assert_eq!(record.repo_id, "org/a");
    }

    #[tokio::test]
    async fn test_upload_skips_existing_without_writes() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            CountingRepository::new(&tmp.path().join("hub")),
            config(&["org/a"]),
        );
        let dir = compiled_dir(&tmp);

        let first = cache.upload(&fp, &dir, None, false).await.unwrap();
        let writes = cache.repository().writes();
        assert_eq!(writes, 2);

        let second = cache.upload(&fp, &dir, None, false).await.unwrap();
        assert_eq!(cache.repository().writes(), writes);
        assert_eq!(first, second);

        cache.upload(&fp, &dir, None, true).await.unwrap();
        assert_eq!(cache.repository().writes(), writes * 2);
    }

    #[tokio::test]
    async fn test_upload_to_explicit_repo() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            HubCacheConfig::new(vec![
                CacheRepo::new("org/a"),
                CacheRepo::new("org/b").with_revision("dev"),
            ]),
        );

        let record = cache
            .upload(&fp, &compiled_dir(&tmp), Some("org/b"), false)
            .await
            .unwrap();
        assert_eq!(record.revision, "dev");
        assert_eq!(cache.find(&fp).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_upload_without_repos() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let cache = HubCache::new(
            LocalRepository::new(tmp.path().join("hub")).unwrap(),
            config(&[]),
        );

        let err = cache
            .upload(&fp, &compiled_dir(&tmp), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteCacheError::Config(ConfigError::Invalid(_))));
    }

    /// Read-only repository serving a fixed listing; every file holds its own path.
    struct FixedListing {
        files: Vec<String>,
    }

    impl ArtifactRepository for FixedListing {
        async fn list_files(&self, _repo_id: &str, _revision: &str) -> kiln_core::Result<Vec<String>> {
            Ok(self.files.clone())
        }

        async fn download_file(
            &self,
            _repo_id: &str,
            _revision: &str,
            path: &str,
            dest: &Path,
        ) -> kiln_core::Result<u64> {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, path.as_bytes()).await?;
            Ok(path.len() as u64)
        }

        async fn upload_file(
            &self,
            _repo_id: &str,
            _revision: &str,
            path_in_repo: &str,
            _data: Bytes,
        ) -> kiln_core::Result<()> {
            Err(KilnError::Storage(format!("read-only listing: {path_in_repo}")))
        }
    }

    #[tokio::test]
    async fn test_download_skips_entries_escaping_target() {
        let tmp = TempDir::new().unwrap();
        let model = model();
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults())
            .unwrap();
        let folder = fp.cache_path().unwrap().as_posix();
        let cache = HubCache::new(
            FixedListing {
                files: vec![
                    format!("{folder}/model.neff"),
                    format!("{folder}/../../../../../../escaped.txt"),
                    format!("{folder}/graph/./ops.json"),
                ],
            },
            config(&["org/a"]),
        );

        for preserve_remote_tree in [false, true] {
            let target = tmp.path().join(format!("deep/a/b/c/d/target-{preserve_remote_tree}"));
            assert!(cache
                .download(&fp, Some(&target), preserve_remote_tree)
                .await
                .unwrap());

            let neff = if preserve_remote_tree {
                target.join(&folder).join("model.neff")
            } else {
                target.join("model.neff")
            };
            assert!(neff.exists());
        }

        let escaped: Vec<_> = files_below(tmp.path())
            .into_iter()
            .filter(|p| p.ends_with("escaped.txt") || p.ends_with("ops.json"))
            .collect();
        assert!(escaped.is_empty(), "unexpected files: {escaped:?}");
    }

    #[test]
    fn test_local_path_refuses_parent_segments() {
        let root = Path::new("/cache");
        assert_eq!(
            local_path(root, "/a//b/model.neff").unwrap(),
            PathBuf::from("/cache/a/b/model.neff")
        );
        assert!(matches!(
            local_path(root, "a/../../etc/passwd"),
            Err(RemoteCacheError::UnsafePath(_))
        ));
        assert!(matches!(
            local_path(root, "./model.neff"),
            Err(RemoteCacheError::UnsafePath(_))
        ));
    }

    /// Every file below `dir`.
    fn files_below(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }
}
