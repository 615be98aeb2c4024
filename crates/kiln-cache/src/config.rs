//! Cache configuration.
//!
//! The accelerator compiler reads its options from a single flags string
//! (`NEURON_CC_FLAGS`). Two of its tokens matter for caching:
//! - `--no-cache` disables the local compile cache entirely
//! - `--cache_dir=<path>` overrides the cache base directory
//!
//! [`CompilerFlags`] parses that string once into named fields and only
//! renders it back to a string at the process boundary, leaving every
//! unrelated token untouched and in order. [`HubCacheConfig`] carries the
//! remaining settings (hub endpoint, credentials, repository list) and is
//! passed explicitly to [`HubCache`](crate::remote::HubCache).

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use kiln_core::{DEFAULT_HUB_ENDPOINT, DEFAULT_REVISION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable holding the compiler flags string.
pub const NEURON_CC_FLAGS: &str = "NEURON_CC_FLAGS";

/// Flag that disables the compile cache.
pub const NO_CACHE_FLAG: &str = "--no-cache";

/// Flag prefix of the cache directory override.
pub const CACHE_DIR_FLAG: &str = "--cache_dir=";

/// Base directory used when no override is given.
pub const DEFAULT_CACHE_BASE: &str = "/var/tmp";

/// Subdirectory appended to the base directory.
pub const CACHE_SUBDIR: &str = "neuron-compile-cache";

/// Repository consulted when none is configured.
pub const DEFAULT_CACHE_REPO: &str = "aws-neuron/optimum-neuron-cache";

/// Environment variable naming the cache repositories (`repo[@revision],...`).
pub const CACHE_REPOS_ENV: &str = "KILN_CACHE_REPOS";

/// Environment variable overriding the hub endpoint.
pub const HUB_ENDPOINT_ENV: &str = "KILN_HUB_ENDPOINT";

/// Environment variable holding the hub token.
pub const HUB_TOKEN_ENV: &str = "HF_TOKEN";

/// Environment variable holding the per-node worker count.
pub const WORLD_SIZE_ENV: &str = "LOCAL_WORLD_SIZE";

/// Errors raised while resolving configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Caching is disabled and the operation needs a cache directory.
    #[error(
        "compilation caching is disabled (--no-cache is set in NEURON_CC_FLAGS); \
         an explicit override is required to use a cache directory"
    )]
    CacheDisabled,

    /// A setting could not be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Resolved local cache root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRoot {
    /// Caching was disabled through the compiler flags.
    Disabled,
    /// Cache files live below this directory.
    Dir(PathBuf),
}

impl CacheRoot {
    /// The directory, unless caching is disabled.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Disabled => None,
            Self::Dir(path) => Some(path),
        }
    }

    /// Whether caching is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

/// A single token of the compiler flags string.
#[derive(Clone, Debug, PartialEq, Eq)]
enum FlagToken {
    NoCache,
    CacheDir(PathBuf),
    Other(String),
}

impl fmt::Display for FlagToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCache => f.write_str(NO_CACHE_FLAG),
            Self::CacheDir(path) => write!(f, "{CACHE_DIR_FLAG}{}", path.display()),
            Self::Other(token) => f.write_str(token),
        }
    }
}

/// Parsed compiler flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilerFlags {
    tokens: Vec<FlagToken>,
}

impl CompilerFlags {
    /// Parse a whitespace separated flags string.
    #[must_use]
    pub fn parse(flags: &str) -> Self {
        let tokens = flags
            .split_whitespace()
            .map(|token| {
                if token == NO_CACHE_FLAG {
                    FlagToken::NoCache
                } else if let Some(dir) = token.strip_prefix(CACHE_DIR_FLAG) {
                    if dir.is_empty() {
                        FlagToken::Other(token.to_string())
                    } else {
                        FlagToken::CacheDir(PathBuf::from(dir))
                    }
                } else {
                    FlagToken::Other(token.to_string())
                }
            })
            .collect();
        Self { tokens }
    }

    /// Read and parse `NEURON_CC_FLAGS`; an unset variable means no flags.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(NEURON_CC_FLAGS).unwrap_or_default())
    }

    /// Whether the disable marker is present.
    #[must_use]
    pub fn is_cache_disabled(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, FlagToken::NoCache))
    }

    /// The cache base directory override, if any. The last one wins.
    #[must_use]
    pub fn cache_dir(&self) -> Option<&Path> {
        self.tokens.iter().rev().find_map(|t| match t {
            FlagToken::CacheDir(path) => Some(path.as_path()),
            _ => None,
        })
    }

    /// Resolve the local cache root.
    ///
    /// The disable marker wins over any directory override. The directory is
    /// not created here.
    #[must_use]
    pub fn local_cache_root(&self) -> CacheRoot {
        if self.is_cache_disabled() {
            return CacheRoot::Disabled;
        }
        let base = self
            .cache_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_BASE));
        CacheRoot::Dir(base.join(CACHE_SUBDIR))
    }

    /// Point the cache base directory at `path`.
    ///
    /// Fails with [`ConfigError::CacheDisabled`] when caching is disabled and
    /// `allow_override_of_disabled` is false. An allowed override also drops
    /// the disable marker so the new directory takes effect.
    pub fn set_local_cache_root(
        &mut self,
        path: impl AsRef<Path>,
        allow_override_of_disabled: bool,
    ) -> Result<()> {
        if self.is_cache_disabled() && !allow_override_of_disabled {
            return Err(ConfigError::CacheDisabled);
        }

        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache directory must not be empty".into()));
        }

        self.tokens.retain(|t| !matches!(t, FlagToken::NoCache));

        // Replace the first override in place and drop any later ones.
        let mut replaced = false;
        self.tokens.retain_mut(|t| {
            if let FlagToken::CacheDir(existing) = t {
                if replaced {
                    return false;
                }
                *existing = path.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.tokens.push(FlagToken::CacheDir(path));
        }

        debug!(flags = %self, "Updated compiler flags");
        Ok(())
    }

    /// Render the flags string.
    #[must_use]
    pub fn to_flags_string(&self) -> String {
        self.to_string()
    }

    /// The `(variable, value)` pair to export to the compiler process.
    #[must_use]
    pub fn env_pair(&self) -> (&'static str, String) {
        (NEURON_CC_FLAGS, self.to_flags_string())
    }
}

impl fmt::Display for CompilerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

/// Resolve the local cache root from the process environment.
#[must_use]
pub fn get_local_cache_root() -> CacheRoot {
    CompilerFlags::from_env().local_cache_root()
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

/// A cache repository and the revision to read from and write to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRepo {
    /// Repository identifier, e.g. `org/name`.
    pub repo_id: String,
    /// Revision or branch.
    #[serde(default = "default_revision")]
    pub revision: String,
}

impl CacheRepo {
    /// Repository on the default revision.
    #[must_use]
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: default_revision(),
        }
    }

    /// Set the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Parse `repo_id` or `repo_id@revision`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (repo_id, revision) = match value.split_once('@') {
            Some((repo_id, revision)) => (repo_id.trim(), revision.trim()),
            None => (value, DEFAULT_REVISION),
        };
        if repo_id.is_empty() || revision.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "invalid cache repository `{value}`"
            )));
        }
        Ok(Self::new(repo_id).with_revision(revision))
    }
}

/// Configuration for the remote cache client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubCacheConfig {
    /// Hub endpoint URL.
    pub endpoint: String,
    /// Access token. Never serialized.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// Repositories scanned in order on lookup; the first is the upload default.
    pub repos: Vec<CacheRepo>,
    /// Local cache root used when no download target is given.
    pub cache_root: CacheRoot,
}

impl HubCacheConfig {
    /// Config scanning `repos`, caching under the default local root.
    #[must_use]
    pub fn new(repos: Vec<CacheRepo>) -> Self {
        Self {
            endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            token: None,
            repos,
            cache_root: CompilerFlags::default().local_cache_root(),
        }
    }

    /// Set the hub endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the access token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the local cache root.
    #[must_use]
    pub fn with_cache_root(mut self, cache_root: CacheRoot) -> Self {
        self.cache_root = cache_root;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - `KILN_HUB_ENDPOINT`: hub endpoint
    /// - `HF_TOKEN`: hub access token
    /// - `KILN_CACHE_REPOS`: comma separated `repo[@revision]` list
    /// - `NEURON_CC_FLAGS`: local cache root resolution
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(HUB_ENDPOINT_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_HUB_ENDPOINT.to_string());

        let token = std::env::var(HUB_TOKEN_ENV).ok().filter(|s| !s.is_empty());

        let repos = match std::env::var(CACHE_REPOS_ENV) {
            Ok(list) if !list.trim().is_empty() => parse_repo_list(&list)?,
            _ => vec![CacheRepo::new(DEFAULT_CACHE_REPO)],
        };

        Ok(Self {
            endpoint,
            token,
            repos,
            cache_root: get_local_cache_root(),
        })
    }

    /// The repository uploads go to by default.
    #[must_use]
    pub fn default_repo(&self) -> Option<&CacheRepo> {
        self.repos.first()
    }

    /// Look up a configured repository by id.
    #[must_use]
    pub fn repo(&self, repo_id: &str) -> Option<&CacheRepo> {
        self.repos.iter().find(|r| r.repo_id == repo_id)
    }
}

impl Default for HubCacheConfig {
    fn default() -> Self {
        Self::new(vec![CacheRepo::new(DEFAULT_CACHE_REPO)])
    }
}

/// Parse a comma separated `repo[@revision]` list.
pub fn parse_repo_list(list: &str) -> Result<Vec<CacheRepo>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(CacheRepo::parse)
        .collect()
}

/// Values taken from the runtime environment when a fingerprint leaves
/// them unspecified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeDefaults {
    /// Accelerator core count (always at least 1).
    pub num_cores: u32,
    /// Installed compiler version, if it could be determined.
    pub compiler_version: Option<String>,
}

impl RuntimeDefaults {
    /// Explicit defaults. A zero core count is raised to 1.
    #[must_use]
    pub fn new(num_cores: u32, compiler_version: Option<String>) -> Self {
        Self {
            num_cores: num_cores.max(1),
            compiler_version: compiler_version.filter(|v| !v.is_empty()),
        }
    }

    /// Read `LOCAL_WORLD_SIZE` and query the installed compiler.
    #[must_use]
    pub fn from_env() -> Self {
        let num_cores = std::env::var(WORLD_SIZE_ENV)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(1);
        Self::new(num_cores, detect_compiler_version())
    }
}

/// Compiler executable probed for its version.
pub const COMPILER_BINARY: &str = "neuronx-cc";

/// Ask the installed compiler for its version string.
#[must_use]
pub fn detect_compiler_version() -> Option<String> {
    let output = match Command::new(COMPILER_BINARY).arg("--version").output() {
        Ok(output) => output,
        Err(e) => {
            warn!(binary = COMPILER_BINARY, error = %e, "Could not run compiler to detect its version");
            return None;
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let version = parse_compiler_version(&text);
    if version.is_none() {
        warn!(binary = COMPILER_BINARY, "Compiler did not report a version");
    }
    version
}

/// Extract the version from `--version` output such as
/// `NeuronX Compiler version 2.10.0.35+3817a0c8c`.
#[must_use]
pub fn parse_compiler_version(output: &str) -> Option<String> {
    let looks_like_version =
        |s: &str| s.starts_with(|c: char| c.is_ascii_digit()) && s.contains('.');

    for line in output.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("version")) {
            if let Some(candidate) = words.get(pos + 1) {
                if looks_like_version(candidate) {
                    return Some((*candidate).to_string());
                }
            }
        }
    }

    output
        .split_whitespace()
        .find(|w| looks_like_version(w))
        .map(str::to_string)
}
