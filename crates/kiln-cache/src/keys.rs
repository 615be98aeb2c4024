//! Cache key generation for compiled models.
//!
//! A compiled artifact is identified by a [`ModelFingerprint`]: the model
//! weights plus every compile setting that changes the output (input shapes,
//! precision, accelerator core count and compiler version).
//!
//! Two digests are derived from it:
//! - `model_hash`: SHA-256 of the canonical weight encoding only
//! - `overall_hash`: SHA-256 of the canonical fingerprint record, which
//!   embeds `model_hash`
//!
//! Together with the compiler version and the model architecture they form
//! the hierarchical [`CachePath`]
//! `<compiler_version>/<model_type>/<model_hash>/<overall_hash>`, used both
//! as the remote repository folder and the local cache subdirectory.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use kiln_core::{hash_file, KilnError, Precision, StateDict};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::RuntimeDefaults;

/// File name used for the temporary serializations that get hashed.
pub const HASH_FILE_NAME: &str = "pytorch_model.bin";

/// Errors that can occur while fingerprinting a model.
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// I/O error while writing or hashing temporary files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hashing error.
    #[error("Hashing error: {0}")]
    Hash(#[from] KilnError),

    /// Fingerprint record could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No compiler version was given and none could be detected.
    #[error("compiler version unknown: pass one explicitly or install the compiler")]
    MissingCompilerVersion,

    /// Invalid fingerprint field.
    #[error("Invalid fingerprint: {0}")]
    Invalid(String),
}

/// Result type for fingerprint operations.
pub type Result<T> = std::result::Result<T, FingerprintError>;

/// A model that can be compiled and cached.
///
/// Implementations must write the same bytes for the same logical weights,
/// independent of process, time or memory layout.
pub trait CompilableModel: Send + Sync {
    /// Architecture tag, e.g. `"bert"`.
    fn model_type(&self) -> &str;

    /// Write the canonical encoding of the weights.
    fn write_state(&self, writer: &mut dyn Write) -> std::io::Result<()>;
}

/// A pretrained model: an architecture tag and its weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PretrainedModel {
    model_type: String,
    state_dict: StateDict,
}

impl PretrainedModel {
    /// Create a new pretrained model.
    #[must_use]
    pub fn new(model_type: impl Into<String>, state_dict: StateDict) -> Self {
        Self {
            model_type: model_type.into(),
            state_dict,
        }
    }

    /// Model weights.
    #[must_use]
    pub fn state_dict(&self) -> &StateDict {
        &self.state_dict
    }
}

impl CompilableModel for PretrainedModel {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn write_state(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        self.state_dict.write_canonical(writer)
    }
}

/// Digests of a fingerprint.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelHashes {
    /// Hash of the weights only.
    pub model_hash: String,
    /// Hash of the whole fingerprint record.
    pub overall_hash: String,
}

/// Builds a [`ModelFingerprint`], filling unset fields from [`RuntimeDefaults`].
pub struct FingerprintBuilder<'a, M: CompilableModel + ?Sized> {
    model: &'a M,
    input_shapes: Vec<usize>,
    precision: Precision,
    num_cores: Option<u32>,
    compiler_version: Option<String>,
    scratch_dir: Option<PathBuf>,
}

impl<'a, M: CompilableModel + ?Sized> FingerprintBuilder<'a, M> {
    /// Start a fingerprint for `model` compiled with the given shapes and precision.
    #[must_use]
    pub fn new(model: &'a M, input_shapes: Vec<usize>, precision: Precision) -> Self {
        Self {
            model,
            input_shapes,
            precision,
            num_cores: None,
            compiler_version: None,
            scratch_dir: None,
        }
    }

    /// Set the accelerator core count.
    #[must_use]
    pub fn num_cores(mut self, num_cores: u32) -> Self {
        self.num_cores = Some(num_cores);
        self
    }

    /// Set the compiler version. An empty string counts as unset.
    #[must_use]
    pub fn compiler_version(mut self, version: impl Into<String>) -> Self {
        self.compiler_version = Some(version.into()).filter(|v: &String| !v.is_empty());
        self
    }

    /// Create the temporary hashing files below `dir` instead of the system
    /// temporary directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Finish the fingerprint. Nothing is hashed yet.
    pub fn build(self, defaults: &RuntimeDefaults) -> Result<ModelFingerprint<'a, M>> {
        let num_cores = self.num_cores.unwrap_or(defaults.num_cores);
        if num_cores == 0 {
            return Err(FingerprintError::Invalid(
                "core count must be at least 1".into(),
            ));
        }

        let compiler_version = self
            .compiler_version
            .or_else(|| defaults.compiler_version.clone())
            .ok_or(FingerprintError::MissingCompilerVersion)?;
        if compiler_version.contains('/') {
            return Err(FingerprintError::Invalid(format!(
                "compiler version `{compiler_version}` cannot be used as a path segment"
            )));
        }

        let model_type = self.model.model_type();
        if model_type.is_empty() || model_type.contains('/') {
            return Err(FingerprintError::Invalid(format!(
                "model type `{model_type}` cannot be used as a path segment"
            )));
        }

        Ok(ModelFingerprint {
            model: self.model,
            input_shapes: self.input_shapes,
            precision: self.precision,
            num_cores,
            compiler_version,
            scratch_dir: self.scratch_dir,
            hashes: OnceLock::new(),
            hashing: Mutex::new(()),
        })
    }
}

/// Identifies a unique (model, compile configuration) pair.
///
/// All fields are immutable after construction. The digests are computed on
/// first use and memoized in `hashes`, the only interior-mutable field.
/// Concurrent first calls hash once; the others wait on `hashing`.
pub struct ModelFingerprint<'a, M: CompilableModel + ?Sized> {
    model: &'a M,
    input_shapes: Vec<usize>,
    precision: Precision,
    num_cores: u32,
    compiler_version: String,
    scratch_dir: Option<PathBuf>,
    hashes: OnceLock<ModelHashes>,
    hashing: Mutex<()>,
}

/// The record hashed into `overall_hash`. Field order is the serialization order.
#[derive(Serialize)]
struct FingerprintRecord<'r> {
    compiler_version: &'r str,
    input_shapes: &'r [usize],
    model_hash: &'r str,
    model_type: &'r str,
    num_neuron_cores: u32,
    precision: Precision,
}

impl<'a, M: CompilableModel + ?Sized> ModelFingerprint<'a, M> {
    /// Start building a fingerprint.
    #[must_use]
    pub fn builder(
        model: &'a M,
        input_shapes: Vec<usize>,
        precision: Precision,
    ) -> FingerprintBuilder<'a, M> {
        FingerprintBuilder::new(model, input_shapes, precision)
    }

    /// The fingerprinted model.
    #[must_use]
    pub fn model(&self) -> &M {
        self.model
    }

    /// Input shape dimensions.
    #[must_use]
    pub fn input_shapes(&self) -> &[usize] {
        &self.input_shapes
    }

    /// Compile precision.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Accelerator core count.
    #[must_use]
    pub fn num_cores(&self) -> u32 {
        self.num_cores
    }

    /// Compiler version string.
    #[must_use]
    pub fn compiler_version(&self) -> &str {
        &self.compiler_version
    }

    /// Whether the digests have been computed already.
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.hashes.get().is_some()
    }

    /// Compute (once) and return the model and overall hashes.
    ///
    /// A failed computation is not memoized; the next call retries.
    pub fn compute_hash(&self) -> Result<&ModelHashes> {
        if let Some(hashes) = self.hashes.get() {
            return Ok(hashes);
        }

        // Holds no data, so a poisoned lock is still usable
        let _guard = self.hashing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hashes) = self.hashes.get() {
            return Ok(hashes);
        }
        let computed = self.hash_uncached()?;
        Ok(self.hashes.get_or_init(|| computed))
    }

    /// The cache path of this fingerprint. Hashes on first use.
    pub fn cache_path(&self) -> Result<CachePath> {
        let hashes = self.compute_hash()?;
        Ok(CachePath {
            compiler_version: self.compiler_version.clone(),
            model_type: self.model.model_type().to_string(),
            model_hash: hashes.model_hash.clone(),
            overall_hash: hashes.overall_hash.clone(),
        })
    }

    fn hash_uncached(&self) -> Result<ModelHashes> {
        let scratch = self.scratch_dir.as_deref();
        let model_hash = hash_through_temp_file(scratch, |w| Ok(self.model.write_state(w)?))?;

        let record = FingerprintRecord {
            compiler_version: &self.compiler_version,
            input_shapes: &self.input_shapes,
            model_hash: &model_hash,
            model_type: self.model.model_type(),
            num_neuron_cores: self.num_cores,
            precision: self.precision,
        };
        let overall_hash =
            hash_through_temp_file(scratch, |w| Ok(serde_json::to_writer(w, &record)?))?;

        debug!(
            model_type = %self.model.model_type(),
            model_hash = %model_hash,
            overall_hash = %overall_hash,
            "Computed model fingerprint"
        );

        Ok(ModelHashes {
            model_hash,
            overall_hash,
        })
    }
}

impl<M: CompilableModel + ?Sized> fmt::Debug for ModelFingerprint<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelFingerprint")
            .field("model_type", &self.model.model_type())
            .field("input_shapes", &self.input_shapes)
            .field("precision", &self.precision)
            .field("num_cores", &self.num_cores)
            .field("compiler_version", &self.compiler_version)
            .field("hashes", &self.hashes.get())
            .finish()
    }
}

/// Serialize into a scoped temporary file and hash it. The temporary
/// directory is removed on every exit path.
fn hash_through_temp_file<F>(scratch_dir: Option<&Path>, write: F) -> Result<String>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let tmp = match scratch_dir {
        Some(dir) => tempfile::tempdir_in(dir)?,
        None => tempfile::tempdir()?,
    };
    let path = tmp.path().join(HASH_FILE_NAME);

    let mut writer = BufWriter::new(File::create(&path)?);
    write(&mut writer)?;
    writer.flush()?;
    drop(writer);

    Ok(hash_file(&path)?)
}

/// Hierarchical cache key:
/// `<compiler_version>/<model_type>/<model_hash>/<overall_hash>`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CachePath {
    /// Compiler version.
    pub compiler_version: String,
    /// Model architecture tag.
    pub model_type: String,
    /// Weights hash.
    pub model_hash: String,
    /// Overall fingerprint hash.
    pub overall_hash: String,
}

impl CachePath {
    /// Segments in order.
    #[must_use]
    pub fn segments(&self) -> [&str; 4] {
        [
            &self.compiler_version,
            &self.model_type,
            &self.model_hash,
            &self.overall_hash,
        ]
    }

    /// `/`-joined form used as a repository folder.
    #[must_use]
    pub fn as_posix(&self) -> String {
        self.segments().join("/")
    }

    /// Relative filesystem path used below a local cache root.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        self.segments().iter().collect()
    }

    /// Whether `file` (a repository path) sits directly in this folder.
    #[must_use]
    pub fn contains_file(&self, file: &str) -> bool {
        match file.trim_start_matches('/').rsplit_once('/') {
            Some((parent, _)) => parent == self.as_posix(),
            None => false,
        }
    }

    /// Path of `file` relative to this folder, if it lies anywhere below it.
    ///
    /// Returns `None` when the remainder has empty, `.` or `..` segments,
    /// so the result never resolves outside the folder.
    #[must_use]
    pub fn strip_from<'f>(&self, file: &'f str) -> Option<&'f str> {
        let prefix = self.as_posix();
        file.trim_start_matches('/')
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| {
                rest.split('/')
                    .all(|segment| !matches!(segment, "" | "." | ".."))
            })
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_posix())
    }
}
