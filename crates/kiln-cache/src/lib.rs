//! # kiln-cache
//!
//! Content-addressed compilation cache for accelerator-compiled models.
//!
//! Compiling a model for the accelerator is slow, so compiled artifacts are
//! shared through hosted repositories and keyed by everything that changes
//! the compiler output.
//!
//! ## Features
//!
//! - **Model Fingerprints**: SHA-256 over canonical weights and compile settings
//! - **Hierarchical Cache Keys**: `compiler_version/model_type/model_hash/overall_hash`
//! - **Remote Lookup**: find, download and publish entries on a model hub
//! - **Flag Compatibility**: read and rewrite the compiler flags string
//!
//! ## Quick Start
//!
//! ```no_run
//! use kiln_cache::{FingerprintBuilder, HubCache, HubCacheConfig, PretrainedModel, RuntimeDefaults};
//! use kiln_core::{Precision, StateDict};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = HubCache::from_config(HubCacheConfig::from_env()?);
//! let model = PretrainedModel::new("bert", StateDict::new());
//!
//! let fingerprint = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
//!     .num_cores(2)
//!     .build(&RuntimeDefaults::from_env())?;
//! println!("cache path: {}", fingerprint.cache_path()?);
//!
//! if !cache.download(&fingerprint, None, false).await? {
//!     // Cache miss: compile, then share the result
//!     cache.upload(&fingerprint, "compiled/".as_ref(), None, false).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     CACHE ARCHITECTURE                          │
//! │                                                                 │
//! │  ┌──────────────┐     ┌─────────────┐      ┌──────────────────┐ │
//! │  │ Model +      │────▶│ Fingerprint │─────▶│   Cache Path     │ │
//! │  │ Compile cfg  │     │  (SHA-256)  │      │ ver/type/mh/oh   │ │
//! │  └──────────────┘     └─────────────┘      └────────┬─────────┘ │
//! │                                                     │           │
//! │  ┌──────────────┐     ┌─────────────┐               ▼           │
//! │  │ Local cache  │◀────│  HubCache   │◀────▶  Hosted repos       │
//! │  │    root      │     │ find/dl/up  │       (scanned in order)  │
//! │  └──────────────┘     └─────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Compiler flags, cache root resolution, hub configuration
//! - [`keys`]: Model fingerprints and cache paths
//! - [`remote`]: Remote lookup and sync
//! - [`shapes`]: Static input shapes for export
//! - [`staging`]: Named scratch directories

pub mod config;
pub mod keys;
pub mod remote;
pub mod shapes;
pub mod staging;

// Re-export commonly used types
pub use config::{
    get_local_cache_root, CacheRepo, CacheRoot, CompilerFlags, ConfigError, HubCacheConfig,
    RuntimeDefaults,
};
pub use keys::{
    CachePath, CompilableModel, FingerprintBuilder, FingerprintError, ModelFingerprint,
    ModelHashes, PretrainedModel, HASH_FILE_NAME,
};
pub use remote::{CachedArtifact, HubCache, RemoteCacheError};
pub use shapes::{
    build_diffusion_mandatory_shapes, default_component_precisions, infer_diffusion_shapes,
    input_shapes_for, DiffusionComponent, DiffusionPipelineConfig, DiffusionShapeArgs,
    DiffusionShapes, ModelFamily, ShapeError,
};
pub use staging::StaticTempDir;
