//! # kiln-core
//!
//! Core infrastructure for kiln.
//!
//! Provides shared abstractions for:
//! - Artifact repositories (local mirror, hosted hub)
//! - Hashing (SHA-256, streamed file digests)
//! - Common types (Precision, Tensor, StateDict)

pub mod error;
pub mod hashing;
pub mod storage;
pub mod types;

pub use error::{KilnError, Result};
pub use hashing::{hash_file, hash_reader};
#[cfg(feature = "hub")]
pub use storage::HubRepository;
pub use storage::{ArtifactRepository, LocalRepository, DEFAULT_HUB_ENDPOINT, DEFAULT_REVISION};
pub use types::{Precision, StateDict, Tensor};
