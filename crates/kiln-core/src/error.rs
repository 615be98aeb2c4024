//! Error types for kiln.

use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors that can occur in kiln operations.
#[derive(Error, Debug)]
pub enum KilnError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote transport error (listing, download or upload failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Key not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "hub")]
impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
