//! Error types for object backend operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No object exists under the requested key.
    #[error("object not found: {key}")]
    NotFound {
        /// The requested key.
        key: String,
    },

    /// The backend could not be reached or timed out.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The key is not a valid object key for this backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),
}

impl StorageError {
    /// Creates a not-found error for `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Returns whether this error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
