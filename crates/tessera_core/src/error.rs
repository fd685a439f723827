//! Error types for tessera core.

use tessera_codec::CodecError;
use tessera_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in tessera core operations.
///
/// A missing key is never an error: lookups return `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The object backend could not be reached or timed out.
    ///
    /// Callers retry with backoff; the store never retries internally.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// A block, manifest or version token failed structural validation.
    #[error("corrupt data: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// A second writer was attempted against a blockfile already open for write.
    #[error("writer conflict: blockfile {blockfile} already has an open writer")]
    WriterConflict {
        /// The contended blockfile.
        blockfile: String,
    },

    /// The operation was cancelled before any durable write.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The catalog has no published version for the collection.
    #[error("collection not found: {collection}")]
    CollectionNotFound {
        /// The collection id.
        collection: String,
    },
}

impl CoreError {
    /// Creates a backend unavailable error.
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates a writer conflict error.
    pub fn writer_conflict(blockfile: impl Into<String>) -> Self {
        Self::WriterConflict {
            blockfile: blockfile.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(collection: impl ToString) -> Self {
        Self::CollectionNotFound {
            collection: collection.to_string(),
        }
    }

    /// Returns whether retrying the whole operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::WriterConflict { .. } | Self::Cancelled
        )
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            // Objects are only read through a manifest or token that names
            // them, so a missing object means the referencing object lies.
            StorageError::NotFound { key } => Self::corrupt(format!("missing object {key}")),
            StorageError::InvalidKey(key) => Self::corrupt(format!("invalid object key {key}")),
            StorageError::Encryption(message) => Self::corrupt(message),
            other => Self::backend_unavailable(other.to_string()),
        }
    }
}

impl From<CodecError> for CoreError {
    fn from(err: CodecError) -> Self {
        Self::corrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_core_kinds() {
        assert!(matches!(
            CoreError::from(StorageError::not_found("a/b")),
            CoreError::Corrupt { .. }
        ));
        assert!(matches!(
            CoreError::from(StorageError::Unavailable("timeout".into())),
            CoreError::BackendUnavailable { .. }
        ));
        assert!(matches!(
            CoreError::from(StorageError::Io(std::io::Error::other("disk"))),
            CoreError::BackendUnavailable { .. }
        ));
    }

    #[test]
    fn codec_errors_are_corruption() {
        assert!(matches!(
            CoreError::from(CodecError::ChecksumMismatch),
            CoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::backend_unavailable("x").is_retryable());
        assert!(CoreError::writer_conflict("x").is_retryable());
        assert!(!CoreError::corrupt("x").is_retryable());
        assert!(!CoreError::invalid_argument("x").is_retryable());
    }
}
