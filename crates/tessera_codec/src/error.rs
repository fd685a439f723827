//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The frame does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// The frame was written by a newer format version.
    #[error("unsupported format version: {version}")]
    UnsupportedVersion {
        /// Version found in the frame.
        version: u16,
    },

    /// The frame kind byte is not a known kind.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// Kind byte found in the frame.
        kind: u8,
    },

    /// The frame holds a different kind of object than requested.
    #[error("wrong frame kind: expected {expected}, found {actual}")]
    WrongKind {
        /// Requested kind.
        expected: &'static str,
        /// Kind found in the frame.
        actual: &'static str,
    },

    /// The frame is shorter than its header claims.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// The body checksum does not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Decoded content violates a structural invariant.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }
}
