//! # tessera codec
//!
//! Wire format for every object tessera writes to an object backend.
//!
//! Objects are serde models encoded as CBOR (self-describing, so a block or
//! manifest can be decoded without an external schema) and wrapped in a
//! checksummed [frame](frame). Content-addressed objects are identified by
//! the hex SHA-256 of their CBOR body.
//!
//! ## Usage
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tessera_codec::{Decode, Encode, FrameKind, Framed};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Token {
//!     version: u64,
//! }
//!
//! impl Framed for Token {
//!     const KIND: FrameKind = FrameKind::CollectionVersion;
//! }
//!
//! let bytes = Token { version: 3 }.encode().unwrap();
//! assert_eq!(Token::decode(&bytes).unwrap(), Token { version: 3 });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod digest;
mod error;
pub mod frame;

pub use cbor::{from_cbor, to_cbor};
pub use digest::{is_sha256_hex, sha256, sha256_hex, to_hex};
pub use error::{CodecError, CodecResult};
pub use frame::{decode_frame, encode_frame, peek_kind, FrameKind};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A serde model stored as a framed object of a fixed kind.
pub trait Framed: Serialize + DeserializeOwned {
    /// Frame kind used for this model.
    const KIND: FrameKind;

    /// Checks structural invariants after decoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStructure` when an invariant is violated.
    fn validate(&self) -> CodecResult<()> {
        Ok(())
    }
}

/// Trait for types that can be encoded to a framed object.
pub trait Encode {
    /// Encode this value to framed bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from a framed object.
pub trait Decode: Sized {
    /// Decode and validate this value from framed bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: Framed> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_frame(T::KIND, &to_cbor(self)?)
    }
}

impl<T: Framed> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value: T = from_cbor(decode_frame(T::KIND, bytes)?)?;
        value.validate()?;
        Ok(value)
    }
}

/// Encodes a content-addressed object.
///
/// Returns the content id (hex SHA-256 of the body) and the framed bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn encode_addressed<T: Framed>(value: &T) -> CodecResult<(String, Vec<u8>)> {
    let body = to_cbor(value)?;
    let id = sha256_hex(&body);
    Ok((id, encode_frame(T::KIND, &body)?))
}

/// Decodes a content-addressed object and checks it against `expected_id`.
///
/// # Errors
///
/// Returns `ChecksumMismatch` if the body does not hash to `expected_id`,
/// or any frame/decoding/validation error.
pub fn decode_addressed<T: Framed>(bytes: &[u8], expected_id: &str) -> CodecResult<T> {
    let body = decode_frame(T::KIND, bytes)?;
    if sha256_hex(body) != expected_id {
        return Err(CodecError::ChecksumMismatch);
    }
    let value: T = from_cbor(body)?;
    value.validate()?;
    Ok(value)
}
