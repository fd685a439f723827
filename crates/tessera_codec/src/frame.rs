//! Object framing.
//!
//! Every object tessera writes to a backend is wrapped in a frame:
//!
//! ```text
//! ┌───────────┬──────────────┬──────┬─────────────┬──────────┬────────────┐
//! │ magic (4) │ version (2)  │ kind │ body len (4)│ body     │ digest (8) │
//! └───────────┴──────────────┴──────┴─────────────┴──────────┴────────────┘
//! ```
//!
//! Integers are little-endian. The trailing digest is the first eight
//! bytes of the SHA-256 of the body.

use crate::digest::sha256;
use crate::error::{CodecError, CodecResult};

/// Magic bytes at the start of every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TSRA";

/// Current frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4 + 2 + 1 + 4;

/// Size of the trailing body digest.
pub const CHECKSUM_LEN: usize = 8;

/// Kind of object carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// An immutable block of sorted entries.
    Block,
    /// A blockfile root manifest.
    Manifest,
    /// A published collection version token.
    CollectionVersion,
}

impl FrameKind {
    /// Returns the on-disk tag byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Block => 1,
            Self::Manifest => 2,
            Self::CollectionVersion => 3,
        }
    }

    /// Parses a tag byte.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKind` for unrecognized bytes.
    pub const fn from_byte(byte: u8) -> CodecResult<Self> {
        match byte {
            1 => Ok(Self::Block),
            2 => Ok(Self::Manifest),
            3 => Ok(Self::CollectionVersion),
            kind => Err(CodecError::UnknownKind { kind }),
        }
    }

    /// Returns a human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Manifest => "manifest",
            Self::CollectionVersion => "collection-version",
        }
    }
}

/// Wraps `body` in a frame of the given kind.
///
/// # Errors
///
/// Returns an error if the body exceeds `u32::MAX` bytes.
pub fn encode_frame(kind: FrameKind, body: &[u8]) -> CodecResult<Vec<u8>> {
    let len = u32::try_from(body.len())
        .map_err(|_| CodecError::encoding_failed("frame body too large"))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.push(kind.as_byte());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&sha256(body)[..CHECKSUM_LEN]);
    Ok(buf)
}

/// Reads the kind of a frame without validating its body.
///
/// # Errors
///
/// Returns an error if the header is missing or malformed.
pub fn peek_kind(data: &[u8]) -> CodecResult<FrameKind> {
    let (kind, _) = parse_header(data)?;
    Ok(kind)
}

/// Validates a frame of kind `expected` and returns its body.
///
/// # Errors
///
/// Returns an error on bad magic, unsupported version, unknown or
/// unexpected kind, truncation, trailing bytes, or a checksum mismatch.
pub fn decode_frame(expected: FrameKind, data: &[u8]) -> CodecResult<&[u8]> {
    let (kind, len) = parse_header(data)?;
    if kind != expected {
        return Err(CodecError::WrongKind {
            expected: expected.name(),
            actual: kind.name(),
        });
    }

    let needed = HEADER_LEN + len + CHECKSUM_LEN;
    if data.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: data.len(),
        });
    }
    if data.len() > needed {
        return Err(CodecError::invalid_structure(format!(
            "{} trailing bytes after frame",
            data.len() - needed
        )));
    }

    let body = &data[HEADER_LEN..HEADER_LEN + len];
    let checksum = &data[HEADER_LEN + len..needed];
    if sha256(body)[..CHECKSUM_LEN] != *checksum {
        return Err(CodecError::ChecksumMismatch);
    }
    Ok(body)
}

fn parse_header(data: &[u8]) -> CodecResult<(FrameKind, usize)> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    if data[0..4] != FRAME_MAGIC {
        return Err(CodecError::InvalidMagic);
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version == 0 || version > FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }
    let kind = FrameKind::from_byte(data[6])?;
    let len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;
    Ok((kind, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(FrameKind::Manifest, b"body").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 4 + CHECKSUM_LEN);
        assert_eq!(peek_kind(&frame).unwrap(), FrameKind::Manifest);
        assert_eq!(decode_frame(FrameKind::Manifest, &frame).unwrap(), b"body");
    }

    #[test]
    fn empty_body_is_valid() {
        let frame = encode_frame(FrameKind::Block, b"").unwrap();
        assert!(decode_frame(FrameKind::Block, &frame).unwrap().is_empty());
    }

    #[test]
    fn bad_magic() {
        let mut frame = encode_frame(FrameKind::Block, b"x").unwrap();
        frame[0] = b'X';
        assert_eq!(
            decode_frame(FrameKind::Block, &frame),
            Err(CodecError::InvalidMagic)
        );
    }

    #[test]
    fn newer_version_rejected() {
        let mut frame = encode_frame(FrameKind::Block, b"x").unwrap();
        frame[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode_frame(FrameKind::Block, &frame),
            Err(CodecError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn wrong_kind() {
        let frame = encode_frame(FrameKind::Block, b"x").unwrap();
        assert_eq!(
            decode_frame(FrameKind::Manifest, &frame),
            Err(CodecError::WrongKind {
                expected: "manifest",
                actual: "block"
            })
        );
    }

    #[test]
    fn unknown_kind() {
        let mut frame = encode_frame(FrameKind::Block, b"x").unwrap();
        frame[6] = 99;
        assert_eq!(
            decode_frame(FrameKind::Block, &frame),
            Err(CodecError::UnknownKind { kind: 99 })
        );
    }

    #[test]
    fn truncated_and_trailing() {
        let frame = encode_frame(FrameKind::Block, b"hello").unwrap();
        assert!(matches!(
            decode_frame(FrameKind::Block, &frame[..frame.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            decode_frame(FrameKind::Block, &frame[..3]),
            Err(CodecError::Truncated { .. })
        ));

        let mut longer = frame.clone();
        longer.push(0);
        assert!(matches!(
            decode_frame(FrameKind::Block, &longer),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut frame = encode_frame(FrameKind::Block, b"hello").unwrap();
        frame[HEADER_LEN] ^= 0x01;
        assert_eq!(
            decode_frame(FrameKind::Block, &frame),
            Err(CodecError::ChecksumMismatch)
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_frame(FrameKind::Block, &data);
        }

        #[test]
        fn single_bit_flip_is_detected(
            body in proptest::collection::vec(any::<u8>(), 1..64),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut frame = encode_frame(FrameKind::Block, &body).unwrap();
            let i = index.index(frame.len());
            frame[i] ^= 1 << bit;
            prop_assert!(decode_frame(FrameKind::Block, &frame).is_err());
        }
    }
}
