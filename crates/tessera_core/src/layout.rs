//! Object key layout.
//!
//! ```text
//! collections/{collection}/segments/{kind}/{segment}/blocks/{block_id}
//! collections/{collection}/segments/{kind}/{segment}/manifests/{blockfile}/{version}
//! collections/{collection}/versions/{version}
//! ```

use crate::types::{CollectionId, SegmentId, SegmentKind};

/// Prefix under which every collection lives.
pub const COLLECTIONS_PREFIX: &str = "collections/";

/// Returns the prefix of all objects of one segment.
#[must_use]
pub fn segment_prefix(collection: CollectionId, kind: SegmentKind, segment: SegmentId) -> String {
    format!("{COLLECTIONS_PREFIX}{collection}/segments/{kind}/{segment}")
}

/// Returns the key of a block.
#[must_use]
pub fn block_key(segment_prefix: &str, block_id: &str) -> String {
    format!("{segment_prefix}/blocks/{block_id}")
}

/// Returns the prefix of all manifests of one blockfile.
#[must_use]
pub fn manifest_prefix(segment_prefix: &str, blockfile: &str) -> String {
    format!("{segment_prefix}/manifests/{blockfile}/")
}

/// Returns the key of one manifest version.
#[must_use]
pub fn manifest_key(segment_prefix: &str, blockfile: &str, version: u64) -> String {
    format!("{}{version}", manifest_prefix(segment_prefix, blockfile))
}

/// Returns the prefix of all published version tokens of a collection.
#[must_use]
pub fn versions_prefix(collection: CollectionId) -> String {
    format!("{COLLECTIONS_PREFIX}{collection}/versions/")
}

/// Returns the key of one published version token.
#[must_use]
pub fn version_key(collection: CollectionId, version: u64) -> String {
    format!("{}{version}", versions_prefix(collection))
}

/// Parses the trailing numeric component of a versioned key.
#[must_use]
pub fn parse_version_suffix(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.parse().ok()
}
