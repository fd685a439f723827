//! Versioned root manifests.

use crate::blockfile::key::{BlockKey, KeyRange};
use serde::{Deserialize, Serialize};
use tessera_codec::{is_sha256_hex, CodecError, CodecResult, FrameKind, Framed};

/// One manifest entry: the key range held by one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Smallest key in the block.
    pub start: BlockKey,
    /// Largest key in the block.
    pub end: BlockKey,
    /// Content id of the block.
    pub block_id: String,
    /// Approximate encoded size of the block.
    pub size: u64,
    /// Number of entries in the block.
    pub count: u32,
}

/// The root of one blockfile version.
///
/// Entries are ordered and their key ranges are disjoint, so a manifest is
/// fully resolvable on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the blockfile within its segment.
    pub blockfile: String,
    /// Monotonic version; 0 is the empty manifest and is never written.
    pub version: u64,
    /// Block entries in key order.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// The empty manifest of a new blockfile.
    pub fn empty(blockfile: impl Into<String>) -> Self {
        Self {
            blockfile: blockfile.into(),
            version: 0,
            entries: Vec::new(),
        }
    }

    /// Total number of entries across all blocks.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.count)).sum()
    }

    /// Total approximate size of all blocks.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Returns the index of the entry whose range contains `key`.
    #[must_use]
    pub fn find(&self, key: &BlockKey) -> Option<usize> {
        let i = self.entries.partition_point(|e| e.end < *key);
        (i < self.entries.len() && self.entries[i].start <= *key).then_some(i)
    }

    /// Returns the index of the entry a new `key` belongs to: the entry
    /// containing it, else the closest entry before it, else the first.
    #[must_use]
    pub fn owner(&self, key: &BlockKey) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let after = self.entries.partition_point(|e| e.start <= *key);
        Some(after.saturating_sub(1))
    }

    /// Returns the index span of entries overlapping `range`.
    #[must_use]
    pub fn overlapping(&self, range: &KeyRange) -> std::ops::Range<usize> {
        let start = self.entries.partition_point(|e| range.before_start(&e.end));
        let end = self.entries.partition_point(|e| !range.after_end(&e.start));
        start..end.max(start)
    }
}

impl Framed for Manifest {
    const KIND: FrameKind = FrameKind::Manifest;

    fn validate(&self) -> CodecResult<()> {
        if self.version == 0 && !self.entries.is_empty() {
            return Err(CodecError::invalid_structure("version 0 manifest with entries"));
        }
        for entry in &self.entries {
            if entry.start > entry.end {
                return Err(CodecError::invalid_structure(format!(
                    "inverted range in block {}",
                    entry.block_id
                )));
            }
            if entry.count == 0 {
                return Err(CodecError::invalid_structure(format!(
                    "empty block {}",
                    entry.block_id
                )));
            }
            if !is_sha256_hex(&entry.block_id) {
                return Err(CodecError::invalid_structure(format!(
                    "malformed block id {:?}",
                    entry.block_id
                )));
            }
        }
        if self.entries.windows(2).any(|w| w[0].end >= w[1].start) {
            return Err(CodecError::invalid_structure("manifest entries overlap or unsorted"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_codec::{sha256_hex, Decode, Encode};

    fn entry(start: u32, end: u32) -> ManifestEntry {
        ManifestEntry {
            start: BlockKey::u32("", start),
            end: BlockKey::u32("", end),
            block_id: sha256_hex(&start.to_le_bytes()),
            size: 10,
            count: end - start + 1,
        }
    }

    fn manifest() -> Manifest {
        Manifest {
            blockfile: "ids".into(),
            version: 3,
            entries: vec![entry(10, 19), entry(30, 39), entry(50, 59)],
        }
    }

    #[test]
    fn find_containing_entry() {
        let m = manifest();
        assert_eq!(m.find(&BlockKey::u32("", 10)), Some(0));
        assert_eq!(m.find(&BlockKey::u32("", 35)), Some(1));
        assert_eq!(m.find(&BlockKey::u32("", 59)), Some(2));
        assert_eq!(m.find(&BlockKey::u32("", 25)), None);
        assert_eq!(m.find(&BlockKey::u32("", 5)), None);
        assert_eq!(m.find(&BlockKey::u32("", 60)), None);
    }

    #[test]
    fn owner_prefers_predecessor() {
        let m = manifest();
        assert_eq!(m.owner(&BlockKey::u32("", 5)), Some(0));
        assert_eq!(m.owner(&BlockKey::u32("", 25)), Some(0));
        assert_eq!(m.owner(&BlockKey::u32("", 30)), Some(1));
        assert_eq!(m.owner(&BlockKey::u32("", 99)), Some(2));
        assert_eq!(Manifest::empty("x").owner(&BlockKey::u32("", 1)), None);
    }

    #[test]
    fn overlapping_span() {
        let m = manifest();
        let range = KeyRange::inclusive(BlockKey::u32("", 15), BlockKey::u32("", 30));
        assert_eq!(m.overlapping(&range), 0..2);
        let range = KeyRange::inclusive(BlockKey::u32("", 20), BlockKey::u32("", 29));
        assert!(m.overlapping(&range).is_empty());
        assert_eq!(m.overlapping(&KeyRange::all()), 0..3);
        assert_eq!(m.count(), 30);
    }

    #[test]
    fn roundtrip_and_validation() {
        let m = manifest();
        assert_eq!(Manifest::decode(&m.encode().unwrap()).unwrap(), m);

        let mut overlapping = manifest();
        overlapping.entries[1].start = BlockKey::u32("", 15);
        assert!(Manifest::decode(&overlapping.encode().unwrap()).is_err());

        let mut inverted = manifest();
        inverted.entries[0].end = BlockKey::u32("", 1);
        assert!(Manifest::decode(&inverted.encode().unwrap()).is_err());

        let mut zero = manifest();
        zero.version = 0;
        assert!(Manifest::decode(&zero.encode().unwrap()).is_err());
    }
}
