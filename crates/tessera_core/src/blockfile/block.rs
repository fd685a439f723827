//! Immutable blocks.

use crate::blockfile::key::{BlockKey, KeyRange};
use crate::blockfile::value::BlockValue;
use serde::{Deserialize, Serialize};
use tessera_codec::{CodecError, CodecResult, FrameKind, Framed};

/// Per-prefix weight summary of a block.
///
/// Recorded for every prefix that has at least one `F32` value in the
/// block, so a reader can bound the contribution of a block without
/// scanning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixSummary {
    /// The prefix (a term, for sparse postings).
    pub prefix: String,
    /// Largest `F32` value under the prefix.
    pub max: f32,
    /// Smallest `F32` value under the prefix.
    pub min: f32,
}

/// An immutable, content-addressed run of sorted entries.
///
/// A block's bytes never change once written; its id is the digest of its
/// encoded body, so equal content always has an equal id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    entries: Vec<(BlockKey, BlockValue)>,
    summaries: Vec<PrefixSummary>,
}

impl Block {
    /// Builds a block from entries sorted by key with no duplicates.
    #[must_use]
    pub fn from_sorted(entries: Vec<(BlockKey, BlockValue)>) -> Self {
        let mut summaries: Vec<PrefixSummary> = Vec::new();
        for (key, value) in &entries {
            let BlockValue::F32(weight) = value else {
                continue;
            };
            match summaries.last_mut() {
                Some(last) if last.prefix == key.prefix => {
                    last.max = last.max.max(*weight);
                    last.min = last.min.min(*weight);
                }
                _ => summaries.push(PrefixSummary {
                    prefix: key.prefix.clone(),
                    max: *weight,
                    min: *weight,
                }),
            }
        }
        Self { entries, summaries }
    }

    /// Returns the entries in key order.
    #[must_use]
    pub fn entries(&self) -> &[(BlockKey, BlockValue)] {
        &self.entries
    }

    /// Consumes the block, returning its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<(BlockKey, BlockValue)> {
        self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the block holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest key.
    #[must_use]
    pub fn first_key(&self) -> Option<&BlockKey> {
        self.entries.first().map(|(k, _)| k)
    }

    /// Largest key.
    #[must_use]
    pub fn last_key(&self) -> Option<&BlockKey> {
        self.entries.last().map(|(k, _)| k)
    }

    /// Looks up a key by binary search.
    #[must_use]
    pub fn get(&self, key: &BlockKey) -> Option<&BlockValue> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Returns the index span of entries inside `range`.
    #[must_use]
    pub fn span(&self, range: &KeyRange) -> std::ops::Range<usize> {
        let start = self.entries.partition_point(|(k, _)| range.before_start(k));
        let end = self.entries.partition_point(|(k, _)| !range.after_end(k));
        start..end.max(start)
    }

    /// Returns the weight summary for `prefix`.
    #[must_use]
    pub fn summary(&self, prefix: &str) -> Option<&PrefixSummary> {
        self.summaries
            .binary_search_by(|s| s.prefix.as_str().cmp(prefix))
            .ok()
            .map(|i| &self.summaries[i])
    }

    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        entries_size(&self.entries) + self.summaries.iter().map(|s| s.prefix.len() + 12).sum::<usize>()
    }
}

/// Approximate encoded size of a run of entries.
#[must_use]
pub fn entries_size(entries: &[(BlockKey, BlockValue)]) -> usize {
    entries.iter().map(|(k, v)| entry_size(k, v)).sum()
}

/// Approximate encoded size of one entry.
#[must_use]
pub fn entry_size(key: &BlockKey, value: &BlockValue) -> usize {
    key.size() + value.size()
}

impl Framed for Block {
    const KIND: FrameKind = FrameKind::Block;

    fn validate(&self) -> CodecResult<()> {
        if self.entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(CodecError::invalid_structure("block entries not strictly sorted"));
        }
        if self.summaries.windows(2).any(|w| w[0].prefix >= w[1].prefix) {
            return Err(CodecError::invalid_structure("block summaries not sorted"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_codec::{decode_addressed, encode_addressed, Decode, Encode};

    fn sample() -> Block {
        Block::from_sorted(vec![
            (BlockKey::u32("alpha", 1), BlockValue::F32(0.5)),
            (BlockKey::u32("alpha", 4), BlockValue::F32(-0.25)),
            (BlockKey::u32("alpha", 9), BlockValue::F32(0.75)),
            (BlockKey::u32("beta", 2), BlockValue::F32(0.1)),
            (BlockKey::str("meta", "x"), BlockValue::Str("y".into())),
        ])
    }

    #[test]
    fn get_and_span() {
        let block = sample();
        assert_eq!(block.get(&BlockKey::u32("alpha", 4)), Some(&BlockValue::F32(-0.25)));
        assert_eq!(block.get(&BlockKey::u32("alpha", 5)), None);
        assert_eq!(block.span(&KeyRange::prefix("alpha")), 0..3);
        assert_eq!(block.span(&KeyRange::prefix("beta")), 3..4);
        assert_eq!(block.span(&KeyRange::prefix("gamma")), 4..4);
        assert_eq!(block.span(&KeyRange::all()), 0..5);
    }

    #[test]
    fn summaries_track_min_and_max() {
        let block = sample();
        let alpha = block.summary("alpha").unwrap();
        assert_eq!(alpha.max, 0.75);
        assert_eq!(alpha.min, -0.25);
        assert_eq!(block.summary("beta").unwrap().max, 0.1);
        assert!(block.summary("meta").is_none());
    }

    #[test]
    fn encode_decode_block() {
        let block = sample();
        let bytes = block.encode().unwrap();
        assert_eq!(Block::decode(&bytes).unwrap(), block);

        let (id, frame) = encode_addressed(&block).unwrap();
        assert_eq!(decode_addressed::<Block>(&frame, &id).unwrap(), block);
    }

    #[test]
    fn unsorted_block_is_rejected() {
        let block = Block {
            entries: vec![
                (BlockKey::u32("", 2), BlockValue::U32(0)),
                (BlockKey::u32("", 1), BlockValue::U32(0)),
            ],
            summaries: vec![],
        };
        let bytes = block.encode().unwrap();
        assert!(Block::decode(&bytes).is_err());
    }
}
