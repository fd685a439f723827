//! Blockfile values.

use crate::segment::sparse::BlockMax;
use crate::segment::vector::{GraphHeader, GraphNode};
use crate::types::{DataRecord, MetadataValue};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// A value stored in a blockfile.
///
/// The set of value shapes is closed: every segment index maps onto one of
/// these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockValue {
    /// An unsigned integer (offset ids, arena indices).
    U32(u32),
    /// A float (sparse weights).
    F32(f32),
    /// A string (user ids).
    Str(String),
    /// A set of offset ids (typed metadata indices).
    IdSet(RoaringBitmap),
    /// Token positions within a document.
    Positions(Vec<u32>),
    /// A full record payload.
    Record(DataRecord),
    /// A dense vector.
    Vector(Vec<f32>),
    /// A vector graph node.
    Node(GraphNode),
    /// The vector graph header.
    GraphHeader(GraphHeader),
    /// A sparse block-max summary.
    BlockMax(BlockMax),
}

impl BlockValue {
    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        const TAG: usize = 2;
        TAG + match self {
            Self::U32(_) | Self::F32(_) => 5,
            Self::Str(s) => s.len() + 5,
            Self::IdSet(set) => set.serialized_size() + 5,
            Self::Positions(p) => p.len() * 5 + 5,
            Self::Record(record) => record_size(record),
            Self::Vector(v) => v.len() * 5 + 5,
            Self::Node(node) => node.neighbors.len() * 5 + node.vector.len() * 5 + 16,
            Self::GraphHeader(_) => 32,
            Self::BlockMax(_) => 32,
        }
    }

    /// Returns the `U32` value, if this is one.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the `F32` value, if this is one.
    #[must_use]
    pub const fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the variant name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::U32(_) => "u32",
            Self::F32(_) => "f32",
            Self::Str(_) => "str",
            Self::IdSet(_) => "id-set",
            Self::Positions(_) => "positions",
            Self::Record(_) => "record",
            Self::Vector(_) => "vector",
            Self::Node(_) => "node",
            Self::GraphHeader(_) => "graph-header",
            Self::BlockMax(_) => "block-max",
        }
    }
}

fn record_size(record: &DataRecord) -> usize {
    let mut size = record.id.len() + 8;
    if let Some(embedding) = &record.embedding {
        size += embedding.len() * 5 + 5;
    }
    if let Some(document) = &record.document {
        size += document.len() + 5;
    }
    if let Some(metadata) = &record.metadata {
        size += metadata.iter().map(|(k, v)| k.len() + 8 + value_len(v)).sum::<usize>();
    }
    if let Some(sparse) = &record.sparse {
        size += sparse.keys().map(|k| k.len() + 10).sum::<usize>();
    }
    size
}

fn value_len(value: &MetadataValue) -> usize {
    match value {
        MetadataValue::Str(s) => s.len(),
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_grows_with_content() {
        let small = BlockValue::Str("a".into());
        let large = BlockValue::Str("a".repeat(100));
        assert!(large.size() > small.size());

        let mut set = RoaringBitmap::new();
        let empty = BlockValue::IdSet(set.clone()).size();
        set.insert_range(0..1000);
        set.insert(1_000_000);
        assert!(BlockValue::IdSet(set).size() > empty);
    }

    #[test]
    fn accessors() {
        assert_eq!(BlockValue::U32(3).as_u32(), Some(3));
        assert_eq!(BlockValue::F32(0.5).as_f32(), Some(0.5));
        assert_eq!(BlockValue::U32(3).as_f32(), None);
        assert_eq!(BlockValue::Positions(vec![]).kind(), "positions");
    }
}
