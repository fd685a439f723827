//! Segments: typed groups of blockfiles implementing one logical index.
//!
//! A collection has exactly one segment of each kind. Segments buffer
//! materialized records in memory; a flush commits every blockfile of a
//! segment (`prepare_commit`) and only then, once the new collection
//! version is published, makes the new manifests current (`install`).
//!
//! Reads see flushed state only.

pub mod filter;
mod fts;
pub mod metadata;
pub mod record;
pub mod sparse;
pub mod vector;

pub use fts::NgramTokenizer;
pub use metadata::MetadataSegment;
pub use record::RecordSegment;
pub use vector::VectorSegment;

use crate::blockfile::{BlockKey, BlockValue, BlockfileId, BlockfileProvider, Manifest, Reader};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::CoreResult;
use crate::types::{CollectionId, MaterializedRecord, OffsetId, SegmentId, SegmentKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Buffered blockfile operations; `None` deletes.
pub(crate) type Ops = BTreeMap<BlockKey, Option<BlockValue>>;

/// The committed state of one segment, as recorded in a collection version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentVersion {
    /// Segment id.
    pub id: SegmentId,
    /// Segment kind.
    pub kind: SegmentKind,
    /// Current manifest version of each blockfile. Absent means empty.
    pub blockfiles: BTreeMap<String, u64>,
    /// Next unallocated offset id (record segment only).
    pub next_offset_id: Option<OffsetId>,
}

impl SegmentVersion {
    /// A fresh, empty segment.
    #[must_use]
    pub fn new(kind: SegmentKind) -> Self {
        Self {
            id: SegmentId::new(),
            kind,
            blockfiles: BTreeMap::new(),
            next_offset_id: (kind == SegmentKind::Record).then_some(0),
        }
    }

    /// Manifest version of `blockfile`.
    #[must_use]
    pub fn version_of(&self, blockfile: &str) -> u64 {
        self.blockfiles.get(blockfile).copied().unwrap_or(0)
    }
}

/// Durably written, not yet visible segment state.
#[derive(Debug, Clone)]
pub struct PreparedSegment {
    /// The descriptor to publish.
    pub descriptor: SegmentVersion,
    /// The new manifests, by blockfile name.
    pub manifests: BTreeMap<String, Arc<Manifest>>,
}

/// One blockfile of a segment and its pinned reader.
#[derive(Debug, Clone)]
pub(crate) struct SegmentFile {
    reader: Reader,
}

impl SegmentFile {
    pub(crate) fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: &SegmentVersion,
        name: &str,
    ) -> CoreResult<Self> {
        let id = BlockfileId::new(collection, descriptor.kind, descriptor.id, name);
        let reader = provider.reader(&id, descriptor.version_of(name))?;
        Ok(Self { reader })
    }

    pub(crate) fn reader(&self) -> &Reader {
        &self.reader
    }

    pub(crate) fn name(&self) -> &str {
        &self.reader.id().name
    }

    /// Commits `ops` on top of the pinned version, returning the new
    /// manifest. Nothing is written when `ops` is empty.
    pub(crate) fn commit(
        &self,
        provider: &BlockfileProvider,
        ops: Ops,
        cancel: &CancellationToken,
        prepared: &mut PreparedSegment,
    ) -> CoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut writer = provider.writer(self.reader.id(), self.reader.version())?;
        for (key, op) in ops {
            match op {
                Some(value) => writer.set(key, value),
                None => writer.delete(key),
            }
        }
        let manifest = writer.commit(cancel)?;
        prepared
            .descriptor
            .blockfiles
            .insert(self.name().to_string(), manifest.version);
        prepared
            .manifests
            .insert(self.name().to_string(), Arc::new(manifest));
        Ok(())
    }

    /// Switches to the new manifest, if one was prepared for this file.
    pub(crate) fn install(&mut self, provider: &BlockfileProvider, prepared: &PreparedSegment) {
        if let Some(manifest) = prepared.manifests.get(self.name()) {
            self.reader = Reader::new(provider.clone(), self.reader.id().clone(), Arc::clone(manifest));
        }
    }
}

/// The segment set of a collection, dispatched by kind.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Id mappings and raw records.
    Record(RecordSegment),
    /// Metadata, full-text and sparse indices.
    Metadata(MetadataSegment),
    /// Dense vectors.
    Vector(VectorSegment),
}

impl Segment {
    /// Opens a segment from its committed descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if a manifest cannot be loaded.
    pub fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: SegmentVersion,
        config: &Config,
    ) -> CoreResult<Self> {
        Ok(match descriptor.kind {
            SegmentKind::Record => Self::Record(RecordSegment::open(provider, collection, descriptor)?),
            SegmentKind::Metadata => Self::Metadata(MetadataSegment::open(
                provider,
                collection,
                descriptor,
                config.full_text.clone(),
                config.sparse.clone(),
            )?),
            SegmentKind::Vector => {
                Self::Vector(VectorSegment::open(provider, collection, descriptor, config.vector.clone())?)
            }
        })
    }

    /// Segment kind.
    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        self.descriptor().kind
    }

    /// The committed descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SegmentVersion {
        match self {
            Self::Record(s) => s.descriptor(),
            Self::Metadata(s) => s.descriptor(),
            Self::Vector(s) => s.descriptor(),
        }
    }

    /// Buffers one materialized record.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if committed state needed
    /// to apply the record cannot be read.
    pub fn apply(&mut self, record: &MaterializedRecord) -> CoreResult<()> {
        match self {
            Self::Record(s) => {
                s.apply(record);
                Ok(())
            }
            Self::Metadata(s) => {
                s.apply(record);
                Ok(())
            }
            Self::Vector(s) => s.apply(record),
        }
    }

    /// Returns whether anything is buffered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        match self {
            Self::Record(s) => s.has_pending(),
            Self::Metadata(s) => s.has_pending(),
            Self::Vector(s) => s.has_pending(),
        }
    }

    /// Durably writes every buffered change without making it visible.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure; the buffer is left intact.
    pub fn prepare_commit(&self, cancel: &CancellationToken) -> CoreResult<PreparedSegment> {
        match self {
            Self::Record(s) => s.prepare_commit(cancel),
            Self::Metadata(s) => s.prepare_commit(cancel),
            Self::Vector(s) => s.prepare_commit(cancel),
        }
    }

    /// Makes prepared state current and clears the buffer.
    pub fn install(&mut self, prepared: PreparedSegment) {
        match self {
            Self::Record(s) => s.install(prepared),
            Self::Metadata(s) => s.install(prepared),
            Self::Vector(s) => s.install(prepared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_descriptors() {
        let record = SegmentVersion::new(SegmentKind::Record);
        assert_eq!(record.next_offset_id, Some(0));
        assert_eq!(record.version_of("id_to_data"), 0);
        assert_eq!(SegmentVersion::new(SegmentKind::Vector).next_offset_id, None);
    }
}
