//! Record segment: id mappings and raw record payloads.
//!
//! | blockfile        | key              | value        |
//! |------------------|------------------|--------------|
//! | `user_id_to_id`  | `("", Str(id))`  | `U32(offset)`|
//! | `id_to_user_id`  | `("", U32(off))` | `Str(id)`    |
//! | `id_to_data`     | `("", U32(off))` | `Record`     |

use crate::blockfile::{BlockKey, BlockValue, BlockfileProvider, KeyRange};
use crate::cancel::CancellationToken;
use crate::error::{CoreError, CoreResult};
use crate::segment::{Ops, PreparedSegment, SegmentFile, SegmentVersion};
use crate::types::{CollectionId, DataRecord, MaterializedRecord, OffsetId};
use roaring::RoaringBitmap;

/// User id to offset id.
pub const USER_ID_TO_ID: &str = "user_id_to_id";
/// Offset id to user id.
pub const ID_TO_USER_ID: &str = "id_to_user_id";
/// Offset id to record payload.
pub const ID_TO_DATA: &str = "id_to_data";

/// Owns offset id allocation and the record payloads of a collection.
#[derive(Debug, Clone)]
pub struct RecordSegment {
    provider: BlockfileProvider,
    descriptor: SegmentVersion,
    user_ids: SegmentFile,
    offsets: SegmentFile,
    data: SegmentFile,
    next_offset_id: OffsetId,
    user_id_ops: Ops,
    offset_ops: Ops,
    data_ops: Ops,
}

fn user_key(user_id: &str) -> BlockKey {
    BlockKey::str("", user_id)
}

fn offset_key(offset_id: OffsetId) -> BlockKey {
    BlockKey::u32("", offset_id)
}

impl RecordSegment {
    /// Opens the segment at its committed descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if a manifest cannot be loaded.
    pub fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: SegmentVersion,
    ) -> CoreResult<Self> {
        let user_ids = SegmentFile::open(provider, collection, &descriptor, USER_ID_TO_ID)?;
        let offsets = SegmentFile::open(provider, collection, &descriptor, ID_TO_USER_ID)?;
        let data = SegmentFile::open(provider, collection, &descriptor, ID_TO_DATA)?;
        Ok(Self {
            provider: provider.clone(),
            next_offset_id: descriptor.next_offset_id.unwrap_or(0),
            descriptor,
            user_ids,
            offsets,
            data,
            user_id_ops: Ops::new(),
            offset_ops: Ops::new(),
            data_ops: Ops::new(),
        })
    }

    /// The committed descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SegmentVersion {
        &self.descriptor
    }

    /// Offset id of a user id.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn get_offset_id(&self, user_id: &str) -> CoreResult<Option<OffsetId>> {
        match self.user_ids.reader().get(&user_key(user_id))? {
            None => Ok(None),
            Some(BlockValue::U32(offset)) => Ok(Some(offset)),
            Some(other) => Err(unexpected(USER_ID_TO_ID, &other)),
        }
    }

    /// User id of an offset id.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn get_user_id(&self, offset_id: OffsetId) -> CoreResult<Option<String>> {
        match self.offsets.reader().get(&offset_key(offset_id))? {
            None => Ok(None),
            Some(BlockValue::Str(user_id)) => Ok(Some(user_id)),
            Some(other) => Err(unexpected(ID_TO_USER_ID, &other)),
        }
    }

    /// Record payload of an offset id.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn get_data(&self, offset_id: OffsetId) -> CoreResult<Option<DataRecord>> {
        match self.data.reader().get(&offset_key(offset_id))? {
            None => Ok(None),
            Some(BlockValue::Record(record)) => Ok(Some(record)),
            Some(other) => Err(unexpected(ID_TO_DATA, &other)),
        }
    }

    /// Record payload and offset id of a user id.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn get_by_user_id(&self, user_id: &str) -> CoreResult<Option<(OffsetId, DataRecord)>> {
        let Some(offset_id) = self.get_offset_id(user_id)? else {
            return Ok(None);
        };
        let record = self.get_data(offset_id)?.ok_or_else(|| {
            CoreError::corrupt(format!("user id {user_id:?} maps to missing record {offset_id}"))
        })?;
        Ok(Some((offset_id, record)))
    }

    /// Every live offset id.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn all_offset_ids(&self) -> CoreResult<RoaringBitmap> {
        let mut ids = RoaringBitmap::new();
        for entry in self.offsets.reader().scan(KeyRange::all()) {
            let (key, _) = entry?;
            let offset = key
                .key
                .as_u32()
                .ok_or_else(|| CoreError::corrupt(format!("non-numeric key {key} in {ID_TO_USER_ID}")))?;
            ids.insert(offset);
        }
        Ok(ids)
    }

    /// Number of live records.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.data.reader().count()
    }

    /// Records in offset order, skipping `offset` and returning at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn scan_records(&self, limit: Option<usize>, offset: usize) -> CoreResult<Vec<(OffsetId, DataRecord)>> {
        self.data
            .reader()
            .scan(KeyRange::all())
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|entry| match entry? {
                (key, BlockValue::Record(record)) => key
                    .key
                    .as_u32()
                    .map(|id| (id, record))
                    .ok_or_else(|| CoreError::corrupt(format!("non-numeric key {key} in {ID_TO_DATA}"))),
                (_, other) => Err(unexpected(ID_TO_DATA, &other)),
            })
            .collect()
    }

    /// Offset id of a user id, including buffered changes.
    pub(crate) fn working_offset_id(&self, user_id: &str) -> CoreResult<Option<OffsetId>> {
        match self.user_id_ops.get(&user_key(user_id)) {
            Some(Some(BlockValue::U32(offset))) => Ok(Some(*offset)),
            Some(_) => Ok(None),
            None => self.get_offset_id(user_id),
        }
    }

    /// Record payload of an offset id, including buffered changes.
    pub(crate) fn working_data(&self, offset_id: OffsetId) -> CoreResult<Option<DataRecord>> {
        match self.data_ops.get(&offset_key(offset_id)) {
            Some(Some(BlockValue::Record(record))) => Ok(Some(record.clone())),
            Some(_) => Ok(None),
            None => self.get_data(offset_id),
        }
    }

    /// Allocates a fresh offset id. Ids handed to a buffered record are
    /// never reused, even if the record is deleted before a flush.
    pub(crate) fn allocate_offset_id(&mut self) -> CoreResult<OffsetId> {
        let id = self.next_offset_id;
        self.next_offset_id = id
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_argument("offset id space exhausted"))?;
        Ok(id)
    }

    /// Buffers one materialized record.
    pub fn apply(&mut self, record: &MaterializedRecord) {
        let offset = offset_key(record.offset_id);
        match (&record.old, &record.new) {
            (_, Some(new)) => {
                if record.old.is_none() {
                    self.user_id_ops
                        .insert(user_key(&new.id), Some(BlockValue::U32(record.offset_id)));
                    self.offset_ops
                        .insert(offset.clone(), Some(BlockValue::Str(new.id.clone())));
                }
                self.data_ops.insert(offset, Some(BlockValue::Record(new.clone())));
            }
            (Some(old), None) => {
                self.user_id_ops.insert(user_key(&old.id), None);
                self.offset_ops.insert(offset.clone(), None);
                self.data_ops.insert(offset, None);
            }
            (None, None) => {}
        }
    }

    /// Returns whether anything is buffered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.user_id_ops.is_empty()
            || !self.offset_ops.is_empty()
            || !self.data_ops.is_empty()
            || Some(self.next_offset_id) != self.descriptor.next_offset_id
    }

    /// Durably writes every buffered change without making it visible.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure; the buffer is left intact.
    pub fn prepare_commit(&self, cancel: &CancellationToken) -> CoreResult<PreparedSegment> {
        let mut prepared = PreparedSegment {
            descriptor: self.descriptor.clone(),
            manifests: Default::default(),
        };
        prepared.descriptor.next_offset_id = Some(self.next_offset_id);
        self.user_ids
            .commit(&self.provider, self.user_id_ops.clone(), cancel, &mut prepared)?;
        self.offsets
            .commit(&self.provider, self.offset_ops.clone(), cancel, &mut prepared)?;
        self.data
            .commit(&self.provider, self.data_ops.clone(), cancel, &mut prepared)?;
        Ok(prepared)
    }

    /// Makes prepared state current and clears the buffer.
    pub fn install(&mut self, prepared: PreparedSegment) {
        self.user_ids.install(&self.provider, &prepared);
        self.offsets.install(&self.provider, &prepared);
        self.data.install(&self.provider, &prepared);
        self.descriptor = prepared.descriptor;
        self.user_id_ops.clear();
        self.offset_ops.clear();
        self.data_ops.clear();
    }
}

fn unexpected(blockfile: &str, value: &BlockValue) -> CoreError {
    CoreError::corrupt(format!("unexpected {} value in {blockfile}", value.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::config::{BlockfileConfig, CacheConfig};
    use crate::types::SegmentKind;
    use std::sync::Arc;
    use tessera_storage::InMemoryBackend;

    fn segment() -> RecordSegment {
        let provider = BlockfileProvider::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(BlockCache::new(CacheConfig::default())),
            BlockfileConfig::default(),
        );
        RecordSegment::open(&provider, CollectionId::new(), SegmentVersion::new(SegmentKind::Record)).unwrap()
    }

    fn flush(segment: &mut RecordSegment) {
        let prepared = segment.prepare_commit(&CancellationToken::new()).unwrap();
        segment.install(prepared);
    }

    fn add(segment: &mut RecordSegment, user_id: &str) -> OffsetId {
        let offset_id = segment.allocate_offset_id().unwrap();
        let mut record = DataRecord::new(user_id);
        record.document = Some(format!("doc {user_id}"));
        segment.apply(&MaterializedRecord {
            offset_id,
            old: None,
            new: Some(record),
        });
        offset_id
    }

    #[test]
    fn reads_see_flushed_state_only() {
        let mut segment = segment();
        let a = add(&mut segment, "a");
        assert_eq!(segment.get_offset_id("a").unwrap(), None);
        assert_eq!(segment.working_offset_id("a").unwrap(), Some(a));
        assert!(segment.has_pending());

        flush(&mut segment);
        assert!(!segment.has_pending());
        assert_eq!(segment.get_offset_id("a").unwrap(), Some(a));
        assert_eq!(segment.get_user_id(a).unwrap().as_deref(), Some("a"));
        let (offset, record) = segment.get_by_user_id("a").unwrap().unwrap();
        assert_eq!(offset, a);
        assert_eq!(record.document.as_deref(), Some("doc a"));
        assert_eq!(segment.descriptor().next_offset_id, Some(1));
    }

    #[test]
    fn update_and_delete() {
        let mut segment = segment();
        let a = add(&mut segment, "a");
        let b = add(&mut segment, "b");
        flush(&mut segment);

        let old = segment.get_data(a).unwrap();
        let mut new = DataRecord::new("a");
        new.document = Some("changed".into());
        segment.apply(&MaterializedRecord {
            offset_id: a,
            old,
            new: Some(new),
        });
        let old_b = segment.get_data(b).unwrap();
        segment.apply(&MaterializedRecord {
            offset_id: b,
            old: old_b,
            new: None,
        });
        assert_eq!(segment.working_offset_id("b").unwrap(), None);
        assert_eq!(segment.working_data(a).unwrap().unwrap().document.as_deref(), Some("changed"));
        flush(&mut segment);

        assert_eq!(segment.get_data(a).unwrap().unwrap().document.as_deref(), Some("changed"));
        assert_eq!(segment.get_offset_id("b").unwrap(), None);
        assert_eq!(segment.get_user_id(b).unwrap(), None);
        assert_eq!(segment.count(), 1);
        assert_eq!(segment.all_offset_ids().unwrap().iter().collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn offsets_are_never_reused() {
        let mut segment = segment();
        let a = add(&mut segment, "a");
        let old = segment.working_data(a).unwrap();
        segment.apply(&MaterializedRecord {
            offset_id: a,
            old,
            new: None,
        });
        let again = add(&mut segment, "a");
        assert_ne!(a, again);
        flush(&mut segment);
        assert_eq!(segment.get_offset_id("a").unwrap(), Some(again));
        assert_eq!(segment.get_data(a).unwrap(), None);
    }

    #[test]
    fn scan_with_limit_and_offset() {
        let mut segment = segment();
        for id in ["a", "b", "c", "d"] {
            add(&mut segment, id);
        }
        flush(&mut segment);
        let page: Vec<_> = segment
            .scan_records(Some(2), 1)
            .unwrap()
            .into_iter()
            .map(|(_, r)| r.id)
            .collect();
        assert_eq!(page, vec!["b", "c"]);
        assert_eq!(segment.scan_records(None, 3).unwrap().len(), 1);
    }

    #[test]
    fn failed_prepare_keeps_buffer() {
        let mut segment = segment();
        add(&mut segment, "a");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(segment.prepare_commit(&cancel).unwrap_err(), CoreError::Cancelled);
        assert!(segment.has_pending());
        flush(&mut segment);
        assert_eq!(segment.count(), 1);
    }
}
