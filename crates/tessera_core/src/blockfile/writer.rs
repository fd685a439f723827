//! Copy-on-write blockfile writer.

use crate::blockfile::block::{entries_size, entry_size, Block};
use crate::blockfile::key::BlockKey;
use crate::blockfile::manifest::{Manifest, ManifestEntry};
use crate::blockfile::provider::{BlockfileId, BlockfileProvider, WriterLease};
use crate::blockfile::value::BlockValue;
use crate::cancel::CancellationToken;
use crate::error::CoreResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_codec::{encode_addressed, Encode};

type Entries = Vec<(BlockKey, BlockValue)>;

/// A block of the new version, before it is written.
enum Piece {
    /// An untouched block, referenced again by id.
    Kept(ManifestEntry),
    /// A block to write.
    Fresh(Entries),
}

impl Piece {
    fn size(&self) -> usize {
        match self {
            Self::Kept(entry) => entry.size as usize,
            Self::Fresh(entries) => entries_size(entries),
        }
    }

    fn is_undersized(&self, min: usize) -> bool {
        matches!(self, Self::Fresh(entries) if entries_size(entries) < min)
    }
}

/// Buffers inserts and deletes against one base manifest.
///
/// Holding a writer holds the blockfile's writer lease; the lease is
/// released when the writer is committed or dropped.
pub struct Writer {
    provider: BlockfileProvider,
    lease: WriterLease,
    base: Arc<Manifest>,
    ops: BTreeMap<BlockKey, Option<BlockValue>>,
}

impl Writer {
    pub(crate) fn new(provider: BlockfileProvider, lease: WriterLease, base: Arc<Manifest>) -> Self {
        Self {
            provider,
            lease,
            base,
            ops: BTreeMap::new(),
        }
    }

    /// The blockfile being written.
    #[must_use]
    pub fn id(&self) -> &BlockfileId {
        self.lease.blockfile()
    }

    /// Version of the manifest this writer supersedes.
    #[must_use]
    pub fn base_version(&self) -> u64 {
        self.base.version
    }

    /// Buffers an insert or overwrite.
    pub fn set(&mut self, key: BlockKey, value: BlockValue) {
        self.ops.insert(key, Some(value));
    }

    /// Buffers a delete. Deleting an absent key is a no-op at commit.
    pub fn delete(&mut self, key: BlockKey) {
        self.ops.insert(key, None);
    }

    /// Number of buffered operations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Writes the new blocks, then the new manifest at `base_version + 1`.
    ///
    /// Blocks untouched by the batch are referenced unchanged. Touched
    /// blocks are rewritten, split when they outgrow the target size and
    /// merged with a direct neighbour when they shrink below the minimum
    /// occupancy and the pair still fits the target. With nothing buffered
    /// the base manifest is returned and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires before the first write, and
    /// `BackendUnavailable` or `Corrupt` if a block cannot be read or
    /// written. A failed commit leaves every published manifest intact.
    pub fn commit(self, cancel: &CancellationToken) -> CoreResult<Manifest> {
        if self.ops.is_empty() {
            return Ok(self.base.as_ref().clone());
        }
        let pieces = self.rebuild()?;
        let pieces = self.split(pieces);
        let pieces = self.merge(pieces)?;

        cancel.check()?;

        let id = self.lease.blockfile();
        let mut entries = Vec::with_capacity(pieces.len());
        let mut written = 0usize;
        for piece in pieces {
            match piece {
                Piece::Kept(entry) => entries.push(entry),
                Piece::Fresh(fresh) => {
                    let block = Block::from_sorted(fresh);
                    let (Some(start), Some(end)) = (block.first_key(), block.last_key()) else {
                        continue;
                    };
                    let (start, end) = (start.clone(), end.clone());
                    let (block_id, bytes) = encode_addressed(&block)?;
                    self.provider.backend().put(&id.block_key(&block_id), &bytes)?;
                    tracing::debug!(blockfile = %id, block_id = %block_id, bytes = bytes.len(), "wrote block");
                    entries.push(ManifestEntry {
                        start,
                        end,
                        block_id: block_id.clone(),
                        size: block.size() as u64,
                        count: u32::try_from(block.len()).unwrap_or(u32::MAX),
                    });
                    self.provider.cache().insert(&block_id, Arc::new(block));
                    written += 1;
                }
            }
        }

        let manifest = Manifest {
            blockfile: id.name.clone(),
            version: self.base.version + 1,
            entries,
        };
        self.provider
            .backend()
            .put(&id.manifest_key(manifest.version), &manifest.encode()?)?;
        tracing::info!(
            blockfile = %id,
            version = manifest.version,
            blocks = manifest.entries.len(),
            written,
            "committed blockfile"
        );
        Ok(manifest)
    }

    /// Applies the buffered operations to the blocks they touch.
    fn rebuild(&self) -> CoreResult<Vec<Piece>> {
        let mut groups: BTreeMap<usize, BTreeMap<BlockKey, Option<BlockValue>>> = BTreeMap::new();
        let mut orphans = BTreeMap::new();
        for (key, op) in &self.ops {
            match self.base.owner(key) {
                Some(index) => groups.entry(index).or_default().insert(key.clone(), op.clone()),
                None => orphans.insert(key.clone(), op.clone()),
            };
        }

        let mut pieces = Vec::with_capacity(self.base.entries.len() + 1);
        if !orphans.is_empty() {
            pieces.push(Piece::Fresh(apply_ops(&[], orphans)));
        }
        for (index, entry) in self.base.entries.iter().enumerate() {
            match groups.remove(&index) {
                Some(ops) => {
                    let block = self.provider.fetch_block(self.id(), &entry.block_id)?;
                    pieces.push(Piece::Fresh(apply_ops(block.entries(), ops)));
                }
                None => pieces.push(Piece::Kept(entry.clone())),
            }
        }
        pieces.retain(|p| !matches!(p, Piece::Fresh(entries) if entries.is_empty()));
        Ok(pieces)
    }

    /// Splits oversized fresh pieces into pieces no larger than the target.
    fn split(&self, pieces: Vec<Piece>) -> Vec<Piece> {
        let target = self.provider.config().target_block_size;
        let mut out = Vec::with_capacity(pieces.len());
        for piece in pieces {
            match piece {
                Piece::Fresh(entries) if entries_size(&entries) > target => {
                    out.extend(split_entries(entries, target).into_iter().map(Piece::Fresh));
                }
                other => out.push(other),
            }
        }
        out
    }

    /// One left-to-right pass merging undersized fresh pieces into a direct
    /// neighbour. A merged piece is not merged again.
    fn merge(&self, pieces: Vec<Piece>) -> CoreResult<Vec<Piece>> {
        let config = self.provider.config();
        let (target, min) = (config.target_block_size, config.min_block_size());
        let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
        let mut last_merged = false;
        for piece in pieces {
            if let Some(prev) = out.last_mut() {
                let candidate = prev.is_undersized(min) || piece.is_undersized(min);
                if !last_merged && candidate && prev.size() + piece.size() <= target {
                    let mut entries = self.take_entries(prev)?;
                    entries.extend(self.into_entries(piece)?);
                    *prev = Piece::Fresh(entries);
                    last_merged = true;
                    continue;
                }
            }
            out.push(piece);
            last_merged = false;
        }
        Ok(out)
    }

    fn take_entries(&self, piece: &mut Piece) -> CoreResult<Entries> {
        match piece {
            Piece::Fresh(entries) => Ok(std::mem::take(entries)),
            Piece::Kept(entry) => Ok(self.provider.fetch_block(self.id(), &entry.block_id)?.entries().to_vec()),
        }
    }

    fn into_entries(&self, piece: Piece) -> CoreResult<Entries> {
        match piece {
            Piece::Fresh(entries) => Ok(entries),
            Piece::Kept(entry) => Ok(self.provider.fetch_block(self.id(), &entry.block_id)?.entries().to_vec()),
        }
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("id", self.id())
            .field("base_version", &self.base.version)
            .field("pending", &self.ops.len())
            .finish()
    }
}

/// Merges sorted `ops` into sorted `base`; `None` deletes.
fn apply_ops(base: &[(BlockKey, BlockValue)], ops: BTreeMap<BlockKey, Option<BlockValue>>) -> Entries {
    let mut out = Vec::with_capacity(base.len() + ops.len());
    let mut ops = ops.into_iter().peekable();
    for (key, value) in base {
        while let Some((k, op)) = ops.next_if(|(k, _)| k < key) {
            if let Some(v) = op {
                out.push((k, v));
            }
        }
        match ops.next_if(|(k, _)| k == key) {
            Some((k, Some(v))) => out.push((k, v)),
            Some((_, None)) => {}
            None => out.push((key.clone(), value.clone())),
        }
    }
    out.extend(ops.filter_map(|(k, op)| op.map(|v| (k, v))));
    out
}

/// Cuts `entries` into runs of roughly equal size, none above `target`
/// unless a single entry is.
fn split_entries(entries: Entries, target: usize) -> Vec<Entries> {
    let total = entries_size(&entries);
    let parts = total.div_ceil(target.max(1)).max(1);
    let goal = total.div_ceil(parts);

    let mut out = Vec::with_capacity(parts);
    let mut current = Vec::new();
    let mut size = 0usize;
    for (key, value) in entries {
        let len = entry_size(&key, &value);
        if !current.is_empty() && size + len > target {
            out.push(std::mem::take(&mut current));
            size = 0;
        }
        current.push((key, value));
        size += len;
        if size >= goal {
            out.push(std::mem::take(&mut current));
            size = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockfile::{BlockfileProvider, KeyRange};
    use crate::cache::BlockCache;
    use crate::config::{BlockfileConfig, CacheConfig};
    use crate::error::CoreError;
    use crate::types::{CollectionId, SegmentId, SegmentKind};
    use std::collections::HashSet;
    use tessera_storage::{FaultyBackend, InMemoryBackend, ObjectBackend};

    fn setup(config: BlockfileConfig) -> (Arc<FaultyBackend<InMemoryBackend>>, BlockfileProvider, BlockfileId) {
        let backend = Arc::new(FaultyBackend::new(InMemoryBackend::new()));
        let provider = BlockfileProvider::new(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            Arc::new(BlockCache::new(CacheConfig::default())),
            config,
        );
        let id = BlockfileId::new(CollectionId::new(), SegmentKind::Record, SegmentId::new(), "data");
        (backend, provider, id)
    }

    fn commit(
        provider: &BlockfileProvider,
        id: &BlockfileId,
        base: u64,
        ops: impl IntoIterator<Item = (u32, Option<u32>)>,
    ) -> Manifest {
        let mut writer = provider.writer(id, base).unwrap();
        for (k, v) in ops {
            match v {
                Some(v) => writer.set(BlockKey::u32("", k), BlockValue::U32(v)),
                None => writer.delete(BlockKey::u32("", k)),
            }
        }
        writer.commit(&CancellationToken::new()).unwrap()
    }

    fn block_ids(manifest: &Manifest) -> HashSet<String> {
        manifest.entries.iter().map(|e| e.block_id.clone()).collect()
    }

    #[test]
    fn overwrite_after_flush() {
        let (_, provider, id) = setup(BlockfileConfig::default());
        let mut writer = provider.writer(&id, 0).unwrap();
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            writer.set(BlockKey::str("", k), BlockValue::U32(v));
        }
        let v1 = writer.commit(&CancellationToken::new()).unwrap();

        let mut writer = provider.writer(&id, v1.version).unwrap();
        writer.set(BlockKey::str("", "b"), BlockValue::U32(20));
        let v2 = writer.commit(&CancellationToken::new()).unwrap();
        assert_eq!(v2.version, 2);

        let reader = provider.reader(&id, v2.version).unwrap();
        assert_eq!(reader.get(&BlockKey::str("", "b")).unwrap(), Some(BlockValue::U32(20)));
        let scanned: Vec<_> = reader
            .scan(KeyRange::inclusive(BlockKey::str("", "a"), BlockKey::str("", "c")))
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            scanned,
            vec![
                (BlockKey::str("", "a"), BlockValue::U32(1)),
                (BlockKey::str("", "b"), BlockValue::U32(20)),
                (BlockKey::str("", "c"), BlockValue::U32(3)),
            ]
        );

        let old = provider.reader(&id, v1.version).unwrap();
        assert_eq!(old.get(&BlockKey::str("", "b")).unwrap(), Some(BlockValue::U32(2)));
    }

    #[test]
    fn untouched_blocks_are_reused() {
        let (backend, provider, id) = setup(BlockfileConfig::default().target_block_size(256));
        let v1 = commit(&provider, &id, 0, (0..200).map(|i| (i, Some(i))));
        assert!(v1.entries.len() > 5);

        backend.reset_counts();
        let v2 = commit(&provider, &id, 1, [(100, Some(1000))]);
        let before = block_ids(&v1);
        let after = block_ids(&v2);
        assert_eq!(after.difference(&before).count(), 1);
        assert_eq!(before.difference(&after).count(), 1);
        // one fresh block plus the manifest
        assert_eq!(backend.total_puts(), 2);
    }

    #[test]
    fn oversized_block_splits() {
        let (_, provider, id) = setup(BlockfileConfig::default().target_block_size(200));
        let v1 = commit(&provider, &id, 0, (0..8).map(|i| (i * 2, Some(i))));
        assert_eq!(v1.entries.len(), 1);

        let v2 = commit(&provider, &id, 1, (0..4).map(|i| (i * 2 + 1, Some(i))));
        assert_eq!(v2.entries.len(), 2);
        assert!(v2.entries.iter().all(|e| e.size <= 200 + 64));
        assert_eq!(v2.count(), 12);
    }

    #[test]
    fn undersized_block_merges_with_neighbour() {
        let config = BlockfileConfig::default()
            .target_block_size(256)
            .min_block_occupancy_percent(50);
        let (_, provider, id) = setup(config);
        let v1 = commit(&provider, &id, 0, (0..40).map(|i| (i, Some(i))));
        let blocks = v1.entries.len();
        assert!(blocks >= 3);

        // Empty all but one entry of the second block.
        let second = &v1.entries[1];
        let (lo, hi) = (second.start.key.as_u32().unwrap(), second.end.key.as_u32().unwrap());
        let v2 = commit(&provider, &id, 1, (lo..hi).map(|i| (i, None)));
        assert_eq!(v2.entries.len(), blocks - 1);
        assert_eq!(v2.count(), 40 - u64::from(hi - lo));
    }

    #[test]
    fn emptied_block_is_dropped() {
        let (_, provider, id) = setup(BlockfileConfig::default().target_block_size(256));
        let v1 = commit(&provider, &id, 0, (0..40).map(|i| (i, Some(i))));
        let second = &v1.entries[1];
        let (lo, hi) = (second.start.key.as_u32().unwrap(), second.end.key.as_u32().unwrap());
        let v2 = commit(&provider, &id, 1, (lo..=hi).map(|i| (i, None)));
        assert!(v2.entries.iter().all(|e| e.block_id != second.block_id));
        assert_eq!(v2.count(), 40 - u64::from(hi - lo + 1));

        let all = commit(&provider, &id, 2, (0..40).map(|i| (i, None)));
        assert!(all.entries.is_empty());
        assert_eq!(provider.reader(&id, 3).unwrap().count(), 0);
    }

    #[test]
    fn keys_outside_existing_ranges() {
        let (_, provider, id) = setup(BlockfileConfig::default());
        commit(&provider, &id, 0, [(10, Some(1)), (20, Some(2))]);
        let v2 = commit(&provider, &id, 1, [(5, Some(0)), (15, Some(0)), (25, Some(0))]);
        let reader = provider.reader(&id, v2.version).unwrap();
        let keys: Vec<u32> = reader
            .scan(KeyRange::all())
            .map(|r| r.unwrap().0.key.as_u32().unwrap())
            .collect();
        assert_eq!(keys, vec![5, 10, 15, 20, 25]);
    }

    #[test]
    fn cancelled_commit_writes_nothing() {
        let (backend, provider, id) = setup(BlockfileConfig::default());
        let mut writer = provider.writer(&id, 0).unwrap();
        writer.set(BlockKey::u32("", 1), BlockValue::U32(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(writer.commit(&cancel), Err(CoreError::Cancelled));
        assert_eq!(backend.total_puts(), 0);
        assert!(provider.list_versions(&id).unwrap().is_empty());
    }

    #[test]
    fn failed_block_write_leaves_no_manifest() {
        let (backend, provider, id) = setup(BlockfileConfig::default());
        commit(&provider, &id, 0, [(1, Some(1))]);
        backend.fail_puts_containing(Some("/blocks/"));

        let mut writer = provider.writer(&id, 1).unwrap();
        writer.set(BlockKey::u32("", 2), BlockValue::U32(2));
        assert!(matches!(
            writer.commit(&CancellationToken::new()),
            Err(CoreError::BackendUnavailable { .. })
        ));
        assert_eq!(provider.list_versions(&id).unwrap(), vec![1]);
    }

    #[test]
    fn empty_commit_is_free() {
        let (backend, provider, id) = setup(BlockfileConfig::default());
        let writer = provider.writer(&id, 0).unwrap();
        assert!(writer.is_empty());
        let manifest = writer.commit(&CancellationToken::new()).unwrap();
        assert_eq!(manifest.version, 0);
        assert_eq!(backend.total_puts(), 0);
    }

    #[test]
    fn apply_ops_merges_and_deletes() {
        let base = vec![
            (BlockKey::u32("", 1), BlockValue::U32(1)),
            (BlockKey::u32("", 3), BlockValue::U32(3)),
            (BlockKey::u32("", 5), BlockValue::U32(5)),
        ];
        let mut ops = BTreeMap::new();
        ops.insert(BlockKey::u32("", 0), Some(BlockValue::U32(0)));
        ops.insert(BlockKey::u32("", 3), None);
        ops.insert(BlockKey::u32("", 4), Some(BlockValue::U32(4)));
        ops.insert(BlockKey::u32("", 5), Some(BlockValue::U32(50)));
        ops.insert(BlockKey::u32("", 7), None);
        ops.insert(BlockKey::u32("", 9), Some(BlockValue::U32(9)));

        let merged: Vec<u32> = apply_ops(&base, ops)
            .into_iter()
            .map(|(_, v)| v.as_u32().unwrap())
            .collect();
        assert_eq!(merged, vec![0, 1, 4, 50, 9]);
    }

    #[test]
    fn split_respects_target() {
        let entries: Entries = (0..100).map(|i| (BlockKey::u32("", i), BlockValue::U32(i))).collect();
        let total = entries_size(&entries);
        let parts = split_entries(entries, total / 3);
        assert!(parts.len() >= 3 && parts.len() <= 4);
        assert!(parts.iter().all(|p| entries_size(p) <= total / 3));
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 100);
    }
}
