//! Blockfile provider: storage handles, manifests and writer leases.

use crate::blockfile::block::Block;
use crate::blockfile::manifest::Manifest;
use crate::blockfile::reader::Reader;
use crate::blockfile::writer::Writer;
use crate::cache::BlockCache;
use crate::config::{BlockfileConfig, WriterPolicy};
use crate::error::{CoreError, CoreResult};
use crate::layout;
use crate::types::{CollectionId, SegmentId, SegmentKind};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tessera_codec::Decode;
use tessera_storage::ObjectBackend;

/// Identifies one blockfile: a named index inside one segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockfileId {
    /// Owning collection.
    pub collection: CollectionId,
    /// Kind of the owning segment.
    pub kind: SegmentKind,
    /// Owning segment.
    pub segment: SegmentId,
    /// Name of the blockfile within the segment.
    pub name: String,
}

impl BlockfileId {
    /// Creates a blockfile id.
    pub fn new(
        collection: CollectionId,
        kind: SegmentKind,
        segment: SegmentId,
        name: impl Into<String>,
    ) -> Self {
        Self {
            collection,
            kind,
            segment,
            name: name.into(),
        }
    }

    /// Prefix of every object of the owning segment.
    #[must_use]
    pub fn segment_prefix(&self) -> String {
        layout::segment_prefix(self.collection, self.kind, self.segment)
    }

    /// Object key of one manifest version.
    #[must_use]
    pub fn manifest_key(&self, version: u64) -> String {
        layout::manifest_key(&self.segment_prefix(), &self.name, version)
    }

    /// Object key of a block of this blockfile.
    #[must_use]
    pub fn block_key(&self, block_id: &str) -> String {
        layout::block_key(&self.segment_prefix(), block_id)
    }
}

impl fmt::Display for BlockfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.segment, self.name)
    }
}

/// Blockfiles currently open for write.
#[derive(Default)]
struct LeaseTable {
    held: Mutex<HashSet<BlockfileId>>,
    released: Condvar,
}

impl LeaseTable {
    fn acquire(self: &Arc<Self>, id: &BlockfileId, policy: WriterPolicy) -> CoreResult<WriterLease> {
        let mut held = self.held.lock();
        match policy {
            WriterPolicy::FailFast => {
                if held.contains(id) {
                    return Err(CoreError::writer_conflict(id.to_string()));
                }
            }
            WriterPolicy::Block { timeout } => {
                let deadline = Instant::now() + timeout;
                while held.contains(id) {
                    if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(id) {
                        return Err(CoreError::writer_conflict(id.to_string()));
                    }
                }
            }
        }
        held.insert(id.clone());
        Ok(WriterLease {
            table: Arc::clone(self),
            id: id.clone(),
        })
    }
}

/// Exclusive right to write one blockfile. Released on drop.
pub struct WriterLease {
    table: Arc<LeaseTable>,
    id: BlockfileId,
}

impl WriterLease {
    /// The leased blockfile.
    #[must_use]
    pub fn blockfile(&self) -> &BlockfileId {
        &self.id
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.id);
        self.table.released.notify_all();
    }
}

impl fmt::Debug for WriterLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriterLease").field(&self.id).finish()
    }
}

/// Entry point to the blockfile store.
///
/// Cheap to clone; every clone shares the backend, the block cache and the
/// writer lease table.
#[derive(Clone)]
pub struct BlockfileProvider {
    backend: Arc<dyn ObjectBackend>,
    cache: Arc<BlockCache>,
    config: BlockfileConfig,
    leases: Arc<LeaseTable>,
}

impl BlockfileProvider {
    /// Creates a provider.
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        cache: Arc<BlockCache>,
        config: BlockfileConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            config,
            leases: Arc::new(LeaseTable::default()),
        }
    }

    /// The object backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// The block cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The blockfile configuration.
    #[must_use]
    pub fn config(&self) -> &BlockfileConfig {
        &self.config
    }

    /// Loads the manifest of `id` at `version`.
    ///
    /// Version 0 is the empty manifest and is never read from storage.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the manifest is missing or invalid.
    pub fn load_manifest(&self, id: &BlockfileId, version: u64) -> CoreResult<Arc<Manifest>> {
        if version == 0 {
            return Ok(Arc::new(Manifest::empty(id.name.clone())));
        }
        let bytes = self.backend.get(&id.manifest_key(version))?;
        let manifest = Manifest::decode(&bytes)?;
        if manifest.version != version || manifest.blockfile != id.name {
            return Err(CoreError::corrupt(format!(
                "manifest {} claims {}@{}",
                id.manifest_key(version),
                manifest.blockfile,
                manifest.version
            )));
        }
        Ok(Arc::new(manifest))
    }

    /// Opens a reader pinned to `version`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the manifest is missing or invalid, or
    /// `BackendUnavailable` if it cannot be fetched.
    pub fn reader(&self, id: &BlockfileId, version: u64) -> CoreResult<Reader> {
        let manifest = self.load_manifest(id, version)?;
        Ok(Reader::new(self.clone(), id.clone(), manifest))
    }

    /// Opens a writer against `base_version`.
    ///
    /// # Errors
    ///
    /// Returns `WriterConflict` if another writer holds the blockfile and
    /// the writer policy does not allow waiting for it.
    pub fn writer(&self, id: &BlockfileId, base_version: u64) -> CoreResult<Writer> {
        let lease = self.leases.acquire(id, self.config.writer_policy)?;
        let base = self.load_manifest(id, base_version)?;
        Ok(Writer::new(self.clone(), lease, base))
    }

    /// Lists every manifest version written for `id`, ascending.
    ///
    /// Versions written by an aborted flush are listed too; the published
    /// version is whatever the catalog says.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the listing fails.
    pub fn list_versions(&self, id: &BlockfileId) -> CoreResult<Vec<u64>> {
        let prefix = layout::manifest_prefix(&id.segment_prefix(), &id.name);
        let mut versions: Vec<u64> = self
            .backend
            .list(&prefix)?
            .iter()
            .filter_map(|key| layout::parse_version_suffix(key, &prefix))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Opens a reader at the highest stored manifest version.
    ///
    /// # Errors
    ///
    /// See [`Self::list_versions`] and [`Self::reader`].
    pub fn open_latest(&self, id: &BlockfileId) -> CoreResult<Reader> {
        let latest = self.list_versions(id)?.last().copied().unwrap_or(0);
        self.reader(id, latest)
    }

    /// Resolves a block of `id` through the cache.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the block is missing or does not match its id.
    pub fn fetch_block(&self, id: &BlockfileId, block_id: &str) -> CoreResult<Arc<Block>> {
        self.cache
            .resolve(self.backend.as_ref(), &id.block_key(block_id), block_id)
    }
}

impl fmt::Debug for BlockfileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockfileProvider")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockfile::{BlockKey, BlockValue};
    use crate::cancel::CancellationToken;
    use crate::config::CacheConfig;
    use std::thread;
    use std::time::Duration;
    use tessera_storage::InMemoryBackend;

    fn provider(policy: WriterPolicy) -> BlockfileProvider {
        BlockfileProvider::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(BlockCache::new(CacheConfig::default())),
            BlockfileConfig::default().writer_policy(policy),
        )
    }

    fn blockfile(name: &str) -> BlockfileId {
        BlockfileId::new(CollectionId::new(), SegmentKind::Record, SegmentId::new(), name)
    }

    #[test]
    fn second_writer_fails_fast() {
        let provider = provider(WriterPolicy::FailFast);
        let id = blockfile("ids");

        let mut first = provider.writer(&id, 0).unwrap();
        first.set(BlockKey::str("", "a"), BlockValue::U32(1));
        assert!(matches!(
            provider.writer(&id, 0),
            Err(CoreError::WriterConflict { .. })
        ));

        let other = BlockfileId::new(id.collection, id.kind, id.segment, "data");
        assert!(provider.writer(&other, 0).is_ok());

        let manifest = first.commit(&CancellationToken::new()).unwrap();
        assert_eq!(manifest.version, 1);

        let second = provider.writer(&id, 1).unwrap();
        assert_eq!(second.base_version(), 1);
        let reader = provider.reader(&id, 1).unwrap();
        assert_eq!(reader.get(&BlockKey::str("", "a")).unwrap(), Some(BlockValue::U32(1)));
    }

    #[test]
    fn dropped_writer_releases_lease() {
        let provider = provider(WriterPolicy::FailFast);
        let id = blockfile("ids");
        drop(provider.writer(&id, 0).unwrap());
        assert!(provider.writer(&id, 0).is_ok());
    }

    #[test]
    fn blocking_writer_waits_for_release() {
        let provider = provider(WriterPolicy::Block {
            timeout: Duration::from_secs(5),
        });
        let id = blockfile("ids");
        let first = provider.writer(&id, 0).unwrap();

        let waiter = {
            let provider = provider.clone();
            let id = id.clone();
            thread::spawn(move || provider.writer(&id, 0).map(|w| w.base_version()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(first);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn blocking_writer_times_out() {
        let provider = provider(WriterPolicy::Block {
            timeout: Duration::from_millis(20),
        });
        let id = blockfile("ids");
        let _first = provider.writer(&id, 0).unwrap();
        assert!(matches!(
            provider.writer(&id, 0),
            Err(CoreError::WriterConflict { .. })
        ));
    }

    #[test]
    fn missing_manifest_is_corrupt() {
        let provider = provider(WriterPolicy::FailFast);
        let id = blockfile("ids");
        assert!(matches!(provider.reader(&id, 3), Err(CoreError::Corrupt { .. })));
        assert_eq!(provider.reader(&id, 0).unwrap().count(), 0);
    }

    #[test]
    fn manifest_for_other_blockfile_is_corrupt() {
        let provider = provider(WriterPolicy::FailFast);
        let id = blockfile("ids");
        let mut writer = provider.writer(&id, 0).unwrap();
        writer.set(BlockKey::u32("", 1), BlockValue::U32(1));
        writer.commit(&CancellationToken::new()).unwrap();

        let moved = BlockfileId::new(id.collection, id.kind, id.segment, "other");
        let bytes = provider.backend().get(&id.manifest_key(1)).unwrap();
        provider.backend().put(&moved.manifest_key(1), &bytes).unwrap();
        assert!(matches!(provider.reader(&moved, 1), Err(CoreError::Corrupt { .. })));
    }

    #[test]
    fn lists_versions_and_opens_latest() {
        let provider = provider(WriterPolicy::FailFast);
        let id = blockfile("ids");
        for version in 0..3u32 {
            let mut writer = provider.writer(&id, u64::from(version)).unwrap();
            writer.set(BlockKey::u32("", version), BlockValue::U32(version));
            writer.commit(&CancellationToken::new()).unwrap();
        }
        assert_eq!(provider.list_versions(&id).unwrap(), vec![1, 2, 3]);
        let latest = provider.open_latest(&id).unwrap();
        assert_eq!(latest.version(), 3);
        assert_eq!(latest.count(), 3);
    }
}
