//! Content-addressed block cache.
//!
//! The cache maps block ids to decoded blocks. It knows nothing about
//! blockfiles: a block id names immutable content, so any cached block may
//! be shared by every reader without copying.
//!
//! Concurrent misses on the same block collapse into one backend fetch.
//! The first caller fetches; later callers wait on the in-flight slot and
//! receive the same result.

use crate::blockfile::Block;
use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::stats::CacheStats;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_codec::decode_addressed;
use tessera_storage::ObjectBackend;

/// An in-progress fetch shared by every caller waiting on the same block.
#[derive(Default)]
struct InFlight {
    result: Mutex<Option<CoreResult<Arc<Block>>>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> CoreResult<Arc<Block>> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn complete(&self, outcome: CoreResult<Arc<Block>>) {
        *self.result.lock() = Some(outcome);
        self.done.notify_all();
    }
}

/// Settles an in-flight slot when the fetching caller is done with it.
///
/// Dropped without an outcome, the fetch unwound: waiters get an error and
/// the next caller fetches again.
struct Fetching<'a> {
    cache: &'a BlockCache,
    block_id: &'a str,
    slot: Arc<InFlight>,
    outcome: Option<CoreResult<Arc<Block>>>,
}

impl Drop for Fetching<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(CoreError::backend_unavailable(format!(
                "fetch of block {} panicked",
                self.block_id
            )))
        });
        {
            let mut state = self.cache.state.lock();
            state.in_flight.remove(self.block_id);
            if let Ok(block) = &outcome {
                self.cache.insert_locked(&mut state, self.block_id, Arc::clone(block));
            }
        }
        if outcome.is_err() {
            self.cache.stats.record_fetch_error();
        }
        self.slot.complete(outcome);
    }
}

struct CacheState {
    blocks: LruCache<String, Arc<Block>>,
    bytes: usize,
    in_flight: HashMap<String, Arc<InFlight>>,
}

/// In-process block cache with LRU eviction bounded by bytes and entries.
///
/// Eviction only drops the cache's own reference: a reader holding a block
/// keeps it alive until the read finishes.
pub struct BlockCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    stats: CacheStats,
}

impl BlockCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                blocks: LruCache::unbounded(),
                bytes: 0,
                in_flight: HashMap::new(),
            }),
            stats: CacheStats::new(),
        }
    }

    /// Returns the block with id `block_id`, fetching it from `object_key`
    /// on a miss.
    ///
    /// The fetched bytes are verified against `block_id` before the block is
    /// cached, so a corrupt object is never cached.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the fetch fails and `Corrupt` if the
    /// object is missing or does not decode to a block with this id.
    pub fn resolve(
        &self,
        backend: &dyn ObjectBackend,
        object_key: &str,
        block_id: &str,
    ) -> CoreResult<Arc<Block>> {
        let slot = {
            let mut state = self.state.lock();
            if let Some(block) = state.blocks.get(block_id) {
                self.stats.record_hit();
                return Ok(Arc::clone(block));
            }
            if let Some(slot) = state.in_flight.get(block_id) {
                let slot = Arc::clone(slot);
                drop(state);
                self.stats.record_coalesced();
                return slot.wait();
            }
            let slot = Arc::new(InFlight::default());
            state
                .in_flight
                .insert(block_id.to_string(), Arc::clone(&slot));
            slot
        };

        tracing::debug!(block_id, object_key, "block cache miss");
        let mut fetching = Fetching {
            cache: self,
            block_id,
            slot,
            outcome: None,
        };
        let outcome = self.fetch(backend, object_key, block_id);
        fetching.outcome = Some(outcome.clone());
        drop(fetching);
        outcome
    }

    fn fetch(
        &self,
        backend: &dyn ObjectBackend,
        object_key: &str,
        block_id: &str,
    ) -> CoreResult<Arc<Block>> {
        let bytes = backend.get(object_key)?;
        self.stats.record_miss(bytes.len() as u64);
        let block: Block = decode_addressed(&bytes, block_id)
            .map_err(|e| CoreError::corrupt(format!("block {block_id}: {e}")))?;
        Ok(Arc::new(block))
    }

    /// Inserts a block written by this process.
    pub fn insert(&self, block_id: &str, block: Arc<Block>) {
        let mut state = self.state.lock();
        self.stats.record_insert();
        self.insert_locked(&mut state, block_id, block);
    }

    fn insert_locked(&self, state: &mut CacheState, block_id: &str, block: Arc<Block>) {
        let size = block.size();
        if let Some(old) = state.blocks.put(block_id.to_string(), block) {
            state.bytes -= old.size();
        }
        state.bytes += size;

        while state.blocks.len() > self.config.capacity_entries
            || state.bytes > self.config.capacity_bytes
        {
            let Some((evicted_id, evicted)) = state.blocks.pop_lru() else {
                break;
            };
            state.bytes -= evicted.size();
            self.stats.record_eviction();
            tracing::trace!(block_id = %evicted_id, "evicted block");
        }
    }

    /// Returns whether a block is cached, without touching recency.
    #[must_use]
    pub fn contains(&self, block_id: &str) -> bool {
        self.state.lock().blocks.contains(block_id)
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Returns true if no block is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().blocks.is_empty()
    }

    /// Total approximate size of cached blocks.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Drops every cached block.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.blocks.clear();
        state.bytes = 0;
    }

    /// Returns the cache counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockfile::{BlockKey, BlockValue};
    use std::thread;
    use std::time::Duration;
    use tessera_codec::encode_addressed;
    use tessera_storage::{FaultyBackend, InMemoryBackend};

    fn store_block(backend: &dyn ObjectBackend, n: u32) -> (String, String) {
        let block = Block::from_sorted(vec![(BlockKey::u32("", n), BlockValue::U32(n))]);
        let (id, bytes) = encode_addressed(&block).unwrap();
        let key = format!("blocks/{id}");
        backend.put(&key, &bytes).unwrap();
        (key, id)
    }

    #[test]
    fn miss_then_hit() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        let (key, id) = store_block(&backend, 1);
        let cache = BlockCache::new(CacheConfig::default());

        let a = cache.resolve(&backend, &key, &id).unwrap();
        let b = cache.resolve(&backend, &key, &id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.get_count(&key), 1);

        let stats = cache.stats().snapshot();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn concurrent_misses_fetch_once() {
        let backend = Arc::new(FaultyBackend::new(InMemoryBackend::new()));
        let (key, id) = store_block(backend.as_ref(), 7);
        backend.set_get_delay(Some(Duration::from_millis(50)));
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = Arc::clone(&backend);
                let cache = Arc::clone(&cache);
                let key = key.clone();
                let id = id.clone();
                thread::spawn(move || cache.resolve(backend.as_ref(), &key, &id).unwrap())
            })
            .collect();
        let blocks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(backend.get_count(&key), 1);
        assert!(blocks.iter().all(|b| Arc::ptr_eq(b, &blocks[0])));
    }

    /// Panics on every get, after a delay.
    struct PanickingBackend(InMemoryBackend);

    impl ObjectBackend for PanickingBackend {
        fn put(&self, key: &str, data: &[u8]) -> tessera_storage::StorageResult<()> {
            self.0.put(key, data)
        }

        fn get(&self, _key: &str) -> tessera_storage::StorageResult<bytes::Bytes> {
            thread::sleep(Duration::from_millis(300));
            panic!("backend exploded");
        }

        fn delete(&self, key: &str) -> tessera_storage::StorageResult<()> {
            self.0.delete(key)
        }

        fn list(&self, prefix: &str) -> tessera_storage::StorageResult<Vec<String>> {
            self.0.list(prefix)
        }
    }

    #[test]
    fn panicking_fetch_releases_waiters() {
        let backend = Arc::new(PanickingBackend(InMemoryBackend::new()));
        let (key, id) = store_block(backend.as_ref(), 3);
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));

        let leader = {
            let (backend, cache, key, id) = (Arc::clone(&backend), Arc::clone(&cache), key.clone(), id.clone());
            thread::spawn(move || cache.resolve(backend.as_ref(), &key, &id))
        };
        thread::sleep(Duration::from_millis(50));
        let waited = cache.resolve(backend.as_ref(), &key, &id);
        assert!(matches!(waited, Err(CoreError::BackendUnavailable { .. })));
        assert!(leader.join().is_err());

        // The slot is gone, so a healthy backend fetches afresh.
        let healthy = InMemoryBackend::new();
        healthy.put(&key, &backend.0.get(&key).unwrap()).unwrap();
        assert!(cache.resolve(&healthy, &key, &id).is_ok());
        assert_eq!(cache.stats().fetch_errors(), 1);
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        let (key, id) = store_block(&backend, 1);
        let cache = BlockCache::new(CacheConfig::default());

        backend.set_unavailable(true);
        assert!(matches!(
            cache.resolve(&backend, &key, &id),
            Err(CoreError::BackendUnavailable { .. })
        ));
        assert!(!cache.contains(&id));

        backend.set_unavailable(false);
        assert!(cache.resolve(&backend, &key, &id).is_ok());
        assert_eq!(cache.stats().fetch_errors(), 1);
    }

    #[test]
    fn corrupt_block_is_rejected() {
        let backend = InMemoryBackend::new();
        let (key, id) = store_block(&backend, 1);
        let (other_key, _) = store_block(&backend, 2);
        let cache = BlockCache::new(CacheConfig::default());

        let wrong = backend.get(&other_key).unwrap();
        backend.put(&key, &wrong).unwrap();
        assert!(matches!(
            cache.resolve(&backend, &key, &id),
            Err(CoreError::Corrupt { .. })
        ));
        assert!(cache.is_empty());

        assert!(matches!(
            cache.resolve(&backend, "blocks/missing", &id),
            Err(CoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn evicts_least_recently_used() {
        let backend = InMemoryBackend::new();
        let cache = BlockCache::new(CacheConfig::default().capacity_entries(2));
        let blocks: Vec<_> = (0..3).map(|n| store_block(&backend, n)).collect();

        let held = cache.resolve(&backend, &blocks[0].0, &blocks[0].1).unwrap();
        cache.resolve(&backend, &blocks[1].0, &blocks[1].1).unwrap();
        cache.resolve(&backend, &blocks[0].0, &blocks[0].1).unwrap();
        cache.resolve(&backend, &blocks[2].0, &blocks[2].1).unwrap();

        assert!(cache.contains(&blocks[0].1));
        assert!(!cache.contains(&blocks[1].1));
        assert!(cache.contains(&blocks[2].1));
        assert_eq!(cache.stats().evictions(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn byte_capacity_bounds_size() {
        let backend = InMemoryBackend::new();
        let (key, id) = store_block(&backend, 1);
        let cache = BlockCache::new(CacheConfig::default().capacity_bytes(1));

        let block = cache.resolve(&backend, &key, &id).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(block.len(), 1);
    }
}
