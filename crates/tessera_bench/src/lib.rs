//! Benchmark utilities.

use rand::Rng;
use std::sync::Arc;
use tessera_core::{
    BlockCache, BlockKey, BlockValue, BlockfileId, BlockfileProvider, CancellationToken, CollectionId, Config,
    InMemoryCatalog, OperationRecord, Reader, SegmentId, SegmentKind, SegmentManager, SparseVector,
};
use tessera_storage::{InMemoryBackend, ObjectBackend};

/// Creates a provider over a fresh in-memory backend.
pub fn memory_provider(config: &Config) -> BlockfileProvider {
    BlockfileProvider::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(BlockCache::new(config.cache.clone())),
        config.blockfile.clone(),
    )
}

/// A provider sharing `provider`'s backend with an empty cache of its own.
pub fn cold_provider(provider: &BlockfileProvider, config: &Config) -> BlockfileProvider {
    BlockfileProvider::new(
        Arc::clone(provider.backend()) as Arc<dyn ObjectBackend>,
        Arc::new(BlockCache::new(config.cache.clone())),
        config.blockfile.clone(),
    )
}

/// Writes `count` sequential `u32` keys with `payload`-byte string values
/// and returns the blockfile and its version.
pub fn populated_blockfile(provider: &BlockfileProvider, count: u32, payload: usize) -> (BlockfileId, u64) {
    let id = BlockfileId::new(CollectionId::new(), SegmentKind::Record, SegmentId::new(), "bench");
    let mut writer = provider.writer(&id, 0).unwrap();
    for key in 0..count {
        writer.set(BlockKey::u32("", key), BlockValue::Str(random_text(payload)));
    }
    let manifest = writer.commit(&CancellationToken::new()).unwrap();
    (id, manifest.version)
}

/// Random lowercase text of the given length.
pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
}

/// A random sparse vector of `terms` terms drawn from a vocabulary of
/// `vocabulary` terms, with weights in `(0, 1)`.
pub fn random_sparse(vocabulary: usize, terms: usize) -> SparseVector {
    let mut rng = rand::thread_rng();
    (0..terms)
        .map(|_| (format!("t{}", rng.gen_range(0..vocabulary)), rng.gen::<f32>()))
        .collect()
}

/// A flushed collection of `count` records with random sparse vectors.
pub fn sparse_collection(config: Config, count: usize, vocabulary: usize, terms: usize) -> SegmentManager {
    let provider = memory_provider(&config);
    let mut manager =
        SegmentManager::create(CollectionId::new(), provider, Arc::new(InMemoryCatalog::new()), config).unwrap();
    let batch = (0..count)
        .map(|i| OperationRecord::add(format!("doc-{i}")).sparse(random_sparse(vocabulary, terms)))
        .collect::<Vec<_>>();
    for chunk in batch.chunks(1000) {
        manager.apply(chunk).unwrap();
        manager.flush(&CancellationToken::new()).unwrap();
    }
    manager
}

/// Readers over the published `sparse` and `sparse_max` blockfiles.
pub fn sparse_readers(manager: &SegmentManager) -> (Reader, Reader) {
    let segment = manager.version().segment(SegmentKind::Metadata).unwrap();
    let reader = |name: &str| {
        let id = BlockfileId::new(manager.collection(), SegmentKind::Metadata, segment.id, name);
        manager.provider().reader(&id, segment.version_of(name)).unwrap()
    };
    (reader("sparse"), reader("sparse_max"))
}
