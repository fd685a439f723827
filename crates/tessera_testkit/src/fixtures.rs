//! Test fixtures and store helpers.
//!
//! Every fixture sits on a [`FaultyBackend`] so tests can count requests and
//! inject failures against the same store they read and write.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{
    BlockCache, BlockKey, BlockValue, BlockfileId, BlockfileProvider, CancellationToken, CollectionId, Config,
    KeyRange, Manifest, ObjectCatalog, Reader, SegmentId, SegmentKind, SegmentManager,
};
use tessera_storage::{EncryptedBackend, EncryptionKey, FaultyBackend, FileBackend, InMemoryBackend, ObjectBackend};

/// An object store with its provider and catalog.
pub struct TestStore<B: ObjectBackend + 'static = InMemoryBackend> {
    /// The fault-injecting backend every component shares.
    pub backend: Arc<FaultyBackend<B>>,
    /// Blockfile access with a shared block cache.
    pub provider: BlockfileProvider,
    /// Published collection versions, stored in the same backend.
    pub catalog: Arc<ObjectCatalog>,
    config: Config,
}

impl TestStore {
    /// Creates an in-memory store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an in-memory store.
    pub fn with_config(config: Config) -> Self {
        Self::over(InMemoryBackend::new(), config)
    }
}

impl TestStore<EncryptedBackend<InMemoryBackend>> {
    /// Creates an in-memory store that encrypts every object with `key`.
    /// Faults are injected above the encryption layer.
    pub fn encrypted(config: Config, key: EncryptionKey) -> Self {
        Self::over(EncryptedBackend::new(InMemoryBackend::new(), key), config)
    }

    /// The stored, encrypted objects, by key.
    pub fn raw_objects(&self) -> Vec<(String, Vec<u8>)> {
        let raw = self.backend.inner().inner();
        raw.list("")
            .expect("Failed to list objects")
            .into_iter()
            .map(|key| {
                let bytes = raw.get(&key).expect("Failed to read object").to_vec();
                (key, bytes)
            })
            .collect()
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ObjectBackend + 'static> TestStore<B> {
    /// Wraps `backend` in a store.
    pub fn over(backend: B, config: Config) -> Self {
        let backend = Arc::new(FaultyBackend::new(backend));
        let shared: Arc<dyn ObjectBackend> = Arc::clone(&backend) as Arc<dyn ObjectBackend>;
        let provider = BlockfileProvider::new(
            Arc::clone(&shared),
            Arc::new(BlockCache::new(config.cache.clone())),
            config.blockfile.clone(),
        );
        Self {
            backend,
            provider,
            catalog: Arc::new(ObjectCatalog::new(shared)),
            config,
        }
    }

    /// The configuration collections are created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A provider over the same backend with its own, empty cache.
    pub fn cold_provider(&self) -> BlockfileProvider {
        BlockfileProvider::new(
            Arc::clone(&self.backend) as Arc<dyn ObjectBackend>,
            Arc::new(BlockCache::new(self.config.cache.clone())),
            self.config.blockfile.clone(),
        )
    }

    /// A fresh blockfile id in a fresh record segment.
    pub fn blockfile(&self, name: &str) -> BlockfileId {
        BlockfileId::new(CollectionId::new(), SegmentKind::Record, SegmentId::new(), name)
    }

    /// Creates an empty collection.
    pub fn create_collection(&self) -> SegmentManager {
        SegmentManager::create(
            CollectionId::new(),
            self.provider.clone(),
            Arc::clone(&self.catalog) as Arc<dyn tessera_core::Catalog>,
            self.config.clone(),
        )
        .expect("Failed to create collection")
    }

    /// Opens a published collection through a cold provider.
    pub fn reopen(&self, collection: CollectionId) -> SegmentManager {
        SegmentManager::open(
            collection,
            self.cold_provider(),
            Arc::clone(&self.catalog) as Arc<dyn tessera_core::Catalog>,
            self.config.clone(),
        )
        .expect("Failed to open collection")
    }
}

/// A directory-backed store with automatic cleanup.
pub struct TempStore {
    /// The store.
    pub store: TestStore<FileBackend>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TempStore {
    /// Creates a store in a new temporary directory.
    pub fn new(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = FileBackend::open(temp_dir.path()).expect("Failed to open file backend");
        Self {
            store: TestStore::over(backend, config),
            _temp_dir: temp_dir,
        }
    }

    /// Root directory of the store.
    pub fn path(&self) -> &Path {
        self._temp_dir.path()
    }
}

impl std::ops::Deref for TempStore {
    type Target = TestStore<FileBackend>;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Commits `u32 -> u32` writes (or deletes, for `None`) on top of `base`.
pub fn commit_u32(
    provider: &BlockfileProvider,
    id: &BlockfileId,
    base: u64,
    ops: impl IntoIterator<Item = (u32, Option<u32>)>,
) -> Manifest {
    let mut writer = provider.writer(id, base).expect("Failed to open writer");
    for (key, value) in ops {
        match value {
            Some(value) => writer.set(BlockKey::u32("", key), BlockValue::U32(value)),
            None => writer.delete(BlockKey::u32("", key)),
        }
    }
    writer.commit(&CancellationToken::new()).expect("Failed to commit")
}

/// Commits string-keyed `u32` values on top of `base`.
pub fn commit_str(
    provider: &BlockfileProvider,
    id: &BlockfileId,
    base: u64,
    ops: impl IntoIterator<Item = (&'static str, u32)>,
) -> Manifest {
    let mut writer = provider.writer(id, base).expect("Failed to open writer");
    for (key, value) in ops {
        writer.set(BlockKey::str("", key), BlockValue::U32(value));
    }
    writer.commit(&CancellationToken::new()).expect("Failed to commit")
}

/// Every `u32 -> u32` entry of a reader, in key order.
pub fn scan_u32(reader: &Reader) -> Vec<(u32, u32)> {
    reader
        .scan(KeyRange::all())
        .map(|entry| {
            let (key, value) = entry.expect("Failed to scan");
            match (key.key.as_u32(), value) {
                (Some(key), BlockValue::U32(value)) => (key, value),
                (_, value) => panic!("unexpected entry {key} => {value:?}"),
            }
        })
        .collect()
}
