//! CLI command implementations.

pub mod dump_manifest;
pub mod inspect;
pub mod list;
pub mod verify;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{
    BlockCache, BlockfileProvider, CacheConfig, Catalog, CollectionId, CollectionVersion, Config, ObjectCatalog,
};
use tessera_storage::{EncryptedBackend, EncryptionKey, FileBackend, ObjectBackend};
use zeroize::Zeroizing;

/// Boxed error used by every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Where a store lives and how to read it.
#[derive(Debug, Clone)]
pub struct Location {
    /// Root directory.
    pub path: PathBuf,
    /// File holding the raw 32-byte key of an encrypted store.
    pub key_file: Option<PathBuf>,
}

impl Location {
    /// Opens the store.
    pub fn open(&self) -> CliResult<Store> {
        let key = match &self.key_file {
            Some(file) => {
                let bytes = Zeroizing::new(
                    std::fs::read(file).map_err(|e| format!("Cannot read key file {}: {e}", file.display()))?,
                );
                Some(EncryptionKey::from_bytes(&bytes)?)
            }
            None => None,
        };
        Store::open(&self.path, key)
    }
}

/// An opened object store.
pub struct Store {
    /// Blockfile access over the store.
    pub provider: BlockfileProvider,
    /// Published collection versions.
    pub catalog: ObjectCatalog,
}

impl Store {
    /// Opens the store rooted at `path`, decrypting objects with `key` if
    /// one is given.
    pub fn open(path: &Path, key: Option<EncryptionKey>) -> CliResult<Self> {
        if !path.is_dir() {
            return Err(format!("No object store found at {}", path.display()).into());
        }
        let files = FileBackend::open(path)?;
        let backend: Arc<dyn ObjectBackend> = match key {
            Some(key) => Arc::new(EncryptedBackend::new(files, key)),
            None => Arc::new(files),
        };
        let config = Config::default();
        // Maintenance reads touch each block once.
        let cache = BlockCache::new(CacheConfig::new().capacity_entries(64));
        Ok(Self {
            provider: BlockfileProvider::new(Arc::clone(&backend), Arc::new(cache), config.blockfile),
            catalog: ObjectCatalog::new(backend),
        })
    }

    /// Loads the current, or a specific, published version of a collection.
    pub fn token(&self, collection: &str, at: Option<u64>) -> CliResult<CollectionVersion> {
        let id = CollectionId::parse(collection).map_err(|e| format!("Invalid collection id {collection:?}: {e}"))?;
        let token = match at {
            Some(version) => self.catalog.load(id, version)?,
            None => self
                .catalog
                .current(id)?
                .ok_or_else(|| format!("Collection {collection} not found"))?,
        };
        Ok(token)
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::populated_store_with;
    use super::*;
    use tessera_core::Catalog;

    #[test]
    fn encrypted_store_needs_its_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        std::fs::create_dir(&store_dir).unwrap();
        let key = EncryptionKey::generate();
        let collection = populated_store_with(&store_dir, Some(key.clone()));

        let key_file = dir.path().join("store.key");
        std::fs::write(&key_file, key.as_bytes()).unwrap();
        let location = Location {
            path: store_dir.clone(),
            key_file: Some(key_file),
        };
        let store = location.open().unwrap();
        let token = store.token(&collection.to_string(), None).unwrap();
        assert_eq!(token.version, 2);

        // Without the key, the version tokens do not decode.
        let plain = Location {
            path: store_dir.clone(),
            key_file: None,
        }
        .open()
        .unwrap();
        assert!(plain.catalog.current(collection).is_err());

        let wrong_key = dir.path().join("wrong.key");
        std::fs::write(&wrong_key, EncryptionKey::generate().as_bytes()).unwrap();
        let wrong = Location {
            path: store_dir.clone(),
            key_file: Some(wrong_key),
        }
        .open()
        .unwrap();
        assert!(wrong.token(&collection.to_string(), None).is_err());

        let short_key = dir.path().join("short.key");
        std::fs::write(&short_key, [0u8; 7]).unwrap();
        assert!(Location {
            path: store_dir,
            key_file: Some(short_key),
        }
        .open()
        .is_err());
    }
}
