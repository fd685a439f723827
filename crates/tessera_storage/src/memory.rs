//! In-memory object backend for testing.

use crate::backend::ObjectBackend;
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory object backend.
///
/// This backend stores all objects in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral stores that don't need persistence
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{ObjectBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("a/1", b"test data").unwrap();
/// assert_eq!(backend.len(), 1);
/// assert_eq!(backend.list("a/").unwrap(), vec!["a/1".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Returns the total size of all stored objects in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.objects.read().values().map(Bytes::len).sum()
    }

    /// Removes every object.
    pub fn clear(&self) {
        self.objects.write().clear();
    }
}

impl ObjectBackend for InMemoryBackend {
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.objects
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
