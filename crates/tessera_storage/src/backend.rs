//! Object backend trait definition.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;

/// A durable key → bytes object store.
///
/// Object backends are **opaque byte stores**. tessera owns all format
/// interpretation - backends do not understand blocks or manifests.
///
/// # Invariants
///
/// - `get` after a successful `put` on the same key returns exactly those bytes
/// - `put` replaces the whole object; readers never observe a partial object
/// - `list` returns keys in ascending lexicographic order
/// - Backends must be `Send + Sync` for concurrent access
///
/// Keys are hierarchical, `/`-separated strings such as
/// `collections/{collection_id}/segments/{kind}/{segment_id}/blocks/{block_id}`.
pub trait ObjectBackend: Send + Sync {
    /// Stores `data` under `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object could not be written durably.
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Reads the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no object exists, or another
    /// error if the backend could not be reached.
    fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Deletes the object stored under `key`.
    ///
    /// Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists all keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Returns whether an object exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<B: ObjectBackend + ?Sized> ObjectBackend for std::sync::Arc<B> {
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        (**self).put(key, data)
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        (**self).get(key)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).list(prefix)
    }
}
