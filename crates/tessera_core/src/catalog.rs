//! Collection version tokens and the catalog they are published to.
//!
//! A [`CollectionVersion`] names the committed descriptor of every segment
//! of a collection. Publishing a token is the single step that makes a
//! flush visible; everything it references is durable before it is
//! published.

use crate::error::{CoreError, CoreResult};
use crate::layout;
use crate::segment::SegmentVersion;
use crate::types::{CollectionId, SegmentKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_codec::{CodecError, CodecResult, Decode, Encode, FrameKind, Framed};
use tessera_storage::ObjectBackend;
use tracing::info;

/// The published state of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionVersion {
    /// Collection id.
    pub collection: CollectionId,
    /// Token version, starting at 1 for a freshly created collection.
    pub version: u64,
    /// One descriptor per segment kind.
    pub segments: Vec<SegmentVersion>,
}

impl CollectionVersion {
    /// The initial token of a new collection: one empty segment per kind.
    #[must_use]
    pub fn initial(collection: CollectionId) -> Self {
        Self {
            collection,
            version: 1,
            segments: SegmentKind::ALL.into_iter().map(SegmentVersion::new).collect(),
        }
    }

    /// The descriptor of the segment of `kind`.
    #[must_use]
    pub fn segment(&self, kind: SegmentKind) -> Option<&SegmentVersion> {
        self.segments.iter().find(|s| s.kind == kind)
    }
}

impl Framed for CollectionVersion {
    const KIND: FrameKind = FrameKind::CollectionVersion;

    fn validate(&self) -> CodecResult<()> {
        if self.version == 0 {
            return Err(CodecError::invalid_structure("collection version 0"));
        }
        for kind in SegmentKind::ALL {
            let count = self.segments.iter().filter(|s| s.kind == kind).count();
            if count != 1 {
                return Err(CodecError::invalid_structure(format!(
                    "{count} {kind} segments in collection {}",
                    self.collection
                )));
            }
        }
        Ok(())
    }
}

/// Where published collection versions live.
pub trait Catalog: Send + Sync {
    /// The currently published token of a collection.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` or `Corrupt` if the token cannot be read.
    fn current(&self, collection: CollectionId) -> CoreResult<Option<CollectionVersion>>;

    /// Publishes a token. It must be exactly one version past the current one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-sequence version, or a
    /// backend error.
    fn publish(&self, token: &CollectionVersion) -> CoreResult<()>;
}

fn check_sequence(current: Option<u64>, token: &CollectionVersion) -> CoreResult<()> {
    let expected = current.map_or(1, |v| v + 1);
    if token.version == expected {
        Ok(())
    } else {
        Err(CoreError::invalid_argument(format!(
            "collection {} expects version {expected}, got {}",
            token.collection, token.version
        )))
    }
}

/// A catalog held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tokens: RwLock<HashMap<CollectionId, CollectionVersion>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every known collection.
    #[must_use]
    pub fn collections(&self) -> Vec<CollectionId> {
        let mut ids: Vec<_> = self.tokens.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Catalog for InMemoryCatalog {
    fn current(&self, collection: CollectionId) -> CoreResult<Option<CollectionVersion>> {
        Ok(self.tokens.read().get(&collection).cloned())
    }

    fn publish(&self, token: &CollectionVersion) -> CoreResult<()> {
        let mut tokens = self.tokens.write();
        check_sequence(tokens.get(&token.collection).map(|t| t.version), token)?;
        tokens.insert(token.collection, token.clone());
        Ok(())
    }
}

/// A catalog stored in the object backend under
/// `collections/{id}/versions/{n}`. The highest version present is current.
pub struct ObjectCatalog {
    backend: Arc<dyn ObjectBackend>,
}

impl ObjectCatalog {
    /// Creates a catalog over `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Every published version of a collection, ascending.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be listed.
    pub fn history(&self, collection: CollectionId) -> CoreResult<Vec<u64>> {
        let prefix = layout::versions_prefix(collection);
        let mut versions: Vec<u64> = self
            .backend
            .list(&prefix)?
            .iter()
            .filter_map(|key| layout::parse_version_suffix(key, &prefix))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Loads one published version.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the token is missing, invalid, or names another
    /// collection or version.
    pub fn load(&self, collection: CollectionId, version: u64) -> CoreResult<CollectionVersion> {
        let key = layout::version_key(collection, version);
        let token = CollectionVersion::decode(&self.backend.get(&key)?)?;
        if token.collection != collection || token.version != version {
            return Err(CoreError::corrupt(format!(
                "{key} claims collection {} version {}",
                token.collection, token.version
            )));
        }
        Ok(token)
    }

    /// Ids of every collection with at least one published version.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be listed.
    pub fn collections(&self) -> CoreResult<Vec<CollectionId>> {
        let mut ids: Vec<CollectionId> = self
            .backend
            .list(layout::COLLECTIONS_PREFIX)?
            .iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(layout::COLLECTIONS_PREFIX)?;
                let (id, tail) = rest.split_once('/')?;
                tail.starts_with("versions/")
                    .then(|| CollectionId::parse(id).ok())
                    .flatten()
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl std::fmt::Debug for ObjectCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCatalog").finish_non_exhaustive()
    }
}

impl Catalog for ObjectCatalog {
    fn current(&self, collection: CollectionId) -> CoreResult<Option<CollectionVersion>> {
        match self.history(collection)?.last() {
            Some(&version) => self.load(collection, version).map(Some),
            None => Ok(None),
        }
    }

    fn publish(&self, token: &CollectionVersion) -> CoreResult<()> {
        check_sequence(self.history(token.collection)?.last().copied(), token)?;
        let bytes = token.encode()?;
        self.backend
            .put(&layout::version_key(token.collection, token.version), &bytes)?;
        info!(
            collection = %token.collection,
            version = token.version,
            "published collection version"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    #[test]
    fn in_memory_publish_is_sequenced() {
        let catalog = InMemoryCatalog::new();
        let collection = CollectionId::new();
        assert_eq!(catalog.current(collection).unwrap(), None);

        let mut token = CollectionVersion::initial(collection);
        catalog.publish(&token).unwrap();
        assert!(catalog.publish(&token).is_err());
        token.version = 2;
        catalog.publish(&token).unwrap();
        assert_eq!(catalog.current(collection).unwrap().unwrap().version, 2);
        assert_eq!(catalog.collections(), vec![collection]);
    }

    #[test]
    fn object_catalog_round_trip() {
        let backend = Arc::new(InMemoryBackend::new());
        let catalog = ObjectCatalog::new(backend.clone());
        let collection = CollectionId::new();

        let mut token = CollectionVersion::initial(collection);
        catalog.publish(&token).unwrap();
        token.version = 2;
        token.segments[0].blockfiles.insert("id_to_data".into(), 3);
        catalog.publish(&token).unwrap();

        assert_eq!(catalog.history(collection).unwrap(), vec![1, 2]);
        assert_eq!(catalog.current(collection).unwrap(), Some(token.clone()));
        assert_eq!(catalog.load(collection, 1).unwrap().version, 1);
        assert_eq!(catalog.collections().unwrap(), vec![collection]);

        // A fresh catalog over the same backend sees the same state.
        let reopened = ObjectCatalog::new(backend);
        assert_eq!(reopened.current(collection).unwrap(), Some(token));
    }

    #[test]
    fn misplaced_token_is_corrupt() {
        let backend = Arc::new(InMemoryBackend::new());
        let catalog = ObjectCatalog::new(backend.clone());
        let a = CollectionId::new();
        let b = CollectionId::new();
        let bytes = CollectionVersion::initial(a).encode().unwrap();
        backend.put(&layout::version_key(b, 1), &bytes).unwrap();
        assert!(matches!(catalog.current(b), Err(CoreError::Corrupt { .. })));
    }

    #[test]
    fn token_needs_every_segment_kind() {
        let mut token = CollectionVersion::initial(CollectionId::new());
        token.segments.pop();
        let bytes = token.encode().unwrap();
        assert!(CollectionVersion::decode(&bytes).is_err());
    }
}
