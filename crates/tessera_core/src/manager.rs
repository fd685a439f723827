//! Per-collection segment coordination.
//!
//! The [`SegmentManager`] owns one segment of each kind for a collection.
//! `apply` resolves each operation against buffered and committed state and
//! buffers the result in every segment. `flush` commits every segment with
//! buffered data and then publishes a single [`CollectionVersion`]; the new
//! manifests only become current once that publish succeeds.

use crate::blockfile::BlockfileProvider;
use crate::cancel::CancellationToken;
use crate::catalog::{Catalog, CollectionVersion};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::segment::filter::{Where, WhereDocument};
use crate::segment::sparse::SparseQueryStats;
use crate::segment::{MetadataSegment, RecordSegment, Segment, VectorSegment};
use crate::types::{CollectionId, DataRecord, MaterializedRecord, MetadataValue, OffsetId, SegmentKind, SparseVector};
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kind of a record mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Insert a new record. Skipped if the id exists.
    Add,
    /// Modify an existing record. Skipped if the id is missing.
    Update,
    /// Insert or modify.
    Upsert,
    /// Remove a record. A missing id is a no-op.
    Delete,
}

/// One record mutation.
///
/// Fields left `None` keep their current value on update. Metadata keys
/// mapped to `None` are removed.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    /// User-facing id.
    pub id: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Dense embedding.
    pub embedding: Option<Vec<f32>>,
    /// Document text.
    pub document: Option<String>,
    /// Metadata changes.
    pub metadata: Option<BTreeMap<String, Option<MetadataValue>>>,
    /// Sparse vector.
    pub sparse: Option<SparseVector>,
}

impl OperationRecord {
    /// Creates an operation with no field changes.
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
            embedding: None,
            document: None,
            metadata: None,
            sparse: None,
        }
    }

    /// An add.
    pub fn add(id: impl Into<String>) -> Self {
        Self::new(id, Operation::Add)
    }

    /// An update.
    pub fn update(id: impl Into<String>) -> Self {
        Self::new(id, Operation::Update)
    }

    /// An upsert.
    pub fn upsert(id: impl Into<String>) -> Self {
        Self::new(id, Operation::Upsert)
    }

    /// A delete.
    pub fn delete(id: impl Into<String>) -> Self {
        Self::new(id, Operation::Delete)
    }

    /// Sets the embedding.
    #[must_use]
    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Sets the document.
    #[must_use]
    pub fn document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Sets one metadata field.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), Some(value.into()));
        self
    }

    /// Removes one metadata field.
    #[must_use]
    pub fn remove_metadata(mut self, key: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), None);
        self
    }

    /// Sets the sparse vector.
    #[must_use]
    pub fn sparse(mut self, sparse: SparseVector) -> Self {
        self.sparse = Some(sparse);
        self
    }

    /// Applies this operation's fields on top of `base`.
    fn merge_into(&self, mut base: DataRecord) -> DataRecord {
        if let Some(embedding) = &self.embedding {
            base.embedding = Some(embedding.clone());
        }
        if let Some(document) = &self.document {
            base.document = Some(document.clone());
        }
        if let Some(sparse) = &self.sparse {
            base.sparse = Some(sparse.clone());
        }
        if let Some(changes) = &self.metadata {
            let mut metadata = base.metadata.take().unwrap_or_default();
            for (key, value) in changes {
                match value {
                    Some(value) => {
                        metadata.insert(key.clone(), value.clone());
                    }
                    None => {
                        metadata.remove(key);
                    }
                }
            }
            base.metadata = (!metadata.is_empty()).then_some(metadata);
        }
        base
    }
}

/// Restricts reads to a subset of records. Unset parts do not restrict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Only these user ids.
    pub ids: Option<Vec<String>>,
    /// Metadata filter.
    pub where_metadata: Option<Where>,
    /// Document filter.
    pub where_document: Option<WhereDocument>,
}

impl Filter {
    /// A filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to these ids.
    #[must_use]
    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the metadata filter.
    #[must_use]
    pub fn where_metadata(mut self, filter: Where) -> Self {
        self.where_metadata = Some(filter);
        self
    }

    /// Sets the document filter.
    #[must_use]
    pub fn where_document(mut self, filter: WhereDocument) -> Self {
        self.where_document = Some(filter);
        self
    }

    fn is_empty(&self) -> bool {
        self.ids.is_none() && self.where_metadata.is_none() && self.where_document.is_none()
    }
}

/// A record lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetRequest {
    /// Which records.
    pub filter: Filter,
    /// At most this many records.
    pub limit: Option<usize>,
    /// Skip this many matching records first.
    pub offset: usize,
}

impl GetRequest {
    /// Every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// A nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Query vector.
    pub embedding: Vec<f32>,
    /// Number of results.
    pub k: usize,
    /// Candidate restriction.
    pub filter: Filter,
}

impl QueryRequest {
    /// The `k` nearest records to `embedding`.
    #[must_use]
    pub fn new(embedding: Vec<f32>, k: usize) -> Self {
        Self {
            embedding,
            k,
            filter: Filter::default(),
        }
    }

    /// Sets the filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

/// A record with a query score: distance for dense queries (smaller is
/// closer), dot product for sparse queries (larger is better).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    /// The record.
    pub record: DataRecord,
    /// Its score.
    pub score: f32,
}

/// Result of a sparse query.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseHits {
    /// Best first.
    pub hits: Vec<ScoredRecord>,
    /// Work done by the pruned search.
    pub stats: SparseQueryStats,
}

/// Coordinates the segments of one collection.
pub struct SegmentManager {
    collection: CollectionId,
    provider: BlockfileProvider,
    catalog: Arc<dyn Catalog>,
    config: Config,
    version: CollectionVersion,
    segments: Vec<Segment>,
}

impl SegmentManager {
    /// Creates a collection and publishes its initial, empty version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration is invalid or the
    /// collection already exists, or a backend error.
    pub fn create(
        collection: CollectionId,
        provider: BlockfileProvider,
        catalog: Arc<dyn Catalog>,
        config: Config,
    ) -> CoreResult<Self> {
        config.validate()?;
        if catalog.current(collection)?.is_some() {
            return Err(CoreError::invalid_argument(format!(
                "collection {collection} already exists"
            )));
        }
        let token = CollectionVersion::initial(collection);
        catalog.publish(&token)?;
        info!(collection = %collection, "created collection");
        Self::open_at(provider, catalog, config, token)
    }

    /// Opens a collection at its published version.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if nothing is published, or `Corrupt` /
    /// `BackendUnavailable` if a segment cannot be opened.
    pub fn open(
        collection: CollectionId,
        provider: BlockfileProvider,
        catalog: Arc<dyn Catalog>,
        config: Config,
    ) -> CoreResult<Self> {
        config.validate()?;
        let token = catalog
            .current(collection)?
            .ok_or_else(|| CoreError::collection_not_found(collection))?;
        Self::open_at(provider, catalog, config, token)
    }

    fn open_at(
        provider: BlockfileProvider,
        catalog: Arc<dyn Catalog>,
        config: Config,
        token: CollectionVersion,
    ) -> CoreResult<Self> {
        let collection = token.collection;
        let mut segments = Vec::with_capacity(SegmentKind::ALL.len());
        for kind in SegmentKind::ALL {
            let descriptor = token.segment(kind).cloned().ok_or_else(|| {
                CoreError::corrupt(format!("collection {collection} has no {kind} segment"))
            })?;
            segments.push(Segment::open(&provider, collection, descriptor, &config)?);
        }
        debug!(collection = %collection, version = token.version, "opened collection");
        Ok(Self {
            collection,
            provider,
            catalog,
            config,
            version: token,
            segments,
        })
    }

    /// Collection id.
    #[must_use]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// The published version this manager reads from.
    #[must_use]
    pub fn version(&self) -> &CollectionVersion {
        &self.version
    }

    /// The blockfile provider.
    #[must_use]
    pub fn provider(&self) -> &BlockfileProvider {
        &self.provider
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns whether any segment has unflushed changes.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.segments.iter().any(Segment::has_pending)
    }

    fn record(&self) -> CoreResult<&RecordSegment> {
        self.segments
            .iter()
            .find_map(|s| match s {
                Segment::Record(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| CoreError::corrupt("record segment is not open"))
    }

    fn record_mut(&mut self) -> CoreResult<&mut RecordSegment> {
        self.segments
            .iter_mut()
            .find_map(|s| match s {
                Segment::Record(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| CoreError::corrupt("record segment is not open"))
    }

    fn metadata(&self) -> CoreResult<&MetadataSegment> {
        self.segments
            .iter()
            .find_map(|s| match s {
                Segment::Metadata(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| CoreError::corrupt("metadata segment is not open"))
    }

    fn vector(&self) -> CoreResult<&VectorSegment> {
        self.segments
            .iter()
            .find_map(|s| match s {
                Segment::Vector(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| CoreError::corrupt("vector segment is not open"))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Checks a batch before any of it is buffered.
    fn validate(&self, batch: &[OperationRecord]) -> CoreResult<()> {
        let mut dimension = self.vector()?.dimension();
        for op in batch {
            if op.id.is_empty() {
                return Err(CoreError::invalid_argument("empty record id"));
            }
            if let Some(embedding) = &op.embedding {
                let len = u32::try_from(embedding.len()).unwrap_or(u32::MAX);
                match dimension {
                    _ if embedding.is_empty() => {
                        return Err(CoreError::invalid_argument(format!("record {:?} has an empty embedding", op.id)))
                    }
                    Some(d) if d != len => {
                        return Err(CoreError::invalid_argument(format!(
                            "record {:?} has dimension {len}, collection has {d}",
                            op.id
                        )))
                    }
                    _ => dimension = Some(len),
                }
                if embedding.iter().any(|x| !x.is_finite()) {
                    return Err(CoreError::invalid_argument(format!("record {:?} has a non-finite embedding", op.id)));
                }
            }
            if let Some(sparse) = &op.sparse {
                if sparse.values().any(|w| !w.is_finite()) {
                    return Err(CoreError::invalid_argument(format!("record {:?} has a non-finite sparse weight", op.id)));
                }
            }
        }
        Ok(())
    }

    /// Resolves one operation against buffered and committed state.
    fn materialize(&mut self, op: &OperationRecord) -> CoreResult<Option<MaterializedRecord>> {
        let record = self.record()?;
        let existing = match record.working_offset_id(&op.id)? {
            Some(offset_id) => {
                let data = record.working_data(offset_id)?.ok_or_else(|| {
                    CoreError::corrupt(format!("record {:?} maps to missing offset {offset_id}", op.id))
                })?;
                Some((offset_id, data))
            }
            None => None,
        };

        let materialized = match (op.operation, existing) {
            (Operation::Add, Some(_)) => {
                warn!(id = %op.id, "skipping add of existing record");
                None
            }
            (Operation::Update, None) => {
                debug!(id = %op.id, "skipping update of missing record");
                None
            }
            (Operation::Delete, None) => None,
            (Operation::Add | Operation::Upsert, None) => {
                let offset_id = self.record_mut()?.allocate_offset_id()?;
                Some(MaterializedRecord {
                    offset_id,
                    old: None,
                    new: Some(op.merge_into(DataRecord::new(op.id.clone()))),
                })
            }
            (Operation::Update | Operation::Upsert, Some((offset_id, old))) => Some(MaterializedRecord {
                offset_id,
                new: Some(op.merge_into(old.clone())),
                old: Some(old),
            }),
            (Operation::Delete, Some((offset_id, old))) => Some(MaterializedRecord {
                offset_id,
                old: Some(old),
                new: None,
            }),
        };
        Ok(materialized)
    }

    /// Runs `f` against the segment buffers and restores them if it fails.
    fn rollback_on_error<T>(&mut self, f: impl FnOnce(&mut Self) -> CoreResult<T>) -> CoreResult<T> {
        let snapshot = self.segments.clone();
        let result = f(self);
        if let Err(err) = &result {
            warn!(collection = %self.collection, error = %err, "batch rolled back");
            self.segments = snapshot;
        }
        result
    }

    /// Buffers a batch of operations. Nothing is visible until [`Self::flush`].
    ///
    /// The batch is all or nothing: if any operation fails, every buffer and
    /// the offset id counter are left as they were before the call.
    ///
    /// Returns the number of operations that changed buffered state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if any operation is malformed, or a read
    /// error from committed state.
    pub fn apply(&mut self, batch: &[OperationRecord]) -> CoreResult<usize> {
        self.validate(batch)?;
        let applied = self.rollback_on_error(|manager| {
            let mut applied = 0;
            for op in batch {
                let Some(materialized) = manager.materialize(op)? else {
                    continue;
                };
                for segment in &mut manager.segments {
                    segment.apply(&materialized)?;
                }
                applied += 1;
            }
            Ok(applied)
        })?;
        debug!(collection = %self.collection, ops = batch.len(), applied, "applied batch");
        Ok(applied)
    }

    /// Buffers a delete of every record matching `filter`.
    ///
    /// Explicit ids are resolved like [`Operation::Delete`], so records that
    /// are only buffered are deleted too. Metadata and document filters are
    /// evaluated against flushed state. Returns the number of records
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty or malformed filter, or a read
    /// error, in which case nothing is buffered.
    pub fn delete(&mut self, filter: &Filter) -> CoreResult<usize> {
        if filter.is_empty() {
            return Err(CoreError::invalid_argument("delete needs ids or a filter"));
        }
        let ids = if filter.where_metadata.is_none() && filter.where_document.is_none() {
            filter.ids.clone().unwrap_or_default()
        } else {
            let record = self.record()?;
            let mut ids = Vec::new();
            for offset_id in self.allowed(filter)?.unwrap_or_default() {
                let id = record
                    .get_user_id(offset_id)?
                    .ok_or_else(|| CoreError::corrupt(format!("index refers to missing record {offset_id}")))?;
                ids.push(id);
            }
            ids
        };
        let batch: Vec<OperationRecord> = ids.into_iter().map(OperationRecord::delete).collect();
        let deleted = self.apply(&batch)?;
        info!(collection = %self.collection, deleted, "buffered filtered delete");
        Ok(deleted)
    }

    /// Commits every segment with buffered changes and publishes the new
    /// collection version.
    ///
    /// Cancellation is honoured until the last segment's blocks are written.
    /// On any failure the published version and every buffer are unchanged,
    /// so the flush can be retried.
    ///
    /// # Errors
    ///
    /// Returns the first segment commit or publish failure.
    pub fn flush(&mut self, cancel: &CancellationToken) -> CoreResult<CollectionVersion> {
        cancel.check()?;
        if !self.has_pending() {
            return Ok(self.version.clone());
        }

        let mut prepared = Vec::new();
        for (index, segment) in self.segments.iter().enumerate() {
            if !segment.has_pending() {
                continue;
            }
            match segment.prepare_commit(cancel) {
                Ok(p) => prepared.push((index, p)),
                Err(err) => {
                    warn!(collection = %self.collection, segment = %segment.kind(), error = %err, "flush aborted");
                    return Err(err);
                }
            }
        }

        let mut token = self.version.clone();
        token.version += 1;
        for (_, p) in &prepared {
            if let Some(slot) = token.segments.iter_mut().find(|s| s.kind == p.descriptor.kind) {
                *slot = p.descriptor.clone();
            }
        }
        if let Err(err) = self.catalog.publish(&token) {
            warn!(collection = %self.collection, version = token.version, error = %err, "publish failed");
            return Err(err);
        }

        for (index, p) in prepared {
            if let Some(segment) = self.segments.get_mut(index) {
                segment.install(p);
            }
        }
        self.version = token.clone();
        info!(collection = %self.collection, version = token.version, "flushed collection");
        Ok(token)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Offset ids allowed by `filter`, or `None` if it does not restrict.
    fn allowed(&self, filter: &Filter) -> CoreResult<Option<RoaringBitmap>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let record = self.record()?;
        let mut allowed: Option<RoaringBitmap> = None;
        let mut narrow = |ids: RoaringBitmap| {
            allowed = Some(match allowed.take() {
                Some(current) => current & ids,
                None => ids,
            });
        };
        if let Some(ids) = &filter.ids {
            let mut set = RoaringBitmap::new();
            for id in ids {
                if let Some(offset_id) = record.get_offset_id(id)? {
                    set.insert(offset_id);
                }
            }
            narrow(set);
        }
        if let Some(filter) = &filter.where_metadata {
            narrow(self.metadata()?.filter(filter)?);
        }
        if let Some(filter) = &filter.where_document {
            let live = record.all_offset_ids()?;
            narrow(self.metadata()?.filter_document(filter, &live)?);
        }
        Ok(allowed)
    }

    fn load(&self, offset_id: OffsetId) -> CoreResult<DataRecord> {
        self.record()?
            .get_data(offset_id)?
            .ok_or_else(|| CoreError::corrupt(format!("index refers to missing record {offset_id}")))
    }

    /// Records matching a request, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed filter, or a read error.
    pub fn get(&self, request: &GetRequest) -> CoreResult<Vec<DataRecord>> {
        let Some(allowed) = self.allowed(&request.filter)? else {
            return Ok(self
                .record()?
                .scan_records(request.limit, request.offset)?
                .into_iter()
                .map(|(_, record)| record)
                .collect());
        };
        allowed
            .iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .map(|offset_id| self.load(offset_id))
            .collect()
    }

    /// The `k` records nearest to the query embedding, closest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `k == 0`, a dimension mismatch or a
    /// malformed filter, or a read error.
    pub fn query_vectors(&self, request: &QueryRequest) -> CoreResult<Vec<ScoredRecord>> {
        let allowed = self.allowed(&request.filter)?;
        self.vector()?
            .query(&request.embedding, request.k, allowed.as_ref())?
            .into_iter()
            .map(|(offset_id, score)| {
                Ok(ScoredRecord {
                    record: self.load(offset_id)?,
                    score,
                })
            })
            .collect()
    }

    /// The `k` records with the highest sparse dot product.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `k == 0`, a non-finite weight or a
    /// malformed filter, or a read error.
    pub fn query_sparse(&self, query: &SparseVector, k: usize, filter: &Filter) -> CoreResult<SparseHits> {
        let allowed = self.allowed(filter)?;
        let result = self.metadata()?.sparse_query(query, k, allowed.as_ref())?;
        let hits = result
            .hits
            .into_iter()
            .map(|(offset_id, score)| {
                Ok(ScoredRecord {
                    record: self.load(offset_id)?,
                    score,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(SparseHits {
            hits,
            stats: result.stats,
        })
    }

    /// Number of committed records.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the record segment is missing.
    pub fn count(&self) -> CoreResult<u64> {
        Ok(self.record()?.count())
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("collection", &self.collection)
            .field("version", &self.version.version)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::catalog::InMemoryCatalog;
    use crate::config::{BlockfileConfig, CacheConfig};
    use tessera_storage::{FaultyBackend, InMemoryBackend, ObjectBackend};

    struct Fixture {
        backend: Arc<FaultyBackend<InMemoryBackend>>,
        catalog: Arc<InMemoryCatalog>,
        manager: SegmentManager,
    }

    fn provider(backend: Arc<dyn ObjectBackend>) -> BlockfileProvider {
        BlockfileProvider::new(
            backend,
            Arc::new(BlockCache::new(CacheConfig::default())),
            BlockfileConfig::default(),
        )
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FaultyBackend::new(InMemoryBackend::new()));
        let catalog = Arc::new(InMemoryCatalog::new());
        let manager = SegmentManager::create(
            CollectionId::new(),
            provider(backend.clone()),
            catalog.clone(),
            Config::default(),
        )
        .unwrap();
        Fixture {
            backend,
            catalog,
            manager,
        }
    }

    fn seed(manager: &mut SegmentManager) {
        manager
            .apply(&[
                OperationRecord::add("a")
                    .embedding(vec![0.0, 0.0])
                    .document("red apple pie")
                    .metadata("kind", "fruit")
                    .metadata("n", 1u32)
                    .sparse([("apple".to_string(), 1.0)].into()),
                OperationRecord::add("b")
                    .embedding(vec![1.0, 0.0])
                    .document("green apple")
                    .metadata("kind", "fruit")
                    .metadata("n", 2u32)
                    .sparse([("apple".to_string(), 0.5), ("green".to_string(), 1.0)].into()),
                OperationRecord::add("c")
                    .embedding(vec![5.0, 5.0])
                    .document("carrot cake")
                    .metadata("kind", "veg")
                    .sparse([("carrot".to_string(), 2.0)].into()),
            ])
            .unwrap();
        manager.flush(&CancellationToken::new()).unwrap();
    }

    fn ids(records: &[DataRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn writes_are_invisible_until_flush() {
        let mut f = fixture();
        f.manager
            .apply(&[OperationRecord::add("a").document("hello")])
            .unwrap();
        assert_eq!(f.manager.count().unwrap(), 0);
        assert!(f.manager.has_pending());

        let token = f.manager.flush(&CancellationToken::new()).unwrap();
        assert_eq!(token.version, 2);
        assert_eq!(f.manager.count().unwrap(), 1);
        assert_eq!(f.catalog.current(f.manager.collection()).unwrap(), Some(token.clone()));
        // Nothing pending: flush is a no-op.
        assert_eq!(f.manager.flush(&CancellationToken::new()).unwrap(), token);
    }

    #[test]
    fn operation_semantics() {
        let mut f = fixture();
        seed(&mut f.manager);
        let applied = f
            .manager
            .apply(&[
                OperationRecord::add("a").document("ignored"),
                OperationRecord::update("missing").document("ignored"),
                OperationRecord::delete("missing"),
                OperationRecord::update("b").remove_metadata("n").metadata("ripe", true),
                OperationRecord::upsert("d").document("new"),
                OperationRecord::delete("c"),
            ])
            .unwrap();
        assert_eq!(applied, 3);
        f.manager.flush(&CancellationToken::new()).unwrap();

        let all = f.manager.get(&GetRequest::new()).unwrap();
        assert_eq!(ids(&all), vec!["a", "b", "d"]);
        assert_eq!(all[0].document.as_deref(), Some("red apple pie"));
        let b = &all[1];
        assert_eq!(b.metadata_value("n"), None);
        assert_eq!(b.metadata_value("ripe"), Some(&MetadataValue::Bool(true)));
        assert_eq!(b.document.as_deref(), Some("green apple"));
    }

    #[test]
    fn filtered_get_with_paging() {
        let mut f = fixture();
        seed(&mut f.manager);
        let fruit = Filter::new().where_metadata(Where::eq("kind", "fruit"));
        let got = f.manager.get(&GetRequest::new().filter(fruit.clone())).unwrap();
        assert_eq!(ids(&got), vec!["a", "b"]);
        let got = f.manager.get(&GetRequest::new().filter(fruit).offset(1).limit(5)).unwrap();
        assert_eq!(ids(&got), vec!["b"]);

        let apple = Filter::new().where_document(WhereDocument::contains("apple"));
        let got = f.manager.get(&GetRequest::new().filter(apple.ids(["b", "c", "zzz"]))).unwrap();
        assert_eq!(ids(&got), vec!["b"]);

        let got = f.manager.get(&GetRequest::new().limit(2)).unwrap();
        assert_eq!(ids(&got), vec!["a", "b"]);
    }

    #[test]
    fn dense_and_sparse_queries() {
        let mut f = fixture();
        seed(&mut f.manager);
        let hits = f
            .manager
            .query_vectors(&QueryRequest::new(vec![0.9, 0.1], 2))
            .unwrap();
        assert_eq!(hits[0].record.id, "b");
        assert_eq!(hits[1].record.id, "a");

        let filtered = f
            .manager
            .query_vectors(&QueryRequest::new(vec![0.9, 0.1], 2).filter(Filter::new().ids(["c"])))
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].record.id, "c");

        let query: SparseVector = [("apple".to_string(), 1.0), ("green".to_string(), 1.0)].into();
        let sparse = f.manager.query_sparse(&query, 5, &Filter::new()).unwrap();
        let got: Vec<(&str, f32)> = sparse.hits.iter().map(|h| (h.record.id.as_str(), h.score)).collect();
        assert_eq!(got, vec![("b", 1.5), ("a", 1.0)]);
    }

    #[test]
    fn invalid_batches_buffer_nothing() {
        let mut f = fixture();
        seed(&mut f.manager);
        let err = f
            .manager
            .apply(&[
                OperationRecord::add("x").embedding(vec![1.0, 1.0]),
                OperationRecord::add("y").embedding(vec![1.0, 1.0, 1.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert!(!f.manager.has_pending());

        let nan: SparseVector = [("t".to_string(), f32::NAN)].into();
        assert!(f.manager.apply(&[OperationRecord::add("z").sparse(nan)]).is_err());
    }

    #[test]
    fn failed_apply_buffers_nothing_and_can_be_retried() {
        let mut f = fixture();
        seed(&mut f.manager);
        // A one-block cache, so the graph block is evicted once the id
        // mapping is read.
        let cold = BlockfileProvider::new(
            f.backend.clone(),
            Arc::new(BlockCache::new(CacheConfig::new().capacity_entries(1))),
            BlockfileConfig::default(),
        );
        let mut manager =
            SegmentManager::open(f.manager.collection(), cold, f.catalog.clone(), Config::default()).unwrap();
        assert_eq!(manager.record().unwrap().get_offset_id("a").unwrap(), Some(0));

        let batch = [
            OperationRecord::add("early").document("no vector, no graph read"),
            OperationRecord::add("new").embedding(vec![1.0, 1.0]),
        ];
        f.backend.set_unavailable(true);
        let err = manager.apply(&batch).unwrap_err();
        assert!(matches!(err, CoreError::BackendUnavailable { .. }));
        assert!(!manager.has_pending());

        f.backend.set_unavailable(false);
        assert_eq!(manager.apply(&batch).unwrap(), 2);
        manager.flush(&CancellationToken::new()).unwrap();
        let early = manager.get(&GetRequest::new().filter(Filter::new().ids(["early"]))).unwrap();
        assert_eq!(early[0].document.as_deref(), Some("no vector, no graph read"));
        let hits = manager
            .query_vectors(&QueryRequest::new(vec![1.0, 1.0], 1).filter(Filter::new().ids(["new"])))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "new");
        assert_eq!(manager.record().unwrap().get_offset_id("new").unwrap(), Some(4));
    }

    #[test]
    fn delete_by_filter() {
        let mut f = fixture();
        seed(&mut f.manager);
        let fruit = Filter::new().where_metadata(Where::eq("kind", "fruit"));
        assert_eq!(f.manager.delete(&fruit).unwrap(), 2);
        assert_eq!(f.manager.count().unwrap(), 3);
        f.manager.flush(&CancellationToken::new()).unwrap();
        assert_eq!(ids(&f.manager.get(&GetRequest::new()).unwrap()), vec!["c"]);
        assert_eq!(f.manager.delete(&fruit).unwrap(), 0);

        // Ids also reach records that are only buffered.
        f.manager.apply(&[OperationRecord::add("d"), OperationRecord::add("e")]).unwrap();
        assert_eq!(f.manager.delete(&Filter::new().ids(["d", "missing"])).unwrap(), 1);
        f.manager.flush(&CancellationToken::new()).unwrap();
        assert_eq!(ids(&f.manager.get(&GetRequest::new()).unwrap()), vec!["c", "e"]);

        let carrot = Filter::new().where_document(WhereDocument::contains("carrot"));
        assert_eq!(f.manager.delete(&carrot.ids(["c", "e"])).unwrap(), 1);
        f.manager.flush(&CancellationToken::new()).unwrap();
        assert_eq!(ids(&f.manager.get(&GetRequest::new()).unwrap()), vec!["e"]);

        assert!(matches!(
            f.manager.delete(&Filter::new()),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn failed_delete_buffers_nothing() {
        let mut f = fixture();
        seed(&mut f.manager);
        let mut manager = SegmentManager::open(
            f.manager.collection(),
            provider(f.backend.clone()),
            f.catalog.clone(),
            Config::default(),
        )
        .unwrap();
        f.backend.set_unavailable(true);
        let fruit = Filter::new().where_metadata(Where::eq("kind", "fruit"));
        assert!(manager.delete(&fruit).unwrap_err().is_retryable());
        assert!(!manager.has_pending());

        f.backend.set_unavailable(false);
        assert_eq!(manager.delete(&fruit).unwrap(), 2);
    }

    #[test]
    fn failed_flush_keeps_buffer_and_published_version() {
        let mut f = fixture();
        seed(&mut f.manager);
        let before = f.manager.version().clone();

        f.manager
            .apply(&[OperationRecord::upsert("a").document("changed").metadata("n", 9u32)])
            .unwrap();
        f.backend.fail_puts_containing(Some("/segments/metadata/"));
        assert!(f.manager.flush(&CancellationToken::new()).is_err());
        assert_eq!(f.manager.version(), &before);
        assert_eq!(f.catalog.current(before.collection).unwrap(), Some(before.clone()));
        assert!(f.manager.has_pending());
        assert_eq!(
            f.manager.get(&GetRequest::new().filter(Filter::new().ids(["a"]))).unwrap()[0]
                .document
                .as_deref(),
            Some("red apple pie")
        );

        f.backend.fail_puts_containing(None);
        let token = f.manager.flush(&CancellationToken::new()).unwrap();
        assert_eq!(token.version, before.version + 1);
        let a = f.manager.get(&GetRequest::new().filter(Filter::new().ids(["a"]))).unwrap();
        assert_eq!(a[0].document.as_deref(), Some("changed"));
        let nine = Filter::new().where_metadata(Where::eq("n", 9u32));
        assert_eq!(ids(&f.manager.get(&GetRequest::new().filter(nine)).unwrap()), vec!["a"]);
    }

    #[test]
    fn cancelled_flush_publishes_nothing() {
        let mut f = fixture();
        f.manager.apply(&[OperationRecord::add("a")]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(f.manager.flush(&cancel).unwrap_err(), CoreError::Cancelled);
        assert_eq!(f.manager.version().version, 1);
        assert_eq!(f.backend.total_puts(), 0);
    }

    #[test]
    fn reopen_sees_published_state() {
        let mut f = fixture();
        seed(&mut f.manager);
        let reopened = SegmentManager::open(
            f.manager.collection(),
            provider(f.backend.clone()),
            f.catalog.clone(),
            Config::default(),
        )
        .unwrap();
        assert_eq!(reopened.version(), f.manager.version());
        assert_eq!(reopened.count().unwrap(), 3);
        let hits = reopened.query_vectors(&QueryRequest::new(vec![5.0, 5.0], 1)).unwrap();
        assert_eq!(hits[0].record.id, "c");

        assert!(matches!(
            SegmentManager::open(CollectionId::new(), provider(f.backend.clone()), f.catalog.clone(), Config::default()),
            Err(CoreError::CollectionNotFound { .. })
        ));
        assert!(SegmentManager::create(
            f.manager.collection(),
            provider(f.backend.clone()),
            f.catalog.clone(),
            Config::default()
        )
        .is_err());
    }

    #[test]
    fn offset_ids_survive_reopen() {
        let mut f = fixture();
        seed(&mut f.manager);
        let mut reopened = SegmentManager::open(
            f.manager.collection(),
            provider(f.backend.clone()),
            f.catalog.clone(),
            Config::default(),
        )
        .unwrap();
        reopened.apply(&[OperationRecord::add("d")]).unwrap();
        reopened.flush(&CancellationToken::new()).unwrap();
        let record = reopened.record().unwrap();
        assert_eq!(record.get_offset_id("d").unwrap(), Some(3));
    }
}
