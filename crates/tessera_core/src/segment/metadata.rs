//! Metadata segment: typed metadata indices, full-text postings and the
//! sparse postings index.
//!
//! | blockfile    | key                     | value            |
//! |--------------|-------------------------|------------------|
//! | `string`     | `(field, Str(v))`       | `IdSet`          |
//! | `bool`       | `(field, Bool(v))`      | `IdSet`          |
//! | `f32`        | `(field, F32(v))`       | `IdSet`          |
//! | `u32`        | `(field, U32(v))`       | `IdSet`          |
//! | `fts`        | `(gram, U32(offset))`   | `Positions`      |
//! | `sparse`     | `(term, U32(offset))`   | `F32(weight)`    |
//! | `sparse_max` | `(term, U32(run))`      | `BlockMax`       |

use crate::blockfile::{BlockKey, BlockValue, BlockfileProvider, KeyPart, KeyRange, Reader};
use crate::cancel::CancellationToken;
use crate::config::{FullTextConfig, SparseConfig};
use crate::error::{CoreError, CoreResult};
use crate::segment::filter::{Where, WhereDocument};
use crate::segment::fts::{is_contiguous, NgramTokenizer, Pattern};
use crate::segment::sparse::{self, BlockfilePostings, SparseQueryResult, SPARSE, SPARSE_MAX};
use crate::segment::{Ops, PreparedSegment, SegmentFile, SegmentVersion};
use crate::types::{CollectionId, DataRecord, MaterializedRecord, Metadata, MetadataValue, OffsetId, SparseVector};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// String metadata index.
pub const STRING: &str = "string";
/// Boolean metadata index.
pub const BOOL: &str = "bool";
/// Float metadata index.
pub const F32: &str = "f32";
/// Integer metadata index.
pub const U32: &str = "u32";
/// Full-text postings.
pub const FTS: &str = "fts";

/// Pending additions and removals for one id set.
#[derive(Debug, Clone, Default)]
struct IdSetDelta {
    added: RoaringBitmap,
    removed: RoaringBitmap,
}

impl IdSetDelta {
    fn add(&mut self, id: OffsetId) {
        self.removed.remove(id);
        self.added.insert(id);
    }

    fn remove(&mut self, id: OffsetId) {
        self.added.remove(id);
        self.removed.insert(id);
    }

    fn apply(&self, mut base: RoaringBitmap) -> RoaringBitmap {
        base -= &self.removed;
        base |= &self.added;
        base
    }
}

/// One typed `(field, value) -> ids` index.
#[derive(Debug, Clone)]
struct TypedIndex {
    file: SegmentFile,
    deltas: BTreeMap<BlockKey, IdSetDelta>,
}

impl TypedIndex {
    fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: &SegmentVersion,
        name: &str,
    ) -> CoreResult<Self> {
        Ok(Self {
            file: SegmentFile::open(provider, collection, descriptor, name)?,
            deltas: BTreeMap::new(),
        })
    }

    fn get(&self, key: &BlockKey) -> CoreResult<RoaringBitmap> {
        match self.file.reader().get(key)? {
            None => Ok(RoaringBitmap::new()),
            Some(value) => id_set(self.file.name(), value),
        }
    }

    fn union(&self, range: KeyRange) -> CoreResult<RoaringBitmap> {
        let mut ids = RoaringBitmap::new();
        for entry in self.file.reader().scan(range) {
            let (_, value) = entry?;
            ids |= id_set(self.file.name(), value)?;
        }
        Ok(ids)
    }

    /// Buffered deltas merged with the committed sets. Emptied sets are deleted.
    fn ops(&self) -> CoreResult<Ops> {
        let mut ops = Ops::new();
        for (key, delta) in &self.deltas {
            let merged = delta.apply(self.get(key)?);
            let op = (!merged.is_empty()).then_some(BlockValue::IdSet(merged));
            ops.insert(key.clone(), op);
        }
        Ok(ops)
    }
}

fn id_set(blockfile: &str, value: BlockValue) -> CoreResult<RoaringBitmap> {
    match value {
        BlockValue::IdSet(ids) => Ok(ids),
        other => Err(CoreError::corrupt(format!(
            "unexpected {} value in {blockfile}",
            other.kind()
        ))),
    }
}

fn key_part(value: &MetadataValue) -> KeyPart {
    match value {
        MetadataValue::Str(v) => KeyPart::Str(v.clone()),
        MetadataValue::U32(v) => KeyPart::U32(*v),
        MetadataValue::F32(v) => KeyPart::F32(*v),
        MetadataValue::Bool(v) => KeyPart::Bool(*v),
    }
}

fn fts_entry(key: &BlockKey, value: BlockValue) -> CoreResult<(OffsetId, Vec<u32>)> {
    match (key.key.as_u32(), value) {
        (Some(offset), BlockValue::Positions(p)) => Ok((offset, p)),
        (_, other) => Err(CoreError::corrupt(format!(
            "unexpected {} value at {key} in {FTS}",
            other.kind()
        ))),
    }
}

/// Metadata, document and sparse-vector indices of a collection.
#[derive(Debug, Clone)]
pub struct MetadataSegment {
    provider: BlockfileProvider,
    descriptor: SegmentVersion,
    sparse_config: SparseConfig,
    tokenizer: NgramTokenizer,
    strings: TypedIndex,
    bools: TypedIndex,
    floats: TypedIndex,
    ints: TypedIndex,
    fts: SegmentFile,
    postings: SegmentFile,
    maxes: SegmentFile,
    fts_ops: Ops,
    sparse_ops: Ops,
    touched_terms: BTreeSet<String>,
}

impl MetadataSegment {
    /// Opens the segment at its committed descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if a manifest cannot be loaded.
    pub fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: SegmentVersion,
        full_text: FullTextConfig,
        sparse_config: SparseConfig,
    ) -> CoreResult<Self> {
        Ok(Self {
            provider: provider.clone(),
            sparse_config,
            tokenizer: NgramTokenizer::new(full_text),
            strings: TypedIndex::open(provider, collection, &descriptor, STRING)?,
            bools: TypedIndex::open(provider, collection, &descriptor, BOOL)?,
            floats: TypedIndex::open(provider, collection, &descriptor, F32)?,
            ints: TypedIndex::open(provider, collection, &descriptor, U32)?,
            fts: SegmentFile::open(provider, collection, &descriptor, FTS)?,
            postings: SegmentFile::open(provider, collection, &descriptor, SPARSE)?,
            maxes: SegmentFile::open(provider, collection, &descriptor, SPARSE_MAX)?,
            descriptor,
            fts_ops: Ops::new(),
            sparse_ops: Ops::new(),
            touched_terms: BTreeSet::new(),
        })
    }

    /// The committed descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SegmentVersion {
        &self.descriptor
    }

    /// The document n-gram tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> &NgramTokenizer {
        &self.tokenizer
    }

    fn index(&self, value: &MetadataValue) -> &TypedIndex {
        match value {
            MetadataValue::Str(_) => &self.strings,
            MetadataValue::U32(_) => &self.ints,
            MetadataValue::F32(_) => &self.floats,
            MetadataValue::Bool(_) => &self.bools,
        }
    }

    fn index_mut(&mut self, value: &MetadataValue) -> &mut TypedIndex {
        match value {
            MetadataValue::Str(_) => &mut self.strings,
            MetadataValue::U32(_) => &mut self.ints,
            MetadataValue::F32(_) => &mut self.floats,
            MetadataValue::Bool(_) => &mut self.bools,
        }
    }

    fn typed(&self) -> [&TypedIndex; 4] {
        [&self.strings, &self.bools, &self.floats, &self.ints]
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Buffers one materialized record.
    pub fn apply(&mut self, record: &MaterializedRecord) {
        let id = record.offset_id;
        let empty = Metadata::new();
        let old = record.old.as_ref();
        let new = record.new.as_ref();

        let old_meta = old.and_then(|r| r.metadata.as_ref()).unwrap_or(&empty);
        let new_meta = new.and_then(|r| r.metadata.as_ref()).unwrap_or(&empty);
        for (field, value) in old_meta {
            if new_meta.get(field) != Some(value) {
                let key = BlockKey::new(field.clone(), key_part(value));
                self.index_mut(value).deltas.entry(key).or_default().remove(id);
            }
        }
        for (field, value) in new_meta {
            if old_meta.get(field) != Some(value) {
                let key = BlockKey::new(field.clone(), key_part(value));
                self.index_mut(value).deltas.entry(key).or_default().add(id);
            }
        }

        self.apply_document(id, old, new);
        self.apply_sparse(id, old, new);
    }

    fn apply_document(&mut self, id: OffsetId, old: Option<&DataRecord>, new: Option<&DataRecord>) {
        let old = old.and_then(|r| r.document.as_deref());
        let new = new.and_then(|r| r.document.as_deref());
        if old == new {
            return;
        }
        if let Some(text) = old {
            for gram in self.tokenizer.positions(text).into_keys() {
                self.fts_ops.insert(BlockKey::u32(gram, id), None);
            }
        }
        if let Some(text) = new {
            for (gram, positions) in self.tokenizer.positions(text) {
                self.fts_ops
                    .insert(BlockKey::u32(gram, id), Some(BlockValue::Positions(positions)));
            }
        }
    }

    fn apply_sparse(&mut self, id: OffsetId, old: Option<&DataRecord>, new: Option<&DataRecord>) {
        let empty = SparseVector::new();
        let old = old.and_then(|r| r.sparse.as_ref()).unwrap_or(&empty);
        let new = new.and_then(|r| r.sparse.as_ref()).unwrap_or(&empty);
        for term in old.keys() {
            if !new.contains_key(term) {
                self.sparse_ops.insert(BlockKey::u32(term.clone(), id), None);
                self.touched_terms.insert(term.clone());
            }
        }
        for (term, &weight) in new {
            if old.get(term) != Some(&weight) {
                self.sparse_ops
                    .insert(BlockKey::u32(term.clone(), id), Some(BlockValue::F32(weight)));
                self.touched_terms.insert(term.clone());
            }
        }
    }

    /// Returns whether anything is buffered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.typed().iter().any(|index| !index.deltas.is_empty())
            || !self.fts_ops.is_empty()
            || !self.sparse_ops.is_empty()
    }

    /// Durably writes every buffered change without making it visible.
    ///
    /// Block-max summaries are recomputed for every term touched since the
    /// last flush; runs that no longer exist are deleted.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure; the buffer is left intact.
    pub fn prepare_commit(&self, cancel: &CancellationToken) -> CoreResult<PreparedSegment> {
        let mut prepared = PreparedSegment {
            descriptor: self.descriptor.clone(),
            manifests: BTreeMap::new(),
        };
        for index in self.typed() {
            index
                .file
                .commit(&self.provider, index.ops()?, cancel, &mut prepared)?;
        }
        self.fts
            .commit(&self.provider, self.fts_ops.clone(), cancel, &mut prepared)?;
        self.postings
            .commit(&self.provider, self.sparse_ops.clone(), cancel, &mut prepared)?;

        if let Some(manifest) = prepared.manifests.get(SPARSE) {
            let postings = Reader::new(
                self.provider.clone(),
                self.postings.reader().id().clone(),
                Arc::clone(manifest),
            );
            let ops = self.block_max_ops(&postings)?;
            self.maxes.commit(&self.provider, ops, cancel, &mut prepared)?;
        }
        Ok(prepared)
    }

    fn block_max_ops(&self, postings: &Reader) -> CoreResult<Ops> {
        let mut ops = Ops::new();
        for term in &self.touched_terms {
            let list = postings
                .get_prefix(term)?
                .into_iter()
                .map(|(key, value)| match (key.key.as_u32(), value.as_f32()) {
                    (Some(offset), Some(weight)) => Ok((offset, weight)),
                    _ => Err(CoreError::corrupt(format!(
                        "unexpected {} posting at {key} in {SPARSE}",
                        value.kind()
                    ))),
                })
                .collect::<CoreResult<Vec<_>>>()?;
            let runs = sparse::block_maxes(&list, self.sparse_config.postings_block_len);
            let stale = self.maxes.reader().get_prefix(term)?.len();
            debug!(term = %term, postings = list.len(), runs = runs.len(), "recomputed block maxes");
            for (index, run) in (0u32..).zip(&runs) {
                ops.insert(BlockKey::u32(term.clone(), index), Some(BlockValue::BlockMax(*run)));
            }
            for index in runs.len()..stale {
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                ops.insert(BlockKey::u32(term.clone(), index), None);
            }
        }
        Ok(ops)
    }

    /// Makes prepared state current and clears the buffer.
    pub fn install(&mut self, prepared: PreparedSegment) {
        for index in [&mut self.strings, &mut self.bools, &mut self.floats, &mut self.ints] {
            index.file.install(&self.provider, &prepared);
            index.deltas.clear();
        }
        self.fts.install(&self.provider, &prepared);
        self.postings.install(&self.provider, &prepared);
        self.maxes.install(&self.provider, &prepared);
        self.descriptor = prepared.descriptor;
        self.fts_ops.clear();
        self.sparse_ops.clear();
        self.touched_terms.clear();
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Offset ids of records matching a metadata filter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a range comparison on a non-numeric
    /// value or an empty `$and`/`$or`, and `Corrupt` or
    /// `BackendUnavailable` on read failure.
    pub fn filter(&self, filter: &Where) -> CoreResult<RoaringBitmap> {
        match filter {
            Where::Eq(field, value) => self.equal(field, value),
            Where::Ne(field, value) => Ok(self.present(field)? - self.equal(field, value)?),
            Where::Gt(field, value) => self.range(field, value, Bound::Excluded, false),
            Where::Gte(field, value) => self.range(field, value, Bound::Included, false),
            Where::Lt(field, value) => self.range(field, value, Bound::Excluded, true),
            Where::Lte(field, value) => self.range(field, value, Bound::Included, true),
            Where::In(field, values) => self.any_of(field, values),
            Where::Nin(field, values) => Ok(self.present(field)? - self.any_of(field, values)?),
            Where::And(clauses) => {
                let (first, rest) = clauses
                    .split_first()
                    .ok_or_else(|| CoreError::invalid_argument("empty $and"))?;
                let mut ids = self.filter(first)?;
                for clause in rest {
                    if ids.is_empty() {
                        break;
                    }
                    ids &= self.filter(clause)?;
                }
                Ok(ids)
            }
            Where::Or(clauses) => {
                if clauses.is_empty() {
                    return Err(CoreError::invalid_argument("empty $or"));
                }
                let mut ids = RoaringBitmap::new();
                for clause in clauses {
                    ids |= self.filter(clause)?;
                }
                Ok(ids)
            }
        }
    }

    fn equal(&self, field: &str, value: &MetadataValue) -> CoreResult<RoaringBitmap> {
        self.index(value)
            .get(&BlockKey::new(field, key_part(value)))
    }

    fn any_of(&self, field: &str, values: &[MetadataValue]) -> CoreResult<RoaringBitmap> {
        let mut ids = RoaringBitmap::new();
        for value in values {
            ids |= self.equal(field, value)?;
        }
        Ok(ids)
    }

    /// Records where `field` is set, with a value of any type.
    fn present(&self, field: &str) -> CoreResult<RoaringBitmap> {
        let mut ids = RoaringBitmap::new();
        for index in self.typed() {
            ids |= index.union(KeyRange::prefix(field))?;
        }
        Ok(ids)
    }

    fn range(
        &self,
        field: &str,
        value: &MetadataValue,
        bound: fn(KeyPart) -> Bound<KeyPart>,
        below: bool,
    ) -> CoreResult<RoaringBitmap> {
        if !matches!(value, MetadataValue::U32(_) | MetadataValue::F32(_)) {
            return Err(CoreError::invalid_argument(format!(
                "range comparison on {} field {field:?}",
                value.type_name()
            )));
        }
        let pivot = bound(key_part(value));
        let range = if below {
            KeyRange::within_prefix(field, Bound::Unbounded, pivot)
        } else {
            KeyRange::within_prefix(field, pivot, Bound::Unbounded)
        };
        self.index(value).union(range)
    }

    /// Offset ids of records matching a document filter. `live` is the set
    /// `$not_contains` is complemented against.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty `$and`/`$or`, and `Corrupt` or
    /// `BackendUnavailable` on read failure.
    pub fn filter_document(&self, filter: &WhereDocument, live: &RoaringBitmap) -> CoreResult<RoaringBitmap> {
        match filter {
            WhereDocument::Contains(text) => self.contains(text, live),
            WhereDocument::NotContains(text) => Ok(live - self.contains(text, live)?),
            WhereDocument::And(clauses) => {
                let (first, rest) = clauses
                    .split_first()
                    .ok_or_else(|| CoreError::invalid_argument("empty $and"))?;
                let mut ids = self.filter_document(first, live)?;
                for clause in rest {
                    ids &= self.filter_document(clause, live)?;
                }
                Ok(ids)
            }
            WhereDocument::Or(clauses) => {
                if clauses.is_empty() {
                    return Err(CoreError::invalid_argument("empty $or"));
                }
                let mut ids = RoaringBitmap::new();
                for clause in clauses {
                    ids |= self.filter_document(clause, live)?;
                }
                Ok(ids)
            }
        }
    }

    /// Records whose document contains `pattern` as a substring. Matching
    /// is case sensitive; an empty pattern matches every live record.
    fn contains(&self, pattern: &str, live: &RoaringBitmap) -> CoreResult<RoaringBitmap> {
        let grams = match self.tokenizer.pattern(pattern) {
            Pattern::Empty => return Ok(live.clone()),
            Pattern::Prefix(prefix) => return self.gram_prefix(&prefix),
            Pattern::Grams(grams) => grams,
        };

        let mut postings: BTreeMap<&str, BTreeMap<OffsetId, Vec<u32>>> = BTreeMap::new();
        let mut candidates: Option<RoaringBitmap> = None;
        for gram in &grams {
            if postings.contains_key(gram.as_str()) {
                continue;
            }
            let mut docs = BTreeMap::new();
            for (key, value) in self.fts.reader().get_prefix(gram)? {
                let (offset, positions) = fts_entry(&key, value)?;
                docs.insert(offset, positions);
            }
            let ids: RoaringBitmap = docs.keys().copied().collect();
            let narrowed = match candidates.take() {
                Some(c) => c & ids,
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(RoaringBitmap::new());
            }
            candidates = Some(narrowed);
            postings.insert(gram.as_str(), docs);
        }

        let mut matched = RoaringBitmap::new();
        for offset in candidates.unwrap_or_default().iter() {
            let lists: Vec<&[u32]> = grams
                .iter()
                .filter_map(|g| postings.get(g.as_str()).and_then(|d| d.get(&offset)))
                .map(Vec::as_slice)
                .collect();
            if lists.len() == grams.len() && is_contiguous(&lists) {
                matched.insert(offset);
            }
        }
        Ok(matched)
    }

    /// Records with a gram starting with `prefix`. Grams sharing a prefix
    /// sort together, so the scan stops at the first gram that does not.
    fn gram_prefix(&self, prefix: &str) -> CoreResult<RoaringBitmap> {
        let range = KeyRange::new(Bound::Included(BlockKey::new(prefix, KeyPart::MIN)), Bound::Unbounded);
        let mut ids = RoaringBitmap::new();
        for entry in self.fts.reader().scan(range) {
            let (key, value) = entry?;
            if !key.prefix.starts_with(prefix) {
                break;
            }
            ids.insert(fts_entry(&key, value)?.0);
        }
        Ok(ids)
    }

    fn sparse_source(&self) -> BlockfilePostings<'_> {
        BlockfilePostings {
            postings: self.postings.reader(),
            maxes: self.maxes.reader(),
        }
    }

    /// Top-k records by sparse dot product, pruned with block maxes.
    ///
    /// # Errors
    ///
    /// See [`sparse::top_k`].
    pub fn sparse_query(
        &self,
        query: &SparseVector,
        k: usize,
        allowed: Option<&RoaringBitmap>,
    ) -> CoreResult<SparseQueryResult> {
        sparse::top_k(&self.sparse_source(), query, k, allowed)
    }

    /// Top-k records by sparse dot product, scoring every posting.
    ///
    /// # Errors
    ///
    /// See [`sparse::top_k`].
    pub fn sparse_query_exhaustive(
        &self,
        query: &SparseVector,
        k: usize,
        allowed: Option<&RoaringBitmap>,
    ) -> CoreResult<SparseQueryResult> {
        sparse::exhaustive_top_k(&self.sparse_source(), query, k, allowed)
    }
}
