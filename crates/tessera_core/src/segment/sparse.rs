//! Sparse postings index with block-max pruned top-k retrieval.
//!
//! Postings live in the `sparse` blockfile, one entry per `(term, offset)`
//! holding the document's weight for the term. Each term's postings are cut
//! into consecutive runs of `postings_block_len` entries; the `sparse_max`
//! blockfile records, per `(term, run index)`, the run's offset range and
//! its largest and smallest weight.
//!
//! A query walks one cursor per term with Block-Max WAND. Runs are opened
//! (their postings read) only when a document inside them might still enter
//! the top k; every other run is skipped using its summary alone.

use crate::blockfile::{BlockValue, KeyPart, KeyRange, Reader};
use crate::error::{CoreError, CoreResult};
use crate::types::{OffsetId, SparseVector};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::ops::Bound;

/// Postings blockfile.
pub const SPARSE: &str = "sparse";
/// Block-max blockfile.
pub const SPARSE_MAX: &str = "sparse_max";

/// Summary of one run of a term's postings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockMax {
    /// First offset id in the run.
    pub first: OffsetId,
    /// Last offset id in the run.
    pub last: OffsetId,
    /// Largest weight in the run.
    pub max: f32,
    /// Smallest weight in the run.
    pub min: f32,
    /// Number of postings in the run.
    pub len: u32,
}

impl BlockMax {
    /// Largest contribution any posting of the run can make to a query
    /// term of weight `q`. Never negative.
    #[must_use]
    pub fn upper_bound(&self, q: f32) -> f32 {
        (q * self.max).max(q * self.min).max(0.0)
    }
}

/// Summarizes a term's sorted postings into runs of `block_len`.
#[must_use]
pub fn block_maxes(postings: &[(OffsetId, f32)], block_len: usize) -> Vec<BlockMax> {
    postings
        .chunks(block_len.max(1))
        .filter_map(|run| {
            let (first, _) = run.first()?;
            let (last, _) = run.last()?;
            let (max, min) = run
                .iter()
                .fold((f32::NEG_INFINITY, f32::INFINITY), |(max, min), (_, w)| {
                    (max.max(*w), min.min(*w))
                });
            Some(BlockMax {
                first: *first,
                last: *last,
                max,
                min,
                len: u32::try_from(run.len()).unwrap_or(u32::MAX),
            })
        })
        .collect()
}

/// Where postings and their run summaries come from.
pub trait PostingsSource {
    /// Run summaries of `term`, in offset order.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    fn block_maxes(&self, term: &str) -> CoreResult<Vec<BlockMax>>;

    /// Postings of one run of `term`, in offset order.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the run disagrees with its summary.
    fn load_run(&self, term: &str, run: &BlockMax) -> CoreResult<Vec<(OffsetId, f32)>>;
}

/// Postings source over the pinned `sparse` and `sparse_max` blockfiles.
#[derive(Debug, Clone, Copy)]
pub struct BlockfilePostings<'a> {
    /// The `sparse` blockfile.
    pub postings: &'a Reader,
    /// The `sparse_max` blockfile.
    pub maxes: &'a Reader,
}

impl PostingsSource for BlockfilePostings<'_> {
    fn block_maxes(&self, term: &str) -> CoreResult<Vec<BlockMax>> {
        self.maxes
            .get_prefix(term)?
            .into_iter()
            .map(|(key, value)| match value {
                BlockValue::BlockMax(max) => Ok(max),
                other => Err(CoreError::corrupt(format!(
                    "unexpected {} value at {key} in {SPARSE_MAX}",
                    other.kind()
                ))),
            })
            .collect()
    }

    fn load_run(&self, term: &str, run: &BlockMax) -> CoreResult<Vec<(OffsetId, f32)>> {
        let range = KeyRange::within_prefix(
            term,
            Bound::Included(KeyPart::U32(run.first)),
            Bound::Included(KeyPart::U32(run.last)),
        );
        let postings = self
            .postings
            .scan(range)
            .map(|entry| {
                let (key, value) = entry?;
                match (key.key.as_u32(), value) {
                    (Some(offset), BlockValue::F32(weight)) => Ok((offset, weight)),
                    (_, value) => Err(CoreError::corrupt(format!(
                        "unexpected {} posting at {key} in {SPARSE}",
                        value.kind()
                    ))),
                }
            })
            .collect::<CoreResult<Vec<_>>>()?;
        if postings.len() != run.len as usize {
            return Err(CoreError::corrupt(format!(
                "term {term:?} run {}..={} holds {} postings, summary says {}",
                run.first,
                run.last,
                postings.len(),
                run.len
            )));
        }
        Ok(postings)
    }
}

/// Work done by one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SparseQueryStats {
    /// Runs whose postings were read.
    pub blocks_opened: u64,
    /// Runs never read.
    pub blocks_skipped: u64,
    /// Documents fully scored.
    pub keys_evaluated: u64,
}

/// Top-k hits and the work done to find them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseQueryResult {
    /// `(offset id, score)`, best first; equal scores by offset id ascending.
    pub hits: Vec<(OffsetId, f32)>,
    /// Query statistics.
    pub stats: SparseQueryStats,
}

// ============================================================================
// Top-K Heap
// ============================================================================

/// Entry in the top-k min-heap.
///
/// Ordering: score ascending, then offset id descending, so the heap root
/// under `Reverse` is the entry to evict first.
struct HeapEntry {
    score: f32,
    offset: OffsetId,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.offset.cmp(&self.offset))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TopKHeap {
    k: usize,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl TopKHeap {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024) + 1),
        }
    }

    /// The k-th best score, once k entries are held.
    fn threshold(&self) -> Option<f32> {
        if self.heap.len() < self.k {
            None
        } else {
            self.heap.peek().map(|r| r.0.score)
        }
    }

    fn push(&mut self, score: f32, offset: OffsetId) {
        let entry = HeapEntry { score, offset };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(entry));
        } else if let Some(root) = self.heap.peek() {
            if entry > root.0 {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
        }
    }

    fn into_sorted_vec(self) -> Vec<(OffsetId, f32)> {
        let mut results: Vec<(OffsetId, f32)> = self
            .heap
            .into_vec()
            .into_iter()
            .map(|r| (r.0.offset, r.0.score))
            .collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        results
    }
}

// ============================================================================
// Term cursor
// ============================================================================

/// Cursor over one term's postings, opening runs lazily.
struct TermCursor<'a> {
    term: &'a str,
    weight: f32,
    runs: Vec<BlockMax>,
    /// `suffix_bounds[i]` = max run upper bound over `runs[i..]`.
    suffix_bounds: Vec<f32>,
    run: usize,
    /// Postings of `runs[run]`, once opened.
    open: Option<Vec<(OffsetId, f32)>>,
    pos: usize,
}

impl<'a> TermCursor<'a> {
    fn new(term: &'a str, weight: f32, runs: Vec<BlockMax>) -> Self {
        let mut suffix_bounds: Vec<f32> = runs.iter().map(|r| r.upper_bound(weight)).collect();
        for i in (0..suffix_bounds.len().saturating_sub(1)).rev() {
            suffix_bounds[i] = suffix_bounds[i].max(suffix_bounds[i + 1]);
        }
        Self {
            term,
            weight,
            runs,
            suffix_bounds,
            run: 0,
            open: None,
            pos: 0,
        }
    }

    /// Current offset id, or `None` once exhausted. An unopened run is
    /// positioned at its first posting.
    fn doc(&self) -> Option<OffsetId> {
        let run = self.runs.get(self.run)?;
        match &self.open {
            Some(postings) => postings.get(self.pos).map(|(offset, _)| *offset),
            None => Some(run.first),
        }
    }

    /// Bound for any posting at or after the current position.
    fn upper_bound(&self) -> f32 {
        self.suffix_bounds.get(self.run).copied().unwrap_or(0.0)
    }

    /// Bound for the current run only.
    fn run_bound(&self) -> f32 {
        self.runs
            .get(self.run)
            .map_or(0.0, |r| r.upper_bound(self.weight))
    }

    fn run_last(&self) -> Option<OffsetId> {
        self.runs.get(self.run).map(|r| r.last)
    }

    /// Moves to the run that may hold `target` without opening it.
    fn shallow_advance(&mut self, target: OffsetId) {
        while self.runs.get(self.run).is_some_and(|r| r.last < target) {
            self.run += 1;
            self.open = None;
            self.pos = 0;
        }
    }

    /// Positions at the first posting `>= target`, opening its run only if
    /// `target` lies strictly inside it.
    fn advance_to(
        &mut self,
        target: OffsetId,
        source: &dyn PostingsSource,
        stats: &mut SparseQueryStats,
    ) -> CoreResult<()> {
        self.shallow_advance(target);
        let Some(run) = self.runs.get(self.run) else {
            return Ok(());
        };
        if self.open.is_none() {
            if target <= run.first {
                return Ok(());
            }
            self.open_run(source, stats)?;
        }
        if let Some(postings) = &self.open {
            self.pos = postings.partition_point(|(offset, _)| *offset < target);
        }
        Ok(())
    }

    fn advance_past(
        &mut self,
        target: OffsetId,
        source: &dyn PostingsSource,
        stats: &mut SparseQueryStats,
    ) -> CoreResult<()> {
        match target.checked_add(1) {
            Some(next) => self.advance_to(next, source, stats),
            None => {
                self.run = self.runs.len();
                self.open = None;
                Ok(())
            }
        }
    }

    fn open_run(&mut self, source: &dyn PostingsSource, stats: &mut SparseQueryStats) -> CoreResult<()> {
        if let Some(run) = self.runs.get(self.run) {
            let postings = source.load_run(self.term, run)?;
            if postings.first().map(|p| p.0) != Some(run.first) || postings.last().map(|p| p.0) != Some(run.last) {
                return Err(CoreError::corrupt(format!(
                    "term {:?} run {}..={} disagrees with its postings",
                    self.term, run.first, run.last
                )));
            }
            stats.blocks_opened += 1;
            self.open = Some(postings);
            self.pos = 0;
        }
        Ok(())
    }

    /// Weight at the current posting, opening the run if needed.
    fn current_weight(&mut self, source: &dyn PostingsSource, stats: &mut SparseQueryStats) -> CoreResult<f32> {
        if self.open.is_none() {
            self.open_run(source, stats)?;
        }
        self.open
            .as_ref()
            .and_then(|postings| postings.get(self.pos))
            .map(|(_, weight)| *weight)
            .ok_or_else(|| CoreError::corrupt(format!("cursor for {:?} past its run", self.term)))
    }
}

fn check_query(query: &SparseVector, k: usize) -> CoreResult<()> {
    if k == 0 {
        return Err(CoreError::invalid_argument("k must be at least 1"));
    }
    if let Some((term, _)) = query.iter().find(|(_, w)| !w.is_finite()) {
        return Err(CoreError::invalid_argument(format!("weight of {term:?} is not finite")));
    }
    Ok(())
}

/// Returns whether a bound computed as an exact sum may still reach
/// `threshold` once the real score is accumulated in `f32`.
fn may_reach(bound: f64, terms: usize, threshold: f32) -> bool {
    let slack = 1.0 + (terms as f64 + 1.0) * f64::from(f32::EPSILON);
    bound * slack >= f64::from(threshold)
}

/// Top-k by dot product using Block-Max WAND.
///
/// Only documents in `allowed` (when given) are returned. Terms with zero
/// weight or absent from the index contribute nothing.
///
/// # Errors
///
/// Returns `InvalidArgument` for `k == 0` or a non-finite weight, and
/// `Corrupt` or `BackendUnavailable` if postings cannot be read.
pub fn top_k(
    source: &dyn PostingsSource,
    query: &SparseVector,
    k: usize,
    allowed: Option<&RoaringBitmap>,
) -> CoreResult<SparseQueryResult> {
    check_query(query, k)?;
    let mut stats = SparseQueryStats::default();

    // Term order is kept: scores accumulate in ascending term order.
    let mut cursors = Vec::new();
    for (term, &weight) in query {
        if weight == 0.0 {
            continue;
        }
        let runs = source.block_maxes(term)?;
        if !runs.is_empty() {
            cursors.push(TermCursor::new(term, weight, runs));
        }
    }
    let total_runs: u64 = cursors.iter().map(|c| c.runs.len() as u64).sum();
    let terms = cursors.len();

    let mut order: Vec<usize> = (0..cursors.len()).collect();
    let mut heap = TopKHeap::new(k);

    loop {
        order.sort_by(|&a, &b| match (cursors[a].doc(), cursors[b].doc()) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(da), Some(db)) => da.cmp(&db),
        });
        let active = order.iter().take_while(|&&i| cursors[i].doc().is_some()).count();
        if active == 0 {
            break;
        }

        let threshold = heap.threshold();
        let mut cumulative = 0.0f64;
        let mut pivot = None;
        for (pos, &i) in order.iter().take(active).enumerate() {
            cumulative += f64::from(cursors[i].upper_bound());
            if threshold.map_or(true, |t| may_reach(cumulative, terms, t)) {
                pivot = Some(pos);
                break;
            }
        }
        let Some(mut pivot) = pivot else { break };
        let Some(doc) = cursors[order[pivot]].doc() else { break };
        while pivot + 1 < active && cursors[order[pivot + 1]].doc() == Some(doc) {
            pivot += 1;
        }

        if let Some(t) = threshold {
            let mut run_sum = 0.0f64;
            for &i in &order[..=pivot] {
                cursors[i].shallow_advance(doc);
                run_sum += f64::from(cursors[i].run_bound());
            }
            if !may_reach(run_sum, terms, t) {
                // No document up to the end of the nearest run can qualify.
                let mut next = order[..=pivot]
                    .iter()
                    .filter_map(|&i| cursors[i].run_last())
                    .min()
                    .and_then(|last| last.checked_add(1));
                if pivot + 1 < active {
                    let following = cursors[order[pivot + 1]].doc();
                    next = match (next, following) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                for &i in &order[..=pivot] {
                    match next {
                        Some(target) => cursors[i].advance_to(target, source, &mut stats)?,
                        None => cursors[i].advance_past(u32::MAX, source, &mut stats)?,
                    }
                }
                continue;
            }
        }

        if cursors[order[0]].doc() == Some(doc) {
            if allowed.map_or(true, |a| a.contains(doc)) {
                let mut score = 0.0f32;
                for cursor in &mut cursors {
                    if cursor.doc() == Some(doc) {
                        score += cursor.weight * cursor.current_weight(source, &mut stats)?;
                    }
                }
                stats.keys_evaluated += 1;
                heap.push(score, doc);
            }
            for cursor in &mut cursors {
                if cursor.doc() == Some(doc) {
                    cursor.advance_past(doc, source, &mut stats)?;
                }
            }
        } else {
            cursors[order[0]].advance_to(doc, source, &mut stats)?;
        }
    }

    stats.blocks_skipped = total_runs.saturating_sub(stats.blocks_opened);
    Ok(SparseQueryResult {
        hits: heap.into_sorted_vec(),
        stats,
    })
}

/// Top-k by scoring every posting of every query term.
///
/// Produces exactly what [`top_k`] produces, with no pruning.
///
/// # Errors
///
/// See [`top_k`].
pub fn exhaustive_top_k(
    source: &dyn PostingsSource,
    query: &SparseVector,
    k: usize,
    allowed: Option<&RoaringBitmap>,
) -> CoreResult<SparseQueryResult> {
    check_query(query, k)?;
    let mut stats = SparseQueryStats::default();
    let mut scores: BTreeMap<OffsetId, f32> = BTreeMap::new();
    for (term, &weight) in query {
        if weight == 0.0 {
            continue;
        }
        for run in source.block_maxes(term)? {
            stats.blocks_opened += 1;
            for (offset, w) in source.load_run(term, &run)? {
                *scores.entry(offset).or_insert(0.0) += weight * w;
            }
        }
    }
    let mut heap = TopKHeap::new(k);
    for (offset, score) in scores {
        if allowed.map_or(true, |a| a.contains(offset)) {
            stats.keys_evaluated += 1;
            heap.push(score, offset);
        }
    }
    Ok(SparseQueryResult {
        hits: heap.into_sorted_vec(),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// In-memory postings that record which runs were opened.
    struct MemoryPostings {
        terms: BTreeMap<String, Vec<(OffsetId, f32)>>,
        block_len: usize,
        opened: Mutex<Vec<(String, OffsetId)>>,
    }

    impl MemoryPostings {
        fn new(block_len: usize) -> Self {
            Self {
                terms: BTreeMap::new(),
                block_len,
                opened: Mutex::new(Vec::new()),
            }
        }

        fn term(mut self, term: &str, postings: &[(OffsetId, f32)]) -> Self {
            self.terms.insert(term.to_string(), postings.to_vec());
            self
        }
    }

    impl PostingsSource for MemoryPostings {
        fn block_maxes(&self, term: &str) -> CoreResult<Vec<BlockMax>> {
            Ok(self
                .terms
                .get(term)
                .map(|p| block_maxes(p, self.block_len))
                .unwrap_or_default())
        }

        fn load_run(&self, term: &str, run: &BlockMax) -> CoreResult<Vec<(OffsetId, f32)>> {
            self.opened.lock().push((term.to_string(), run.first));
            Ok(self.terms[term]
                .iter()
                .copied()
                .filter(|(o, _)| (run.first..=run.last).contains(o))
                .collect())
        }
    }

    fn query(terms: &[(&str, f32)]) -> SparseVector {
        terms.iter().map(|(t, w)| (t.to_string(), *w)).collect()
    }

    #[test]
    fn second_run_is_never_opened() {
        let source = MemoryPostings::new(3)
            .term("t", &[(1, 0.2), (2, 0.9), (3, 0.5), (10, 0.3), (11, 0.1), (12, 0.3)]);
        let runs = source.block_maxes("t").unwrap();
        assert_eq!(runs[0].max, 0.9);
        assert_eq!(runs[1].max, 0.3);

        let result = top_k(&source, &query(&[("t", 1.0)]), 1, None).unwrap();
        assert_eq!(result.hits, vec![(2, 0.9)]);
        assert_eq!(result.stats.blocks_opened, 1);
        assert_eq!(result.stats.blocks_skipped, 1);
        assert_eq!(result.stats.keys_evaluated, 3);
        assert_eq!(*source.opened.lock(), vec![("t".to_string(), 1)]);
    }

    #[test]
    fn empty_query_and_missing_terms() {
        let source = MemoryPostings::new(2).term("a", &[(1, 1.0)]);
        assert!(top_k(&source, &SparseVector::new(), 3, None).unwrap().hits.is_empty());
        let result = top_k(&source, &query(&[("a", 1.0), ("zzz", 5.0)]), 3, None).unwrap();
        assert_eq!(result.hits, vec![(1, 1.0)]);
    }

    #[test]
    fn large_k_returns_every_candidate() {
        let source = MemoryPostings::new(2)
            .term("a", &[(1, 0.5), (2, 0.5), (4, 0.1)])
            .term("b", &[(2, 0.5), (3, 1.0)]);
        let result = top_k(&source, &query(&[("a", 1.0), ("b", 1.0)]), 10, None).unwrap();
        assert_eq!(result.hits, vec![(2, 1.0), (3, 1.0), (1, 0.5), (4, 0.1)]);
    }

    #[test]
    fn negative_weights_are_bounded() {
        let source = MemoryPostings::new(2)
            .term("a", &[(1, -2.0), (2, 0.5), (3, -1.0), (4, 0.25)])
            .term("b", &[(1, 3.0), (4, 1.0)]);
        let q = query(&[("a", -1.0), ("b", 0.5)]);
        let pruned = top_k(&source, &q, 2, None).unwrap();
        let exhaustive = exhaustive_top_k(&source, &q, 2, None).unwrap();
        assert_eq!(pruned.hits, exhaustive.hits);
        assert_eq!(pruned.hits[0], (1, 3.5));
    }

    #[test]
    fn allowed_set_filters_results() {
        let source = MemoryPostings::new(2).term("a", &[(1, 0.9), (2, 0.8), (3, 0.7)]);
        let allowed: RoaringBitmap = [2, 3].into_iter().collect();
        let result = top_k(&source, &query(&[("a", 1.0)]), 1, Some(&allowed)).unwrap();
        assert_eq!(result.hits, vec![(2, 0.8)]);
    }

    #[test]
    fn invalid_queries() {
        let source = MemoryPostings::new(2);
        assert!(matches!(
            top_k(&source, &query(&[("a", 1.0)]), 0, None),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            top_k(&source, &query(&[("a", f32::NAN)]), 1, None),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn block_max_summaries() {
        let runs = block_maxes(&[(1, 0.5), (3, -0.5), (7, 0.25)], 2);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].first, runs[0].last, runs[0].len), (1, 3, 2));
        assert_eq!((runs[0].max, runs[0].min), (0.5, -0.5));
        assert_eq!(runs[0].upper_bound(-2.0), 1.0);
        assert_eq!(runs[1].upper_bound(-1.0), 0.0);
    }

    fn postings_strategy() -> impl Strategy<Value = Vec<(OffsetId, f32)>> {
        prop::collection::btree_map(0u32..200, -4i8..=8, 0..60)
            .prop_map(|m| m.into_iter().map(|(o, w)| (o, f32::from(w) / 4.0)).collect())
    }

    proptest! {
        #[test]
        fn pruned_matches_exhaustive(
            a in postings_strategy(),
            b in postings_strategy(),
            c in postings_strategy(),
            weights in prop::collection::vec(-2i8..=4, 3),
            block_len in 1usize..8,
            k in 1usize..12,
        ) {
            let source = MemoryPostings::new(block_len).term("a", &a).term("b", &b).term("c", &c);
            let q: SparseVector = ["a", "b", "c"]
                .iter()
                .zip(&weights)
                .map(|(t, w)| (t.to_string(), f32::from(*w) / 2.0))
                .collect();
            let pruned = top_k(&source, &q, k, None).unwrap();
            let exhaustive = exhaustive_top_k(&source, &q, k, None).unwrap();
            prop_assert_eq!(pruned.hits, exhaustive.hits);
        }
    }
}
