//! Vector segment: raw vectors and a navigable small-world graph.
//!
//! The graph is an arena. Node `i` is stored at `("node", i)` and refers to
//! its neighbours by arena index; the header at `("header", 0)` holds the
//! entry point. `("offset", id)` maps a record to its live node. Deleted
//! records leave tombstoned nodes that still route searches but are never
//! returned. A commit rewrites only the nodes touched since the last flush.

use crate::blockfile::{BlockKey, BlockValue, BlockfileProvider, KeyRange};
use crate::cancel::CancellationToken;
use crate::config::{Space, VectorConfig};
use crate::error::{CoreError, CoreResult};
use crate::segment::{Ops, PreparedSegment, SegmentFile, SegmentVersion};
use crate::types::{CollectionId, MaterializedRecord, OffsetId};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

/// Raw vectors: `("", offset)` to `Vector`.
pub const VECTORS: &str = "vectors";
/// Graph arena, header and offset map.
pub const GRAPH: &str = "graph";

const NODE: &str = "node";
const HEADER: &str = "header";
const OFFSET: &str = "offset";

/// One graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Record the node belongs to.
    pub offset: OffsetId,
    /// The record's vector, kept for routing.
    pub vector: Vec<f32>,
    /// Neighbour arena indices.
    pub neighbors: Vec<u32>,
    /// Set once the record is deleted or re-embedded.
    pub tombstone: bool,
}

/// Graph-wide state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphHeader {
    /// Arena index searches start from.
    pub entry_point: Option<u32>,
    /// Vector dimension, fixed by the first insert.
    pub dimension: Option<u32>,
    /// Distance function.
    pub space: Space,
    /// Number of arena slots, live or tombstoned.
    pub node_count: u32,
}

/// Distance between two vectors of equal length; smaller is closer.
#[must_use]
pub fn distance(space: Space, a: &[f32], b: &[f32]) -> f32 {
    match space {
        Space::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        Space::Ip => 1.0 - dot(a, b),
        Space::Cosine => {
            let norms = dot(a, a).sqrt() * dot(b, b).sqrt();
            if norms == 0.0 {
                1.0
            } else {
                1.0 - dot(a, b) / norms
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Search candidate ordered by distance, then arena index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    index: u32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Read access to graph nodes, optionally overlaid with unflushed nodes.
struct GraphView<'a> {
    graph: &'a SegmentFile,
    dirty: Option<&'a BTreeMap<u32, GraphNode>>,
}

impl GraphView<'_> {
    fn node(&self, index: u32) -> CoreResult<GraphNode> {
        if let Some(node) = self.dirty.and_then(|d| d.get(&index)) {
            return Ok(node.clone());
        }
        match self.graph.reader().get(&BlockKey::u32(NODE, index))? {
            Some(BlockValue::Node(node)) => Ok(node),
            Some(other) => Err(CoreError::corrupt(format!(
                "unexpected {} value for graph node {index}",
                other.kind()
            ))),
            None => Err(CoreError::corrupt(format!("graph node {index} is missing"))),
        }
    }

    /// Beam search from `entry`, returning up to `ef` nodes closest first.
    /// Tombstoned nodes are traversed and returned.
    fn search(&self, space: Space, query: &[f32], entry: u32, ef: usize) -> CoreResult<Vec<(Scored, GraphNode)>> {
        let ef = ef.max(1);
        let mut nodes: BTreeMap<u32, GraphNode> = BTreeMap::new();
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 2);
        let mut candidates: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::with_capacity(ef * 2);
        let mut results: BinaryHeap<Scored> = BinaryHeap::with_capacity(ef + 1);

        let start = self.node(entry)?;
        let first = Scored {
            distance: distance(space, query, &start.vector),
            index: entry,
        };
        nodes.insert(entry, start);
        visited.insert(entry);
        candidates.push(std::cmp::Reverse(first));
        results.push(first);

        while let Some(std::cmp::Reverse(candidate)) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |r| r.distance);
            if candidate.distance > worst && results.len() >= ef {
                break;
            }
            let neighbors = nodes
                .get(&candidate.index)
                .map(|n| n.neighbors.clone())
                .unwrap_or_default();
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let node = self.node(neighbor)?;
                let scored = Scored {
                    distance: distance(space, query, &node.vector),
                    index: neighbor,
                };
                nodes.insert(neighbor, node);
                let worst = results.peek().map_or(f32::INFINITY, |r| r.distance);
                if results.len() < ef || scored.distance < worst {
                    candidates.push(std::cmp::Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found = results.into_sorted_vec();
        found.dedup();
        Ok(found
            .into_iter()
            .filter_map(|s| nodes.remove(&s.index).map(|n| (s, n)))
            .collect())
    }
}

/// Dense vectors of a collection and their graph index.
#[derive(Debug, Clone)]
pub struct VectorSegment {
    provider: BlockfileProvider,
    descriptor: SegmentVersion,
    config: VectorConfig,
    vectors: SegmentFile,
    graph: SegmentFile,
    header: GraphHeader,
    working: GraphHeader,
    dirty: BTreeMap<u32, GraphNode>,
    offset_ops: Ops,
    vector_ops: Ops,
}

impl VectorSegment {
    /// Opens the segment at its committed descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if a manifest or the graph
    /// header cannot be loaded.
    pub fn open(
        provider: &BlockfileProvider,
        collection: CollectionId,
        descriptor: SegmentVersion,
        config: VectorConfig,
    ) -> CoreResult<Self> {
        let vectors = SegmentFile::open(provider, collection, &descriptor, VECTORS)?;
        let graph = SegmentFile::open(provider, collection, &descriptor, GRAPH)?;
        let header = match graph.reader().get(&BlockKey::u32(HEADER, 0))? {
            Some(BlockValue::GraphHeader(header)) => header,
            Some(other) => {
                return Err(CoreError::corrupt(format!(
                    "unexpected {} value for graph header",
                    other.kind()
                )))
            }
            None => GraphHeader {
                dimension: config.dimension,
                space: config.space,
                ..GraphHeader::default()
            },
        };
        Ok(Self {
            provider: provider.clone(),
            descriptor,
            config,
            vectors,
            graph,
            working: header.clone(),
            header,
            dirty: BTreeMap::new(),
            offset_ops: Ops::new(),
            vector_ops: Ops::new(),
        })
    }

    /// The committed descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SegmentVersion {
        &self.descriptor
    }

    /// The committed graph header.
    #[must_use]
    pub fn header(&self) -> &GraphHeader {
        &self.header
    }

    /// Dimension of buffered or committed vectors, if known.
    #[must_use]
    pub fn dimension(&self) -> Option<u32> {
        self.working.dimension
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.vectors.reader().count()
    }

    /// The stored vector of a record.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn get_vector(&self, offset_id: OffsetId) -> CoreResult<Option<Vec<f32>>> {
        match self.vectors.reader().get(&BlockKey::u32("", offset_id))? {
            None => Ok(None),
            Some(BlockValue::Vector(v)) => Ok(Some(v)),
            Some(other) => Err(CoreError::corrupt(format!("unexpected {} value in {VECTORS}", other.kind()))),
        }
    }

    /// Checks a vector against the segment's dimension.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on mismatch.
    pub fn check_dimension(&self, vector: &[f32]) -> CoreResult<()> {
        match self.working.dimension {
            Some(d) if d as usize != vector.len() => Err(CoreError::invalid_argument(format!(
                "vector has dimension {}, collection has {d}",
                vector.len()
            ))),
            _ if vector.is_empty() => Err(CoreError::invalid_argument("empty vector")),
            _ => Ok(()),
        }
    }

    /// The `k` nearest records to `vector`, closest first.
    ///
    /// With `allowed`, only those records are considered and they are scored
    /// exactly; otherwise the graph is searched with a beam of
    /// `max(ef_search, k)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `k == 0` or a dimension mismatch.
    pub fn query(&self, vector: &[f32], k: usize, allowed: Option<&RoaringBitmap>) -> CoreResult<Vec<(OffsetId, f32)>> {
        if k == 0 {
            return Err(CoreError::invalid_argument("k must be at least 1"));
        }
        let Some(dimension) = self.header.dimension else {
            return Ok(Vec::new());
        };
        if dimension as usize != vector.len() {
            return Err(CoreError::invalid_argument(format!(
                "query has dimension {}, collection has {dimension}",
                vector.len()
            )));
        }
        let space = self.header.space;

        let mut hits: Vec<(OffsetId, f32)> = match allowed {
            Some(allowed) => {
                let mut hits = Vec::new();
                for offset in allowed {
                    if let Some(stored) = self.get_vector(offset)? {
                        hits.push((offset, distance(space, vector, &stored)));
                    }
                }
                hits
            }
            None => {
                let Some(entry) = self.header.entry_point else {
                    return Ok(Vec::new());
                };
                let view = GraphView {
                    graph: &self.graph,
                    dirty: None,
                };
                view.search(space, vector, entry, self.config.ef_search.max(k))?
                    .into_iter()
                    .filter(|(_, node)| !node.tombstone)
                    .map(|(scored, node)| (node.offset, scored.distance))
                    .collect()
            }
        };
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn working_view(&self) -> GraphView<'_> {
        GraphView {
            graph: &self.graph,
            dirty: Some(&self.dirty),
        }
    }

    fn working_index(&self, offset_id: OffsetId) -> CoreResult<Option<u32>> {
        let key = BlockKey::u32(OFFSET, offset_id);
        let value = match self.offset_ops.get(&key) {
            Some(op) => op.clone(),
            None => self.graph.reader().get(&key)?,
        };
        match value {
            None => Ok(None),
            Some(BlockValue::U32(index)) => Ok(Some(index)),
            Some(other) => Err(CoreError::corrupt(format!("unexpected {} value in graph offsets", other.kind()))),
        }
    }

    /// Buffers one materialized record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a dimension mismatch, or a read error
    /// from the committed graph.
    pub fn apply(&mut self, record: &MaterializedRecord) -> CoreResult<()> {
        let old = record.old.as_ref().and_then(|r| r.embedding.as_ref());
        let new = record.new.as_ref().and_then(|r| r.embedding.as_ref());
        if old == new {
            return Ok(());
        }
        if let Some(new) = new {
            self.check_dimension(new)?;
        }
        if old.is_some() {
            self.remove(record.offset_id)?;
        }
        if let Some(new) = new {
            self.insert(record.offset_id, new.clone())?;
        }
        Ok(())
    }

    fn remove(&mut self, offset_id: OffsetId) -> CoreResult<()> {
        if let Some(index) = self.working_index(offset_id)? {
            let mut node = self.working_view().node(index)?;
            node.tombstone = true;
            self.dirty.insert(index, node);
        }
        self.offset_ops.insert(BlockKey::u32(OFFSET, offset_id), None);
        self.vector_ops.insert(BlockKey::u32("", offset_id), None);
        Ok(())
    }

    fn insert(&mut self, offset_id: OffsetId, vector: Vec<f32>) -> CoreResult<()> {
        let space = self.working.space;
        let m = self.config.max_neighbors;
        let index = self.working.node_count;
        let mut node = GraphNode {
            offset: offset_id,
            vector: vector.clone(),
            neighbors: Vec::new(),
            tombstone: false,
        };

        if let Some(entry) = self.working.entry_point {
            let found = self
                .working_view()
                .search(space, &vector, entry, self.config.ef_construction.max(m))?;
            node.neighbors = found
                .iter()
                .filter(|(_, n)| !n.tombstone)
                .take(m)
                .map(|(s, _)| s.index)
                .collect();
            for (scored, mut neighbor) in found.into_iter().filter(|(s, _)| node.neighbors.contains(&s.index)) {
                neighbor.neighbors.push(index);
                if neighbor.neighbors.len() > m {
                    self.prune(&mut neighbor, m)?;
                }
                self.dirty.insert(scored.index, neighbor);
            }
        } else {
            self.working.entry_point = Some(index);
        }

        self.working.dimension = Some(u32::try_from(vector.len()).unwrap_or(u32::MAX));
        self.working.node_count = index
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_argument("graph arena exhausted"))?;
        self.dirty.insert(index, node);
        self.offset_ops
            .insert(BlockKey::u32(OFFSET, offset_id), Some(BlockValue::U32(index)));
        self.vector_ops
            .insert(BlockKey::u32("", offset_id), Some(BlockValue::Vector(vector)));
        Ok(())
    }

    /// Keeps the `m` nearest neighbours of `node`.
    fn prune(&self, node: &mut GraphNode, m: usize) -> CoreResult<()> {
        let space = self.working.space;
        let view = self.working_view();
        let mut scored = Vec::with_capacity(node.neighbors.len());
        for &index in &node.neighbors {
            let neighbor = view.node(index)?;
            scored.push(Scored {
                distance: distance(space, &node.vector, &neighbor.vector),
                index,
            });
        }
        scored.sort();
        node.neighbors = scored.into_iter().take(m).map(|s| s.index).collect();
        Ok(())
    }

    /// Returns whether anything is buffered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty() || !self.vector_ops.is_empty() || !self.offset_ops.is_empty()
    }

    /// Durably writes every buffered change without making it visible.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure; the buffer is left intact.
    pub fn prepare_commit(&self, cancel: &CancellationToken) -> CoreResult<PreparedSegment> {
        let mut prepared = PreparedSegment {
            descriptor: self.descriptor.clone(),
            manifests: BTreeMap::new(),
        };
        let mut graph_ops = self.offset_ops.clone();
        for (index, node) in &self.dirty {
            graph_ops.insert(BlockKey::u32(NODE, *index), Some(BlockValue::Node(node.clone())));
        }
        if !graph_ops.is_empty() {
            graph_ops.insert(
                BlockKey::u32(HEADER, 0),
                Some(BlockValue::GraphHeader(self.working.clone())),
            );
        }
        self.vectors
            .commit(&self.provider, self.vector_ops.clone(), cancel, &mut prepared)?;
        self.graph.commit(&self.provider, graph_ops, cancel, &mut prepared)?;
        Ok(prepared)
    }

    /// Makes prepared state current and clears the buffer.
    pub fn install(&mut self, prepared: PreparedSegment) {
        self.vectors.install(&self.provider, &prepared);
        self.graph.install(&self.provider, &prepared);
        self.descriptor = prepared.descriptor;
        self.header = self.working.clone();
        self.dirty.clear();
        self.offset_ops.clear();
        self.vector_ops.clear();
    }

    /// Every live `(offset, arena index)` pair of the committed graph.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` on read failure.
    pub fn live_nodes(&self) -> CoreResult<Vec<(OffsetId, u32)>> {
        self.graph
            .reader()
            .scan(KeyRange::prefix(OFFSET))
            .map(|entry| {
                let (key, value) = entry?;
                match (key.key.as_u32(), value) {
                    (Some(offset), BlockValue::U32(index)) => Ok((offset, index)),
                    (_, other) => Err(CoreError::corrupt(format!(
                        "unexpected {} value in graph offsets",
                        other.kind()
                    ))),
                }
            })
            .collect()
    }
}
