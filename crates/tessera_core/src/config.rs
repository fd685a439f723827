//! Store configuration.
//!
//! Loading configuration from files or the environment is left to the
//! embedding process; these are plain builder structs.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens when a writer is requested for a blockfile that already
/// has an open writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPolicy {
    /// Reject immediately with `WriterConflict`.
    FailFast,
    /// Wait up to `timeout` for the other writer to finish, then fail with
    /// `WriterConflict`.
    Block {
        /// Maximum time to wait.
        timeout: Duration,
    },
}

/// Blockfile layout and writer configuration.
#[derive(Debug, Clone)]
pub struct BlockfileConfig {
    /// Target encoded size of a block in bytes. Rewritten blocks above this
    /// size are split.
    pub target_block_size: usize,
    /// Occupancy, in percent of the target, below which a rewritten block
    /// is merged with a neighbour when the result fits.
    pub min_block_occupancy_percent: u8,
    /// Behaviour on concurrent writer attempts.
    pub writer_policy: WriterPolicy,
}

impl Default for BlockfileConfig {
    fn default() -> Self {
        Self {
            target_block_size: 16 * 1024, // 16 KB
            min_block_occupancy_percent: 25,
            writer_policy: WriterPolicy::FailFast,
        }
    }
}

impl BlockfileConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target block size.
    #[must_use]
    pub const fn target_block_size(mut self, bytes: usize) -> Self {
        self.target_block_size = bytes;
        self
    }

    /// Sets the minimum occupancy percentage.
    #[must_use]
    pub const fn min_block_occupancy_percent(mut self, percent: u8) -> Self {
        self.min_block_occupancy_percent = percent;
        self
    }

    /// Sets the writer policy.
    #[must_use]
    pub const fn writer_policy(mut self, policy: WriterPolicy) -> Self {
        self.writer_policy = policy;
        self
    }

    /// Returns the occupancy threshold in bytes.
    #[must_use]
    pub fn min_block_size(&self) -> usize {
        self.target_block_size * usize::from(self.min_block_occupancy_percent) / 100
    }
}

/// Block cache capacity.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total size of cached blocks in bytes.
    pub capacity_bytes: usize,
    /// Maximum number of cached blocks.
    pub capacity_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024, // 64 MB
            capacity_entries: 16 * 1024,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte capacity.
    #[must_use]
    pub const fn capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Sets the entry capacity.
    #[must_use]
    pub const fn capacity_entries(mut self, entries: usize) -> Self {
        self.capacity_entries = entries;
        self
    }
}

/// Sparse postings index configuration.
#[derive(Debug, Clone)]
pub struct SparseConfig {
    /// Number of postings summarized by one block-max entry.
    pub postings_block_len: usize,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            postings_block_len: 128,
        }
    }
}

impl SparseConfig {
    /// Sets the number of postings per block-max entry.
    #[must_use]
    pub const fn postings_block_len(mut self, len: usize) -> Self {
        self.postings_block_len = len;
        self
    }
}

/// Configuration for the full-text n-gram index.
#[derive(Debug, Clone)]
pub struct FullTextConfig {
    /// Characters per indexed gram. Patterns shorter than this are
    /// matched by gram prefix scans.
    pub ngram_len: usize,
}

impl Default for FullTextConfig {
    fn default() -> Self {
        Self { ngram_len: 3 }
    }
}

impl FullTextConfig {
    /// Creates a new full-text configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gram length.
    #[must_use]
    pub const fn ngram_len(mut self, len: usize) -> Self {
        self.ngram_len = len;
        self
    }
}

/// Distance function of a vector segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Space {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// Inner product, as `1 - dot`.
    Ip,
    /// Cosine distance, as `1 - cos`.
    Cosine,
}

/// Vector segment configuration.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// Fixed dimension; inferred from the first embedding when `None`.
    pub dimension: Option<u32>,
    /// Distance function.
    pub space: Space,
    /// Maximum neighbours per graph node.
    pub max_neighbors: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
    /// Beam width while querying.
    pub ef_search: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            space: Space::L2,
            max_neighbors: 16,
            ef_construction: 100,
            ef_search: 40,
        }
    }
}

impl VectorConfig {
    /// Sets a fixed dimension.
    #[must_use]
    pub const fn dimension(mut self, dimension: u32) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Sets the distance function.
    #[must_use]
    pub const fn space(mut self, space: Space) -> Self {
        self.space = space;
        self
    }

    /// Sets the maximum neighbours per node.
    #[must_use]
    pub const fn max_neighbors(mut self, m: usize) -> Self {
        self.max_neighbors = m;
        self
    }

    /// Sets the construction beam width.
    #[must_use]
    pub const fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Sets the query beam width.
    #[must_use]
    pub const fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }
}

/// Configuration for a collection store.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Blockfile layout and writers.
    pub blockfile: BlockfileConfig,
    /// Block cache capacity.
    pub cache: CacheConfig,
    /// Sparse postings index.
    pub sparse: SparseConfig,
    /// Full-text index.
    pub full_text: FullTextConfig,
    /// Vector segment.
    pub vector: VectorConfig,
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the blockfile configuration.
    #[must_use]
    pub fn blockfile(mut self, config: BlockfileConfig) -> Self {
        self.blockfile = config;
        self
    }

    /// Sets the cache configuration.
    #[must_use]
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Sets the sparse index configuration.
    #[must_use]
    pub fn sparse(mut self, config: SparseConfig) -> Self {
        self.sparse = config;
        self
    }

    /// Sets the full-text configuration.
    #[must_use]
    pub fn full_text(mut self, config: FullTextConfig) -> Self {
        self.full_text = config;
        self
    }

    /// Sets the vector configuration.
    #[must_use]
    pub fn vector(mut self, config: VectorConfig) -> Self {
        self.vector = config;
        self
    }

    /// Checks that every size and count is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first bad setting.
    pub fn validate(&self) -> CoreResult<()> {
        let checks = [
            (self.blockfile.target_block_size == 0, "target_block_size"),
            (self.blockfile.min_block_occupancy_percent > 100, "min_block_occupancy_percent"),
            (self.cache.capacity_entries == 0, "cache capacity_entries"),
            (self.cache.capacity_bytes == 0, "cache capacity_bytes"),
            (self.sparse.postings_block_len == 0, "postings_block_len"),
            (self.full_text.ngram_len == 0, "ngram_len"),
            (self.vector.dimension == Some(0), "vector dimension"),
            (self.vector.max_neighbors == 0, "max_neighbors"),
            (self.vector.ef_construction == 0, "ef_construction"),
            (self.vector.ef_search == 0, "ef_search"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, name)) => Err(CoreError::invalid_argument(format!("invalid {name}"))),
            None => Ok(()),
        }
    }
}
