//! # tessera core
//!
//! Versioned copy-on-write block store and the segment indices built on it.
//!
//! This crate provides:
//! - [`BlockCache`]: decoded blocks by content id, LRU-bounded, single-flight
//! - Blockfiles: sorted maps stored as immutable blocks under a versioned
//!   manifest, read through a pinned [`Reader`] and changed through a [`Writer`]
//! - Segments: record, metadata (typed, full-text and sparse indices) and
//!   vector segments composed from blockfiles
//! - Block-max pruned top-k over sparse postings
//! - [`SegmentManager`]: per-collection apply/flush with publish-last commits
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_core::{
//!     BlockCache, BlockfileProvider, CancellationToken, CollectionId, Config, GetRequest,
//!     InMemoryCatalog, OperationRecord, SegmentManager,
//! };
//! use tessera_storage::InMemoryBackend;
//!
//! let config = Config::default();
//! let provider = BlockfileProvider::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(BlockCache::new(config.cache.clone())),
//!     config.blockfile.clone(),
//! );
//! let mut manager = SegmentManager::create(
//!     CollectionId::new(),
//!     provider,
//!     Arc::new(InMemoryCatalog::new()),
//!     config,
//! )
//! .unwrap();
//!
//! manager
//!     .apply(&[OperationRecord::add("a").document("hello world").embedding(vec![1.0, 0.0])])
//!     .unwrap();
//! manager.flush(&CancellationToken::new()).unwrap();
//! assert_eq!(manager.get(&GetRequest::new()).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blockfile;
mod cache;
mod cancel;
mod catalog;
mod config;
mod error;
pub mod layout;
mod manager;
pub mod segment;
mod stats;
mod types;

pub use blockfile::{
    BlockKey, BlockValue, BlockfileId, BlockfileProvider, KeyPart, KeyRange, Manifest, ManifestEntry, Reader,
    Writer,
};
pub use cache::BlockCache;
pub use cancel::CancellationToken;
pub use catalog::{Catalog, CollectionVersion, InMemoryCatalog, ObjectCatalog};
pub use config::{
    BlockfileConfig, CacheConfig, Config, FullTextConfig, SparseConfig, Space, VectorConfig, WriterPolicy,
};
pub use error::{CoreError, CoreResult};
pub use manager::{
    Filter, GetRequest, Operation, OperationRecord, QueryRequest, ScoredRecord, SegmentManager, SparseHits,
};
pub use segment::filter::{Where, WhereDocument};
pub use segment::sparse::{SparseQueryResult, SparseQueryStats};
pub use segment::{PreparedSegment, Segment, SegmentVersion};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use types::{
    CollectionId, DataRecord, MaterializedRecord, Metadata, MetadataValue, OffsetId, SegmentId, SegmentKind,
    SparseVector,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
