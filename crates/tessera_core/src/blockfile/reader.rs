//! Pinned blockfile readers and lazy scans.

use crate::blockfile::block::Block;
use crate::blockfile::key::{BlockKey, KeyRange};
use crate::blockfile::manifest::Manifest;
use crate::blockfile::provider::{BlockfileId, BlockfileProvider};
use crate::blockfile::value::BlockValue;
use crate::error::{CoreError, CoreResult};
use std::ops::Range;
use std::sync::Arc;

/// A read-only view of one blockfile version.
///
/// The manifest is pinned when the reader is opened: later commits to the
/// same blockfile are never visible through this reader.
#[derive(Clone)]
pub struct Reader {
    provider: BlockfileProvider,
    id: BlockfileId,
    manifest: Arc<Manifest>,
}

impl Reader {
    pub(crate) fn new(provider: BlockfileProvider, id: BlockfileId, manifest: Arc<Manifest>) -> Self {
        Self {
            provider,
            id,
            manifest,
        }
    }

    /// The blockfile this reader reads.
    #[must_use]
    pub fn id(&self) -> &BlockfileId {
        &self.id
    }

    /// The pinned manifest version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.manifest.version
    }

    /// The pinned manifest.
    #[must_use]
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Number of entries, taken from the manifest without loading blocks.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.manifest.count()
    }

    /// Looks up one key.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` or `BackendUnavailable` if the owning block cannot
    /// be loaded. A missing key is `Ok(None)`.
    pub fn get(&self, key: &BlockKey) -> CoreResult<Option<BlockValue>> {
        let Some(index) = self.manifest.find(key) else {
            return Ok(None);
        };
        let block = self.load_block(index)?;
        Ok(block.get(key).cloned())
    }

    /// Returns every entry under `prefix`.
    ///
    /// # Errors
    ///
    /// See [`Self::get`].
    pub fn get_prefix(&self, prefix: &str) -> CoreResult<Vec<(BlockKey, BlockValue)>> {
        self.scan(KeyRange::prefix(prefix)).collect()
    }

    /// Returns a lazy scan over `range`.
    ///
    /// Blocks are resolved as the scan reaches them.
    #[must_use]
    pub fn scan(&self, range: KeyRange) -> Scan {
        let blocks = self.manifest.overlapping(&range);
        Scan {
            reader: self.clone(),
            next_block: blocks.start,
            blocks,
            range,
            current: None,
            failed: false,
        }
    }

    /// Smallest entry.
    ///
    /// # Errors
    ///
    /// See [`Self::get`].
    pub fn first(&self) -> CoreResult<Option<(BlockKey, BlockValue)>> {
        if self.manifest.entries.is_empty() {
            return Ok(None);
        }
        let block = self.load_block(0)?;
        Ok(block.entries().first().cloned())
    }

    /// Largest entry.
    ///
    /// # Errors
    ///
    /// See [`Self::get`].
    pub fn last(&self) -> CoreResult<Option<(BlockKey, BlockValue)>> {
        let Some(index) = self.manifest.entries.len().checked_sub(1) else {
            return Ok(None);
        };
        let block = self.load_block(index)?;
        Ok(block.entries().last().cloned())
    }

    /// Resolves the block at manifest position `index`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the block disagrees with its manifest entry.
    pub fn load_block(&self, index: usize) -> CoreResult<Arc<Block>> {
        let entry = self.manifest.entries.get(index).ok_or_else(|| {
            CoreError::invalid_argument(format!("block index {index} out of range"))
        })?;
        let block = self.provider.fetch_block(&self.id, &entry.block_id)?;
        if block.len() != entry.count as usize
            || block.first_key() != Some(&entry.start)
            || block.last_key() != Some(&entry.end)
        {
            return Err(CoreError::corrupt(format!(
                "block {} does not match its manifest entry in {}",
                entry.block_id, self.id
            )));
        }
        Ok(block)
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("version", &self.manifest.version)
            .finish_non_exhaustive()
    }
}

/// A lazy, restartable scan over a key range of one pinned version.
///
/// Yields entries in key order. A block that fails to load ends the scan
/// after yielding its error.
#[derive(Clone)]
pub struct Scan {
    reader: Reader,
    range: KeyRange,
    blocks: Range<usize>,
    next_block: usize,
    current: Option<(Arc<Block>, Range<usize>)>,
    failed: bool,
}

impl Scan {
    /// Restarts the scan from the beginning of its range.
    pub fn rewind(&mut self) {
        self.next_block = self.blocks.start;
        self.current = None;
        self.failed = false;
    }

    /// The scanned range.
    #[must_use]
    pub fn range(&self) -> &KeyRange {
        &self.range
    }
}

impl Iterator for Scan {
    type Item = CoreResult<(BlockKey, BlockValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((block, span)) = &mut self.current {
                if let Some(i) = span.next() {
                    return Some(Ok(block.entries()[i].clone()));
                }
                self.current = None;
            }
            if self.failed || self.next_block >= self.blocks.end {
                return None;
            }
            let index = self.next_block;
            self.next_block += 1;
            match self.reader.load_block(index) {
                Ok(block) => {
                    let span = block.span(&self.range);
                    self.current = Some((block, span));
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
