//! Blockfile keys and key ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// The typed part of a blockfile key.
///
/// Ordered first by variant (`Bool < U32 < F32 < Str`), then by value.
/// `F32` values are ordered with `total_cmp`, so every value including NaN
/// has a fixed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyPart {
    /// A boolean key.
    Bool(bool),
    /// An unsigned integer key.
    U32(u32),
    /// A float key.
    F32(f32),
    /// A string key.
    Str(String),
}

impl KeyPart {
    /// The smallest key part.
    pub const MIN: Self = Self::Bool(false);

    const fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::U32(_) => 1,
            Self::F32(_) => 2,
            Self::Str(_) => 3,
        }
    }

    /// Returns the `U32` value, if this is one.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string value, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Bool(_) => 2,
            Self::U32(_) | Self::F32(_) => 6,
            Self::Str(s) => s.len() + 6,
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyPart {}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::U32(a), Self::U32(b)) => a.cmp(b),
            (Self::F32(a), Self::F32(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}f"),
            Self::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// A composite blockfile key: a string prefix and a typed key.
///
/// Prefixes group related entries (a metadata field, a term, a graph
/// section); keys order entries within a prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    /// Grouping prefix.
    pub prefix: String,
    /// Typed key within the prefix.
    pub key: KeyPart,
}

impl BlockKey {
    /// Creates a key.
    pub fn new(prefix: impl Into<String>, key: KeyPart) -> Self {
        Self {
            prefix: prefix.into(),
            key,
        }
    }

    /// Creates a key with a `U32` part.
    pub fn u32(prefix: impl Into<String>, key: u32) -> Self {
        Self::new(prefix, KeyPart::U32(key))
    }

    /// Creates a key with a `Str` part.
    pub fn str(prefix: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(prefix, KeyPart::Str(key.into()))
    }

    /// Creates a key with an `F32` part.
    pub fn f32(prefix: impl Into<String>, key: f32) -> Self {
        Self::new(prefix, KeyPart::F32(key))
    }

    /// Creates a key with a `Bool` part.
    pub fn bool(prefix: impl Into<String>, key: bool) -> Self {
        Self::new(prefix, KeyPart::Bool(key))
    }

    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.prefix.len() + 4 + self.key.size()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.prefix, self.key)
    }
}

/// A range of blockfile keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: Bound<BlockKey>,
    end: Bound<BlockKey>,
}

impl KeyRange {
    /// Creates a range from explicit bounds.
    #[must_use]
    pub const fn new(start: Bound<BlockKey>, end: Bound<BlockKey>) -> Self {
        Self { start, end }
    }

    /// Every key.
    #[must_use]
    pub const fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// `start..=end`.
    #[must_use]
    pub const fn inclusive(start: BlockKey, end: BlockKey) -> Self {
        Self::new(Bound::Included(start), Bound::Included(end))
    }

    /// Every key with exactly this prefix.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let end = prefix_end(&prefix);
        Self::new(Bound::Included(BlockKey::new(prefix, KeyPart::MIN)), end)
    }

    /// Keys with this prefix whose typed part lies within `start..end`.
    pub fn within_prefix(
        prefix: impl Into<String>,
        start: Bound<KeyPart>,
        end: Bound<KeyPart>,
    ) -> Self {
        let prefix = prefix.into();
        let lower = match start {
            Bound::Included(k) => Bound::Included(BlockKey::new(prefix.clone(), k)),
            Bound::Excluded(k) => Bound::Excluded(BlockKey::new(prefix.clone(), k)),
            Bound::Unbounded => Bound::Included(BlockKey::new(prefix.clone(), KeyPart::MIN)),
        };
        let upper = match end {
            Bound::Included(k) => Bound::Included(BlockKey::new(prefix, k)),
            Bound::Excluded(k) => Bound::Excluded(BlockKey::new(prefix, k)),
            Bound::Unbounded => prefix_end(&prefix),
        };
        Self::new(lower, upper)
    }

    /// Lower bound.
    #[must_use]
    pub const fn start(&self) -> &Bound<BlockKey> {
        &self.start
    }

    /// Upper bound.
    #[must_use]
    pub const fn end(&self) -> &Bound<BlockKey> {
        &self.end
    }

    /// Returns whether `key` lies in the range.
    #[must_use]
    pub fn contains(&self, key: &BlockKey) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }

    /// Returns whether `key` sorts below the range.
    #[must_use]
    pub fn before_start(&self, key: &BlockKey) -> bool {
        match &self.start {
            Bound::Included(s) => key < s,
            Bound::Excluded(s) => key <= s,
            Bound::Unbounded => false,
        }
    }

    /// Returns whether `key` sorts above the range.
    #[must_use]
    pub fn after_end(&self, key: &BlockKey) -> bool {
        match &self.end {
            Bound::Included(e) => key > e,
            Bound::Excluded(e) => key >= e,
            Bound::Unbounded => false,
        }
    }

    /// Returns whether the closed interval `[first, last]` overlaps the range.
    #[must_use]
    pub fn overlaps(&self, first: &BlockKey, last: &BlockKey) -> bool {
        !self.before_start(last) && !self.after_end(first)
    }
}

/// The exclusive upper bound of all keys carrying `prefix`.
///
/// The next string after `prefix` in lexicographic order is `prefix + "\0"`.
fn prefix_end(prefix: &str) -> Bound<BlockKey> {
    Bound::Excluded(BlockKey::new(format!("{prefix}\0"), KeyPart::MIN))
}
