//! Core type definitions for tessera.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Dense internal identifier of a record within one collection.
///
/// Offset ids are allocated by the record segment and never reused.
pub type OffsetId = u32;

/// Identifier for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub Uuid);

impl CollectionId {
    /// Generates a new random collection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a collection id from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not a UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub Uuid);

impl SegmentId {
    /// Generates a new random segment id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three segment kinds of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Id mappings and raw record payloads.
    Record,
    /// Typed metadata, full-text and sparse indices.
    Metadata,
    /// Dense vectors and their graph.
    Vector,
}

impl SegmentKind {
    /// All kinds, in flush order.
    pub const ALL: [Self; 3] = [Self::Record, Self::Metadata, Self::Vector];

    /// Returns the name used in object keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Metadata => "metadata",
            Self::Vector => "vector",
        }
    }

    /// Parses a kind from its object-key name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// A string value.
    Str(String),
    /// An unsigned integer value.
    U32(u32),
    /// A floating point value.
    F32(f32),
    /// A boolean value.
    Bool(bool),
}

impl MetadataValue {
    /// Returns the name of the value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::U32(_) => "u32",
            Self::F32(_) => "f32",
            Self::Bool(_) => "bool",
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::U32(value)
    }
}

impl From<f32> for MetadataValue {
    fn from(value: f32) -> Self {
        Self::F32(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Record metadata: field name to typed value.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A sparse vector: term to weight.
///
/// Iteration is in ascending term order, which fixes the order in which
/// scores are accumulated.
pub type SparseVector = BTreeMap<String, f32>;

/// The stored payload of one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// The user-facing id.
    pub id: String,
    /// Dense embedding.
    pub embedding: Option<Vec<f32>>,
    /// Document text.
    pub document: Option<String>,
    /// Metadata fields.
    pub metadata: Option<Metadata>,
    /// Sparse vector.
    pub sparse: Option<SparseVector>,
}

impl DataRecord {
    /// Creates an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Returns a metadata field.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// A record change resolved against existing state, ready to be routed to
/// every segment.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRecord {
    /// Internal id of the record.
    pub offset_id: OffsetId,
    /// Previous state, if the record existed.
    pub old: Option<DataRecord>,
    /// New state, or `None` if the record is deleted.
    pub new: Option<DataRecord>,
}

impl MaterializedRecord {
    /// Returns the user-facing id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map_or("", |r| r.id.as_str())
    }

    /// Returns whether this change deletes the record.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}
