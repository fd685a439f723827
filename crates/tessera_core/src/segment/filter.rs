//! Metadata and document filters.

use crate::types::MetadataValue;
use serde::{Deserialize, Serialize};

/// A filter over record metadata.
///
/// Comparisons only match values of the same type: `Eq("n", U32(1))`
/// never matches a record whose `n` is `F32(1.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Where {
    /// Field equals value.
    Eq(String, MetadataValue),
    /// Field is present with a different value.
    Ne(String, MetadataValue),
    /// Field is greater than a numeric value.
    Gt(String, MetadataValue),
    /// Field is greater than or equal to a numeric value.
    Gte(String, MetadataValue),
    /// Field is less than a numeric value.
    Lt(String, MetadataValue),
    /// Field is less than or equal to a numeric value.
    Lte(String, MetadataValue),
    /// Field equals one of the values.
    In(String, Vec<MetadataValue>),
    /// Field is present and equals none of the values.
    Nin(String, Vec<MetadataValue>),
    /// Every clause matches.
    And(Vec<Where>),
    /// At least one clause matches.
    Or(Vec<Where>),
}

impl Where {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    /// `field` in `values`.
    pub fn is_in<V: Into<MetadataValue>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// `field` not in `values`.
    pub fn not_in<V: Into<MetadataValue>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::Nin(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Conjunction.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut clauses) => {
                clauses.push(other);
                Self::And(clauses)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match self {
            Self::Or(mut clauses) => {
                clauses.push(other);
                Self::Or(clauses)
            }
            first => Self::Or(vec![first, other]),
        }
    }
}

/// A filter over document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhereDocument {
    /// The document contains the text as a substring. Case sensitive.
    Contains(String),
    /// The document does not contain the text. Records without a
    /// document match.
    NotContains(String),
    /// Every clause matches.
    And(Vec<WhereDocument>),
    /// At least one clause matches.
    Or(Vec<WhereDocument>),
}

impl WhereDocument {
    /// `$contains`.
    pub fn contains(text: impl Into<String>) -> Self {
        Self::Contains(text.into())
    }

    /// `$not_contains`.
    pub fn not_contains(text: impl Into<String>) -> Self {
        Self::NotContains(text.into())
    }
}
