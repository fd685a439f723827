//! # tessera testkit
//!
//! Test utilities for tessera.
//!
//! This crate provides:
//! - Fixtures wiring an object backend, a block cache, a blockfile provider
//!   and a catalog together
//! - Property-based test generators using proptest
//! - A reference model of collection state for differential tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_collection() {
//!     let store = TestStore::new();
//!     let mut manager = store.create_collection();
//!     // ... apply, flush, read
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::*;
}

pub use fixtures::*;
pub use generators::*;
pub use model::*;
