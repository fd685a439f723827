//! The copy-on-write blockfile store.
//!
//! A blockfile is a sorted map persisted as immutable, content-addressed
//! blocks. Each commit writes the blocks it touched and then a new root
//! manifest listing every block of the new version. Untouched blocks are
//! referenced again by id, never rewritten.
//!
//! Readers pin one manifest and never observe later commits. Writers are
//! serialized per blockfile by the lease table in [`BlockfileProvider`].

mod block;
mod key;
mod manifest;
mod provider;
mod reader;
mod value;
mod writer;

pub use block::{entries_size, entry_size, Block, PrefixSummary};
pub use key::{BlockKey, KeyPart, KeyRange};
pub use manifest::{Manifest, ManifestEntry};
pub use provider::{BlockfileId, BlockfileProvider, WriterLease};
pub use reader::{Reader, Scan};
pub use value::BlockValue;
pub use writer::Writer;
