//! # tessera storage
//!
//! Object backend trait and implementations for tessera.
//!
//! This crate provides the lowest-level storage abstraction: a durable
//! key → bytes store. Backends are **opaque object stores** - they do not
//! interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple object stores (put, get, delete, list)
//! - Strong read-after-write consistency on a given key
//! - No knowledge of blocks, manifests or segments
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - Objects as files under a root directory
//! - `EncryptedBackend` - Wrapper that adds AES-256-GCM encryption
//!   (`encryption` feature, on by default)
//! - [`FaultyBackend`] - Wrapper that counts calls and injects failures
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{ObjectBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put("collections/a/blocks/1", b"hello world").unwrap();
//! let data = backend.get("collections/a/blocks/1").unwrap();
//! assert_eq!(&data[..], b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
#[cfg(feature = "encryption")]
mod encrypted;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::ObjectBackend;
#[cfg(feature = "encryption")]
pub use encrypted::{EncryptedBackend, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{StorageError, StorageResult};
pub use faulty::FaultyBackend;
pub use file::FileBackend;
pub use memory::InMemoryBackend;
