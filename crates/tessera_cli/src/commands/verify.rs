//! Verify command implementation.
//!
//! Loads every manifest a published collection version references and reads
//! every block through it. Content ids, frame checksums and the per-block
//! counts and key bounds recorded in the manifest are all checked on the way.

use super::{CliResult, Location, Store};
use tessera_core::{BlockfileId, Catalog, CollectionVersion, KeyRange};
use tracing::debug;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of manifests checked.
    pub manifests_checked: usize,
    /// Number of blocks checked.
    pub blocks_checked: usize,
    /// Number of entries read.
    pub entries_read: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(location: &Location, collection: Option<&str>) -> CliResult<()> {
    println!("Verifying object store at {}", location.path.display());
    println!();

    let store = location.open()?;
    let tokens = match collection {
        Some(id) => vec![store.token(id, None)?],
        None => {
            let mut tokens = Vec::new();
            for id in store.catalog.collections()? {
                if let Some(token) = store.catalog.current(id)? {
                    tokens.push(token);
                }
            }
            tokens
        }
    };

    let mut ok = true;
    for token in &tokens {
        let result = verify(&store, token);
        println!(
            "Collection {} v{}: {} manifests, {} blocks, {} entries",
            token.collection, token.version, result.manifests_checked, result.blocks_checked, result.entries_read
        );
        for error in &result.errors {
            println!("    ERROR: {error}");
        }
        ok &= result.is_ok();
    }

    println!();
    if ok {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

fn verify(store: &Store, token: &CollectionVersion) -> VerifyResult {
    let mut result = VerifyResult::default();
    for segment in &token.segments {
        for (name, &version) in &segment.blockfiles {
            let id = BlockfileId::new(token.collection, segment.kind, segment.id, name.clone());
            let reader = match store.provider.reader(&id, version) {
                Ok(reader) => reader,
                Err(e) => {
                    result.errors.push(format!("{id}@{version}: {e}"));
                    continue;
                }
            };
            result.manifests_checked += 1;
            result.blocks_checked += reader.manifest().entries.len();
            for entry in reader.scan(KeyRange::all()) {
                match entry {
                    Ok(_) => result.entries_read += 1,
                    Err(e) => {
                        result.errors.push(format!("{id}@{version}: {e}"));
                        break;
                    }
                }
            }
            debug!(blockfile = %id, version, "verified blockfile");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::populated_store;
    use std::fs;
    use std::path::Path;

    #[test]
    fn clean_store_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let collection = populated_store(dir.path());
        let store = Store::open(dir.path(), None).unwrap();
        let token = store.token(&collection.to_string(), None).unwrap();
        let result = verify(&store, &token);
        assert!(result.is_ok(), "{:?}", result.errors);
        assert!(result.manifests_checked > 0);
        assert!(result.entries_read > 0);
    }

    #[test]
    fn damaged_block_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let collection = populated_store(dir.path());
        let blocks = walk(dir.path())
            .into_iter()
            .filter(|p| p.to_string_lossy().contains("blocks"))
            .collect::<Vec<_>>();
        assert!(!blocks.is_empty());
        for block in &blocks {
            let mut bytes = fs::read(block).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            fs::write(block, bytes).unwrap();
        }

        let store = Store::open(dir.path(), None).unwrap();
        let token = store.token(&collection.to_string(), None).unwrap();
        assert!(!verify(&store, &token).is_ok());
    }

    fn walk(root: &Path) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        for entry in fs::read_dir(root).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
        files
    }
}
