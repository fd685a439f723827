//! Dump-manifest command implementation.

use super::{format_size, CliResult, Location, Store};
use tessera_core::{BlockfileId, Manifest, SegmentKind};

/// Runs the dump-manifest command.
pub fn run(
    location: &Location,
    collection: &str,
    kind: &str,
    blockfile: &str,
    version: Option<u64>,
    format: &str,
) -> CliResult<()> {
    let store = location.open()?;
    let manifest = load(&store, collection, kind, blockfile, version)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&manifest)?),
        _ => {
            println!("Blockfile {} v{}", manifest.blockfile, manifest.version);
            println!(
                "{} blocks, {} entries, {}",
                manifest.entries.len(),
                manifest.count(),
                format_size(manifest.size())
            );
            for entry in &manifest.entries {
                println!(
                    "  {}  [{} .. {}]  {} entries  {}",
                    &entry.block_id[..12.min(entry.block_id.len())],
                    entry.start,
                    entry.end,
                    entry.count,
                    format_size(entry.size)
                );
            }
        }
    }
    Ok(())
}

fn load(
    store: &Store,
    collection: &str,
    kind: &str,
    blockfile: &str,
    version: Option<u64>,
) -> CliResult<Manifest> {
    let token = store.token(collection, None)?;
    let kind = SegmentKind::parse(kind).ok_or_else(|| format!("Unknown segment kind {kind:?}"))?;
    let segment = token
        .segment(kind)
        .ok_or_else(|| format!("Collection has no {kind} segment"))?;
    let version = version.unwrap_or_else(|| segment.version_of(blockfile));
    let id = BlockfileId::new(token.collection, kind, segment.id, blockfile);
    Ok(store.provider.load_manifest(&id, version)?.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::populated_store;

    #[test]
    fn loads_published_and_empty_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let collection = populated_store(dir.path()).to_string();
        let store = Store::open(dir.path(), None).unwrap();

        let manifest = load(&store, &collection, "record", "user_id_to_id", None).unwrap();
        assert_eq!(manifest.count(), 2);
        let empty = load(&store, &collection, "vector", "nonexistent", None).unwrap();
        assert_eq!(empty.version, 0);
        assert!(load(&store, &collection, "bogus", "x", None).is_err());
        assert!(load(&store, &collection, "record", "user_id_to_id", Some(9)).is_err());
    }
}
