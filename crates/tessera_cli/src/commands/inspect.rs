//! Inspect command implementation.

use super::{format_size, CliResult, Location, Store};
use serde::Serialize;
use tessera_core::BlockfileId;

/// Collection inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Collection id.
    pub collection: String,
    /// Published version inspected.
    pub version: u64,
    /// Segments in flush order.
    pub segments: Vec<SegmentStats>,
}

/// Statistics for one segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// Segment kind.
    pub kind: String,
    /// Segment id.
    pub id: String,
    /// Next offset id, for the record segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset_id: Option<u32>,
    /// Blockfiles with at least one commit.
    pub blockfiles: Vec<BlockfileStats>,
}

/// Statistics for one blockfile.
#[derive(Debug, Serialize)]
pub struct BlockfileStats {
    /// Blockfile name.
    pub name: String,
    /// Manifest version.
    pub version: u64,
    /// Number of blocks.
    pub blocks: usize,
    /// Number of entries.
    pub entries: u64,
    /// Approximate size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(location: &Location, collection: &str, at: Option<u64>, format: &str) -> CliResult<()> {
    let store = location.open()?;
    let result = inspect(&store, collection, at)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn inspect(store: &Store, collection: &str, at: Option<u64>) -> CliResult<InspectResult> {
    let token = store.token(collection, at)?;
    let mut segments = Vec::new();
    for segment in &token.segments {
        let mut blockfiles = Vec::new();
        for (name, &version) in &segment.blockfiles {
            let id = BlockfileId::new(token.collection, segment.kind, segment.id, name.clone());
            let manifest = store.provider.load_manifest(&id, version)?;
            blockfiles.push(BlockfileStats {
                name: name.clone(),
                version,
                blocks: manifest.entries.len(),
                entries: manifest.count(),
                size: manifest.size(),
            });
        }
        segments.push(SegmentStats {
            kind: segment.kind.to_string(),
            id: segment.id.to_string(),
            next_offset_id: segment.next_offset_id,
            blockfiles,
        });
    }
    Ok(InspectResult {
        collection: token.collection.to_string(),
        version: token.version,
        segments,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Collection {}", result.collection);
    println!("Version:   {}", result.version);
    for segment in &result.segments {
        println!();
        println!("{} segment {}", segment.kind, segment.id);
        if let Some(next) = segment.next_offset_id {
            println!("  next offset id: {next}");
        }
        if segment.blockfiles.is_empty() {
            println!("  (empty)");
        }
        for bf in &segment.blockfiles {
            println!(
                "  {:<14} v{:<4} {:>5} blocks {:>8} entries {:>10}",
                bf.name,
                bf.version,
                bf.blocks,
                bf.entries,
                format_size(bf.size)
            );
        }
    }
}
