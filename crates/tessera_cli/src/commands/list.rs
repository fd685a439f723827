//! List command implementation.

use super::{CliResult, Location, Store};
use serde::Serialize;
use tessera_core::Catalog;

/// One listed collection.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    /// Collection id.
    pub id: String,
    /// Current published version.
    pub version: u64,
    /// Number of published versions kept in the store.
    pub versions_kept: usize,
}

/// Runs the list command.
pub fn run(location: &Location, format: &str) -> CliResult<()> {
    let summaries = collect(&location.open()?)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summaries)?),
        _ => {
            if summaries.is_empty() {
                println!("No collections");
            }
            for summary in &summaries {
                println!(
                    "{}  version {} ({} kept)",
                    summary.id, summary.version, summary.versions_kept
                );
            }
        }
    }
    Ok(())
}

fn collect(store: &Store) -> CliResult<Vec<CollectionSummary>> {
    let mut summaries = Vec::new();
    for id in store.catalog.collections()? {
        let history = store.catalog.history(id)?;
        let Some(current) = store.catalog.current(id)? else {
            continue;
        };
        summaries.push(CollectionSummary {
            id: id.to_string(),
            version: current.version,
            versions_kept: history.len(),
        });
    }
    Ok(summaries)
}
