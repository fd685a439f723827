//! tessera CLI
//!
//! Maintenance tools for a directory-backed tessera object store.
//!
//! # Commands
//!
//! - `list` - List collections and their published versions
//! - `inspect` - Show the segments and blockfiles of a collection
//! - `verify` - Check every manifest and block a collection references
//! - `dump-manifest` - Print one blockfile manifest
//!
//! Stores written through an encrypting backend are read with
//! `--key-file`, a file holding the raw 32-byte key.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tessera object store tools.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory of the object store
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// File holding the 32-byte key of an encrypted store
    #[arg(global = true, long)]
    key_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List collections and their published versions
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the segments and blockfiles of a collection
    Inspect {
        /// Collection id
        collection: String,

        /// Inspect this published version instead of the current one
        #[arg(long)]
        at: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every manifest and block a collection references
    Verify {
        /// Collection id (all collections if omitted)
        collection: Option<String>,
    },

    /// Print one blockfile manifest
    DumpManifest {
        /// Collection id
        collection: String,

        /// Segment kind (record, metadata, vector)
        #[arg(short, long)]
        kind: String,

        /// Blockfile name
        #[arg(short, long)]
        blockfile: String,

        /// Manifest version (the published one if omitted)
        #[arg(long = "manifest-version")]
        version: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let location = |command: &str| -> Result<commands::Location, String> {
        let path = cli.path.clone().ok_or_else(|| format!("Store path required for {command}"))?;
        Ok(commands::Location {
            path,
            key_file: cli.key_file.clone(),
        })
    };

    match cli.command {
        Commands::List { format } => {
            commands::list::run(&location("list")?, &format)?;
        }
        Commands::Inspect {
            collection,
            at,
            format,
        } => {
            commands::inspect::run(&location("inspect")?, &collection, at, &format)?;
        }
        Commands::Verify { collection } => {
            commands::verify::run(&location("verify")?, collection.as_deref())?;
        }
        Commands::DumpManifest {
            collection,
            kind,
            blockfile,
            version,
            format,
        } => {
            commands::dump_manifest::run(&location("dump-manifest")?, &collection, &kind, &blockfile, version, &format)?;
        }
        Commands::Version => {
            println!("tessera CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("tessera core v{}", tessera_core::VERSION);
        }
    }

    Ok(())
}
