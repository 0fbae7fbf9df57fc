//! Headless command-line tool for the preset engine.
//!
//! ```bash
//! diverse catalog --config diverse.json            # load, validate, list presets
//! diverse select --config diverse.json --actor npc.json --seed 7
//! diverse snapshot inspect save.bin                # dump a snapshot as JSON
//! diverse snapshot pack records.json save.bin      # encode JSON records
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG` to change the filter.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "diverse",
    version,
    about = "Inspect preset catalogs, run selection and work with snapshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configured presets, then list them
    Catalog {
        /// JSON engine configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Print each preset's payload as well
        #[arg(short, long)]
        verbose: bool,
    },

    /// Select presets for an actor described in JSON
    Select {
        #[arg(short, long)]
        config: PathBuf,

        /// Actor description (formID, gender, keywords, factions, ...)
        #[arg(short, long)]
        actor: PathBuf,

        /// Seed for tie-breaking; random when omitted
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Work with snapshot blobs
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotAction {
    /// Decode a snapshot and print its records as JSON
    Inspect { file: PathBuf },

    /// Encode a JSON array of records into a snapshot
    Pack { records: PathBuf, out: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diverse=info,diverse_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Catalog { config, verbose } => commands::catalog(&config, verbose).await,
        Command::Select { config, actor, seed } => commands::select(&config, &actor, seed).await,
        Command::Snapshot { action } => match action {
            SnapshotAction::Inspect { file } => commands::inspect(&file).await,
            SnapshotAction::Pack { records, out } => commands::pack(&records, &out).await,
        },
    }
}
