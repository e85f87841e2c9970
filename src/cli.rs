use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// storplan - plan and commit Linux storage changes
#[derive(Parser)]
#[command(name = "storplan")]
#[command(about = "Model block storage, stage changes and commit them in a safe order")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON); defaults apply without one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: print the commands a commit would run, change nothing.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Open the engine read-only (shared lock, no commits)
    #[arg(long, global = true)]
    pub read_only: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the scheduled plan of a model snapshot
    Plan {
        /// Model snapshot (JSON)
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Verify the extent bookkeeping of a model snapshot
    Check {
        /// Model snapshot (JSON)
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Execute the plan of a model snapshot
    Commit {
        /// Model snapshot (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Write the model after the commit to this file
        #[arg(long)]
        save_model: Option<PathBuf>,
    },
    /// Parse a device-mapper table and print its targets and extent map
    DmTable {
        /// Table text as printed by `dmsetup table <name>`
        #[arg(short, long)]
        file: PathBuf,

        /// Extent size in KiB used for the map
        #[arg(long, default_value_t = 4096)]
        pe_size_k: u64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
