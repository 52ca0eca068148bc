//! Command line interface for the local runner.

use clap::Parser;
use std::path::PathBuf;

/// watchgrid - multi-region uptime monitoring engine (local runner)
#[derive(Debug, Parser)]
#[command(name = "watchgrid", version, about)]
pub struct Cli {
    /// JSON file with an array of target documents to seed the store
    #[arg(long)]
    pub targets: PathBuf,

    /// Region codes to tick (comma separated); defaults to us-central
    #[arg(long, value_delimiter = ',')]
    pub regions: Vec<String>,

    /// Seconds between tick rounds
    #[arg(long, default_value_t = 60)]
    pub interval_secs: u64,

    /// Append telemetry rows to this JSONL file instead of keeping them
    /// in memory
    #[arg(long)]
    pub telemetry_out: Option<PathBuf>,

    /// Run a single tick round and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
