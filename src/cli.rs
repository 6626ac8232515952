use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "node-hibernator")]
#[command(about = "Consensus-aware hibernation sidecar for blockchain nodes")]
#[command(version)]
pub struct Cli {
    /// Path to the hibernator config file (TOML or JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Log verbosity: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub verbosity: String,
}
