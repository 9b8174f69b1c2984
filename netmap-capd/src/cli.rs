//! Command-line interface definitions for the capture daemon.

use std::path::PathBuf;

use clap::Parser;

/// Runs one or more netmap capture workers from a TOML config file.
#[derive(Parser)]
#[command(name = "netmap-capd", version, about)]
pub struct Cli {
    /// Path to the capture configuration file.
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Override the config file's `log_level`.
    #[arg(long)]
    pub log_level: Option<String>,
}
