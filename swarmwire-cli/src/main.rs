//! Swarmwire CLI - Command-line interface
//!
//! Seeds a file to peers, fetches one from a peer, or probes what a peer
//! advertises.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use swarmwire_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "swarmwire")]
#[command(about = "A BitTorrent peer-wire client")]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
