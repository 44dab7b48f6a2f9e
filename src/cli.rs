//! Command-line interface for the Seam server.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "seam",
    version,
    about = "Federation gateway for multi-cluster resource APIs"
)]
pub struct Cli {
    /// Path to the gateway configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway and its notification listeners
    Serve,
    /// Create the resource mapping table and exit
    DbSync,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = crate::server::load_config(cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => crate::server::run(config).await,
        Command::DbSync => crate::server::db_sync(config).await,
    }
}
