//! kwengine CLI: keyword enrichment and cluster reconciliation.
//!
//! Fetches search-volume statistics for phrase lists under a shared rate
//! limit, and resolves keyword overlap between curated subclusters.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
