//! Shoal CLI - peer process entrypoint
//!
//! Runs one peer of a static swarm, or checks the swarm's configuration.

mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "shoal-peer")]
#[command(about = "A peer in a static file-sharing swarm")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
