//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use shoal_core::config::ShoalConfig;
use shoal_core::engine::{PeerProcess, open_file_store};
use shoal_core::swarm::TracingEventSink;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};
use shoal_core::{PeerId, ShoalError};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one peer until every peer holds the complete file
    Run {
        /// This peer's ID from PeerInfo.cfg
        peer_id: u32,
        /// Directory holding Common.cfg, PeerInfo.cfg and the peer_<id> folders
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Console log level
        #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
        log_level: CliLogLevel,
        /// Directory for log_peer_<id>.log (defaults to --dir)
        #[arg(long)]
        logs_dir: Option<PathBuf>,
        /// Seed for every random decision
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Validate the configuration and print the connection plan
    Check {
        /// Directory holding Common.cfg and PeerInfo.cfg
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error that stopped the command, with context
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            peer_id,
            dir,
            log_level,
            logs_dir,
            seed,
        } => run_peer(PeerId::new(peer_id), &dir, log_level, logs_dir, seed).await,
        Commands::Check { dir } => check_config(&dir),
    }
}

/// Run one peer process to completion
///
/// # Errors
/// - Configuration missing or invalid
/// - Piece store could not be opened
/// - Piece store failed repeatedly while running
pub async fn run_peer(
    peer_id: PeerId,
    dir: &Path,
    log_level: CliLogLevel,
    logs_dir: Option<PathBuf>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let logs_dir = logs_dir.unwrap_or_else(|| dir.to_path_buf());
    init_tracing(log_level.as_tracing_level(), Some(&logs_dir), peer_id)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    let mut config = ShoalConfig::load(dir)
        .with_context(|| format!("Failed to load configuration from {}", dir.display()))?
        .with_env_overrides();
    if seed.is_some() {
        config.runtime.rng_seed = seed;
    }
    tracing::info!(
        peer = %peer_id,
        dir = %dir.display(),
        peers = config.peers.len(),
        "Configuration loaded"
    );

    let store = open_file_store(&config, peer_id, dir)
        .await
        .with_context(|| format!("Failed to open piece store for peer {peer_id}"))?;

    let process = PeerProcess::bind(config, peer_id, store, Arc::new(TracingEventSink))
        .await
        .map_err(explain)?;
    process.run().await.map_err(explain)?;

    println!("Peer {peer_id}: every peer holds the complete file");
    Ok(())
}

fn explain(error: ShoalError) -> anyhow::Error {
    let hint = if error.is_user_error() {
        "Check Common.cfg and PeerInfo.cfg"
    } else if matches!(error, ShoalError::LocalFault { .. }) {
        "Peer stopped on a local fault"
    } else {
        "Peer failed"
    };
    anyhow::Error::new(error).context(hint)
}

/// Print the piece layout and who dials whom
///
/// # Errors
/// - Configuration missing or invalid
pub fn check_config(dir: &Path) -> anyhow::Result<()> {
    let config = ShoalConfig::load(dir)
        .with_context(|| format!("Invalid configuration in {}", dir.display()))?;

    let swarm = &config.swarm;
    let layout = swarm.layout();
    println!("File: {} ({} bytes)", swarm.file_name, swarm.file_size);
    println!(
        "Pieces: {} of {} bytes, bitfield {} bytes",
        layout.piece_count(),
        swarm.piece_size,
        layout.bitfield_len()
    );
    println!(
        "Preferred neighbors: {}, unchoking every {}s, optimistic every {}s",
        swarm.preferred_neighbors,
        swarm.unchoking_interval.as_secs(),
        swarm.optimistic_unchoking_interval.as_secs()
    );

    for peer in &config.peers {
        let dials: Vec<String> = config
            .dial_targets(peer.peer_id)
            .iter()
            .map(|p| p.peer_id.to_string())
            .collect();
        let accepts: Vec<String> = config
            .accept_from(peer.peer_id)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "Peer {} at {}:{}{}: dials [{}], accepts [{}]",
            peer.peer_id,
            peer.host,
            peer.port,
            if peer.has_file { " (seed)" } else { "" },
            dials.join(", "),
            accepts.join(", ")
        );
    }

    Ok(())
}
