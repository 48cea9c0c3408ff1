//! Tracing setup for a Shoal peer
//!
//! Console output at the user's level, plus a per-peer log file that
//! captures everything, protocol events included.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::wire::PeerId;

/// Path of a peer's log file inside `logs_dir`.
pub fn peer_log_path(logs_dir: &Path, peer_id: PeerId) -> PathBuf {
    logs_dir.join(format!("log_peer_{peer_id}.log"))
}

/// Initialize tracing with dual output: console (user level) + file (everything)
///
/// # Arguments
/// * `console_level` - Log level for console output, unless `RUST_LOG` is set
/// * `logs_dir` - Directory for the log file (defaults to the working directory)
/// * `peer_id` - Local peer, names the file `log_peer_<id>.log`
///
/// The file is truncated on every start.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the directory or file cannot be created,
///   or a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
    peer_id: PeerId,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("."));
    create_dir_all(logs_path)?;

    let log_file_path = peer_log_path(logs_path, peer_id);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, peer_log={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Protocol events and above
    Info,
    /// Session and scheduler decisions
    Debug,
    /// Every message dispatched
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use shoal_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tracing_level().as_str().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_log_path() {
        let path = peer_log_path(Path::new("logs"), PeerId::new(1002));
        assert_eq!(path, Path::new("logs/log_peer_1002.log"));
    }

    #[test]
    fn test_cli_level_display() {
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
    }
}
