//! Configuration for a Shoal peer.
//!
//! Swarm-wide settings come from `Common.cfg`, the static peer list from
//! `PeerInfo.cfg`. Process-local knobs (RNG seed, dial retries, shutdown
//! grace) live in [`RuntimeConfig`] and may be overridden from the
//! environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::{MAX_PIECE_SIZE, PieceLayout, checked_piece_count};
use crate::wire::PeerId;

/// File name of the swarm-wide settings.
pub const COMMON_CONFIG_FILE: &str = "Common.cfg";
/// File name of the ordered peer list.
pub const PEER_INFO_FILE: &str = "PeerInfo.cfg";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{}: missing key {key}", path.display())]
    MissingKey { path: PathBuf, key: &'static str },

    #[error("{}: invalid value {value:?} for {key}", path.display())]
    InvalidValue {
        path: PathBuf,
        key: &'static str,
        value: String,
    },

    #[error("{}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Complete configuration for one peer process.
#[derive(Debug, Clone)]
pub struct ShoalConfig {
    pub swarm: SwarmConfig,
    /// Every peer in configured order, including the local one
    pub peers: Vec<PeerInfo>,
    pub runtime: RuntimeConfig,
}

/// Settings shared by every peer, from `Common.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmConfig {
    pub preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

/// One line of `PeerInfo.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// Process-local settings that are not part of the shared files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Seed for every random decision; drawn from entropy when absent
    pub rng_seed: Option<u64>,
    /// Attempts per outbound dial before giving up on that neighbor
    pub connect_attempts: u32,
    /// Pause between failed dial attempts
    pub connect_backoff: Duration,
    /// Upper bound on draining write queues at shutdown
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            connect_attempts: 20,
            connect_backoff: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SwarmConfig {
    /// Parses `Key Value` lines; blank lines and `#` comments are skipped.
    ///
    /// # Errors
    /// - `ConfigError::Syntax` - Line is not `Key Value`
    /// - `ConfigError::MissingKey` - A required key is absent
    /// - `ConfigError::InvalidValue` - A numeric value does not parse
    /// - `ConfigError::Invalid` - Sizes or intervals out of range
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut values: Vec<(&str, &str)> = Vec::new();
        for (line_no, line) in meaningful_lines(text) {
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().map(str::trim).unwrap_or_default();
            if value.is_empty() {
                return Err(ConfigError::Syntax {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: format!("expected 'Key Value', got {line:?}"),
                });
            }
            values.push((key, value));
        }

        let lookup = |key: &'static str| {
            values
                .iter()
                .rev()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or(ConfigError::MissingKey {
                    path: path.to_path_buf(),
                    key,
                })
        };
        let number = |key: &'static str| -> Result<u64, ConfigError> {
            let value = lookup(key)?;
            value.parse().map_err(|_| ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key,
                value: value.to_string(),
            })
        };

        let piece_size = number("PieceSize")?;
        let config = Self {
            preferred_neighbors: number("NumberOfPreferredNeighbors")? as usize,
            unchoking_interval: Duration::from_secs(number("UnchokingInterval")?),
            optimistic_unchoking_interval: Duration::from_secs(number(
                "OptimisticUnchokingInterval",
            )?),
            file_name: lookup("FileName")?.to_string(),
            file_size: number("FileSize")?,
            piece_size: u32::try_from(piece_size).map_err(|_| ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key: "PieceSize",
                value: piece_size.to_string(),
            })?,
        };
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.file_size == 0 || self.piece_size == 0 {
            return Err(invalid("FileSize and PieceSize must be > 0"));
        }
        if u64::from(self.piece_size) > self.file_size {
            return Err(invalid("PieceSize cannot exceed FileSize"));
        }
        if self.piece_size > MAX_PIECE_SIZE {
            return Err(invalid("PieceSize too large to fit in a piece message"));
        }
        if checked_piece_count(self.file_size, self.piece_size).is_none() {
            return Err(invalid("FileSize / PieceSize gives more than u32::MAX pieces"));
        }
        if self.unchoking_interval.is_zero() || self.optimistic_unchoking_interval.is_zero() {
            return Err(invalid("unchoking intervals must be > 0"));
        }
        Ok(())
    }

    /// Piece layout of the shared file.
    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.file_size, self.piece_size)
    }
}

/// Parses `peerId host port hasFile` lines in order.
///
/// # Errors
/// - `ConfigError::Syntax` - Wrong field count or a non-numeric field
/// - `ConfigError::Invalid` - Port out of range, duplicate IDs, no peer
///   holding the file or no peers at all
pub fn parse_peer_info(text: &str, path: &Path) -> Result<Vec<PeerInfo>, ConfigError> {
    let mut peers: Vec<PeerInfo> = Vec::new();

    for (line_no, line) in meaningful_lines(text) {
        let syntax = |reason: &str| ConfigError::Syntax {
            path: path.to_path_buf(),
            line: line_no,
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [id, host, port, has_file] = fields.as_slice() else {
            return Err(syntax("expected 'peerId host port hasFile'"));
        };

        let id: u32 = id
            .parse()
            .map_err(|_| syntax("peerId must be an integer"))?;
        let port: u32 = port.parse().map_err(|_| syntax("port must be an integer"))?;
        let has_file: u32 = has_file
            .parse()
            .map_err(|_| syntax("hasFile must be an integer"))?;

        let port = u16::try_from(port)
            .ok()
            .filter(|&port| port >= 1)
            .ok_or_else(|| ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!("line {line_no}: port {port} out of range"),
            })?;

        peers.push(PeerInfo {
            peer_id: PeerId::new(id),
            host: host.to_string(),
            port,
            has_file: has_file == 1,
        });
    }

    validate_peers(&peers, path)?;
    Ok(peers)
}

fn validate_peers(peers: &[PeerInfo], path: &Path) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    if peers.is_empty() {
        return Err(invalid("no peers defined".to_string()));
    }
    for (position, peer) in peers.iter().enumerate() {
        if peers[..position].iter().any(|p| p.peer_id == peer.peer_id) {
            return Err(invalid(format!("duplicate peer ID {}", peer.peer_id)));
        }
    }
    if !peers.iter().any(|p| p.has_file) {
        return Err(invalid("no peer marked hasFile=1".to_string()));
    }
    Ok(())
}

/// Non-blank, non-comment lines with 1-based line numbers.
fn meaningful_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl ShoalConfig {
    /// Loads `Common.cfg` and `PeerInfo.cfg` from a directory with default
    /// runtime settings.
    ///
    /// # Errors
    /// - `ConfigError` - Either file is unreadable or invalid
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let common_path = dir.join(COMMON_CONFIG_FILE);
        let peers_path = dir.join(PEER_INFO_FILE);

        let swarm = SwarmConfig::parse(&read(&common_path)?, &common_path)?;
        let peers = parse_peer_info(&read(&peers_path)?, &peers_path)?;

        tracing::debug!(
            dir = %dir.display(),
            peers = peers.len(),
            pieces = swarm.layout().piece_count(),
            "Loaded configuration"
        );

        Ok(Self {
            swarm,
            peers,
            runtime: RuntimeConfig::default(),
        })
    }

    /// Applies `SHOAL_RNG_SEED`, `SHOAL_CONNECT_ATTEMPTS` and
    /// `SHOAL_SHUTDOWN_GRACE_MS`; unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(seed) = lookup("SHOAL_RNG_SEED").and_then(|v| v.parse().ok()) {
            self.runtime.rng_seed = Some(seed);
        }
        if let Some(attempts) = lookup("SHOAL_CONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.runtime.connect_attempts = attempts;
        }
        if let Some(millis) = lookup("SHOAL_SHUTDOWN_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.runtime.shutdown_grace = Duration::from_millis(millis);
        }
        self
    }

    /// Entry for a configured peer.
    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Every configured peer except `local`.
    pub fn neighbors_of(&self, local: PeerId) -> Vec<PeerId> {
        self.peers
            .iter()
            .map(|p| p.peer_id)
            .filter(|&id| id != local)
            .collect()
    }

    /// Peers listed before `local`; the local peer dials each of them.
    pub fn dial_targets(&self, local: PeerId) -> &[PeerInfo] {
        let position = self
            .peers
            .iter()
            .position(|p| p.peer_id == local)
            .unwrap_or(self.peers.len());
        &self.peers[..position]
    }

    /// Peers listed after `local`; the local peer accepts each of them.
    pub fn accept_from(&self, local: PeerId) -> Vec<PeerId> {
        self.peers
            .iter()
            .skip_while(|p| p.peer_id != local)
            .skip(1)
            .map(|p| p.peer_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON: &str = "\
NumberOfPreferredNeighbors 3
UnchokingInterval 5
OptimisticUnchokingInterval 10
FileName thefile
FileSize 2167705
PieceSize 16384
";

    const PEERS: &str = "\
# peerId host port hasFile
1001 localhost 6008 1
1002 localhost 6009 0

1003 localhost 6010 0
";

    fn path() -> PathBuf {
        PathBuf::from("test.cfg")
    }

    #[test]
    fn test_parse_common() {
        let config = SwarmConfig::parse(COMMON, &path()).unwrap();
        assert_eq!(config.preferred_neighbors, 3);
        assert_eq!(config.unchoking_interval, Duration::from_secs(5));
        assert_eq!(config.optimistic_unchoking_interval, Duration::from_secs(10));
        assert_eq!(config.file_name, "thefile");
        assert_eq!(config.layout().piece_count(), 133);
    }

    #[test]
    fn test_missing_key_reported() {
        let text = COMMON.replace("PieceSize 16384\n", "");
        let result = SwarmConfig::parse(&text, &path());
        assert!(matches!(
            result,
            Err(ConfigError::MissingKey {
                key: "PieceSize",
                ..
            })
        ));
    }

    #[test]
    fn test_piece_larger_than_file_rejected() {
        let text = COMMON.replace("PieceSize 16384", "PieceSize 9999999");
        let result = SwarmConfig::parse(&text, &path());
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_piece_frame_overflow_rejected() {
        let text = COMMON
            .replace("FileSize 2167705", "FileSize 4294967295")
            .replace("PieceSize 16384", "PieceSize 4294967295");
        assert!(matches!(
            SwarmConfig::parse(&text, &path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_piece_count_overflow_rejected() {
        let text = COMMON
            .replace("FileSize 2167705", "FileSize 8589934592")
            .replace("PieceSize 16384", "PieceSize 1");
        assert!(matches!(
            SwarmConfig::parse(&text, &path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let text = COMMON.replace("UnchokingInterval 5", "UnchokingInterval 0");
        assert!(matches!(
            SwarmConfig::parse(&text, &path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        let text = COMMON.replace("FileSize 2167705", "FileSize big");
        assert!(matches!(
            SwarmConfig::parse(&text, &path()),
            Err(ConfigError::InvalidValue {
                key: "FileSize",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_peers_in_order() {
        let peers = parse_peer_info(PEERS, &path()).unwrap();
        let ids: Vec<u32> = peers.iter().map(|p| p.peer_id.as_u32()).collect();
        assert_eq!(ids, vec![1001, 1002, 1003]);
        assert!(peers[0].has_file);
        assert_eq!(peers[2].port, 6010);
    }

    #[test]
    fn test_peer_line_validation() {
        let cases = [
            ("1001 localhost 6008\n", "field count"),
            ("1001 localhost 70000 0\n", "port range"),
            ("1001 localhost 0 0\n", "port zero"),
            ("abc localhost 6008 0\n", "peer id"),
            ("1001 a 6008 0\n1001 b 6009 0\n", "duplicate"),
            ("1001 a 6008 0\n1002 b 6009 0\n", "no seed"),
            ("# nothing\n", "empty"),
        ];
        for (text, case) in cases {
            assert!(parse_peer_info(text, &path()).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn test_dial_and_accept_plan() {
        let config = ShoalConfig {
            swarm: SwarmConfig::parse(COMMON, &path()).unwrap(),
            peers: parse_peer_info(PEERS, &path()).unwrap(),
            runtime: RuntimeConfig::default(),
        };
        let middle = PeerId::new(1002);

        let dials: Vec<PeerId> = config.dial_targets(middle).iter().map(|p| p.peer_id).collect();
        assert_eq!(dials, vec![PeerId::new(1001)]);
        assert_eq!(config.accept_from(middle), vec![PeerId::new(1003)]);
        assert_eq!(
            config.neighbors_of(middle),
            vec![PeerId::new(1001), PeerId::new(1003)]
        );
        assert!(config.dial_targets(PeerId::new(1001)).is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let config = ShoalConfig {
            swarm: SwarmConfig::parse(COMMON, &path()).unwrap(),
            peers: parse_peer_info(PEERS, &path()).unwrap(),
            runtime: RuntimeConfig::default(),
        };

        let config = config.with_overrides(|key| match key {
            "SHOAL_RNG_SEED" => Some("42".to_string()),
            "SHOAL_CONNECT_ATTEMPTS" => Some("not a number".to_string()),
            "SHOAL_SHUTDOWN_GRACE_MS" => Some("250".to_string()),
            _ => None,
        });

        assert_eq!(config.runtime.rng_seed, Some(42));
        assert_eq!(
            config.runtime.connect_attempts,
            RuntimeConfig::default().connect_attempts
        );
        assert_eq!(config.runtime.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_load_from_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(COMMON_CONFIG_FILE), COMMON).unwrap();
        fs::write(temp_dir.path().join(PEER_INFO_FILE), PEERS).unwrap();

        let config = ShoalConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert!(config.peer(PeerId::new(1003)).is_some());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShoalConfig::load(temp_dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }
}
