//! Shoal Core - peer wire protocol engine for static-swarm file sharing
//!
//! A fixed set of peers assemble one file by trading fixed-size pieces over
//! direct TCP connections. This crate provides the wire codec, piece
//! storage, the per-neighbor session state machine, the choke scheduler and
//! the peer process that ties them together.

pub mod config;
pub mod engine;
pub mod storage;
pub mod swarm;
pub mod tracing_setup;
pub mod wire;

// Re-export main types for convenient access
pub use config::{ConfigError, ShoalConfig};
pub use engine::PeerProcess;
pub use storage::{PieceStore, StorageError};
pub use wire::{PeerError, PeerId, PieceIndex};

/// Errors that can stop a peer process.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Peer {peer_id} is not in the peer list")]
    UnknownPeer { peer_id: PeerId },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Piece store failed {faults} times in a row")]
    LocalFault { faults: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Config(_)
                | ShoalError::Configuration { .. }
                | ShoalError::UnknownPeer { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
