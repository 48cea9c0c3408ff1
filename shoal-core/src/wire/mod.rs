//! Peer wire protocol: handshake, message framing and TCP connections.
//!
//! Every connection opens with a fixed 32-byte handshake and then carries
//! length-prefixed typed messages. Decoding produces the closed
//! [`PeerMessage`] enum; anything else is a [`PeerError::MalformedMessage`].

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

pub use connection::{MessageReader, MessageWriter, PeerConnection};
pub use handshake::{ExpectedPeer, HANDSHAKE_LEN, HandshakeCodec, PROTOCOL_IDENTIFIER};
pub use messages::MessageCodec;
pub use types::{ConnectionDirection, PeerId, PeerMessage, PieceIndex};

use crate::storage::StorageError;

/// Errors raised while talking to a single remote peer.
///
/// All of them are scoped to one connection: the engine closes that
/// connection and keeps every other one running.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Handshake mismatch: {reason}")]
    HandshakeMismatch { reason: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Peer {peer} is not connected")]
    ConnectionClosed { peer: PeerId },

    #[error("Transport error")]
    Transport(#[from] std::io::Error),

    #[error("Storage error")]
    Storage(#[from] StorageError),
}
