//! Core types for the peer wire protocol

use std::fmt;

use bytes::Bytes;

/// Identifier of a peer in the static swarm configuration.
///
/// Ordering follows the numeric value, which is how the configured peer list
/// is written. Sent on the wire as a big-endian `u32` in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u32);

impl PeerId {
    /// Creates a peer ID from its configured numeric value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a piece within the shared file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize` for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed messages exchanged after the handshake.
///
/// The set is closed: every frame on the wire decodes to exactly one of
/// these variants or is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Sender will not serve requests from the receiver
    Choke,
    /// Sender will serve requests from the receiver
    Unchoke,
    /// Sender wants pieces the receiver holds
    Interested,
    /// Sender wants nothing the receiver holds
    NotInterested,
    /// Sender has acquired a piece
    Have {
        /// Index of the newly held piece
        piece_index: PieceIndex,
    },
    /// Sender's complete piece availability, MSB-first
    Bitfield {
        /// Raw bitfield bytes as sent on the wire
        bitfield: Bytes,
    },
    /// Ask the receiver for a whole piece
    Request {
        /// Index of the requested piece
        piece_index: PieceIndex,
    },
    /// Whole piece payload
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Raw piece bytes
        data: Bytes,
    },
}

impl PeerMessage {
    /// Wire type code of this message.
    pub fn type_code(&self) -> u8 {
        match self {
            PeerMessage::Choke => 0,
            PeerMessage::Unchoke => 1,
            PeerMessage::Interested => 2,
            PeerMessage::NotInterested => 3,
            PeerMessage::Have { .. } => 4,
            PeerMessage::Bitfield { .. } => 5,
            PeerMessage::Request { .. } => 6,
            PeerMessage::Piece { .. } => 7,
        }
    }

    /// Short lowercase name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
        }
    }
}

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Local peer dialed the remote
    Outbound,
    /// Remote peer dialed us
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_ordering() {
        let first = PeerId::new(1001);
        let second = PeerId::new(1002);
        assert!(first < second);
        assert_eq!(first.to_string(), "1001");
    }

    #[test]
    fn test_type_codes_are_distinct() {
        let messages = [
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(0),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::new(),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(0),
            },
            PeerMessage::Piece {
                piece_index: PieceIndex::new(0),
                data: Bytes::new(),
            },
        ];

        let codes: Vec<u8> = messages.iter().map(PeerMessage::type_code).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
