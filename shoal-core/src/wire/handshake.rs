//! Fixed-length handshake serialization and exchange

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PeerError;
use super::types::PeerId;

/// Protocol identifier opening every handshake.
pub const PROTOCOL_IDENTIFIER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// Length of the zero-filled reserved region.
pub const RESERVED_LEN: usize = 10;

/// Total handshake length: identifier + reserved + 4-byte peer ID.
pub const HANDSHAKE_LEN: usize = PROTOCOL_IDENTIFIER.len() + RESERVED_LEN + 4;

/// Which remote identities a handshake may accept.
#[derive(Debug, Clone, Copy)]
pub enum ExpectedPeer<'a> {
    /// Outbound dial: the remote must announce exactly this ID
    Exactly(PeerId),
    /// Inbound accept: any of these configured IDs
    AnyOf(&'a [PeerId]),
}

impl ExpectedPeer<'_> {
    fn admits(&self, peer_id: PeerId) -> bool {
        match self {
            ExpectedPeer::Exactly(expected) => *expected == peer_id,
            ExpectedPeer::AnyOf(allowed) => allowed.contains(&peer_id),
        }
    }
}

/// Handshake serialization utilities.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes the handshake announcing `peer_id`.
    pub fn serialize_handshake(peer_id: PeerId) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[..PROTOCOL_IDENTIFIER.len()].copy_from_slice(PROTOCOL_IDENTIFIER);
        buf[PROTOCOL_IDENTIFIER.len() + RESERVED_LEN..]
            .copy_from_slice(&peer_id.as_u32().to_be_bytes());
        buf
    }

    /// Extracts the announced peer ID from a received handshake.
    ///
    /// The reserved region is not inspected.
    ///
    /// # Errors
    /// - `PeerError::HandshakeMismatch` - Wrong length or protocol identifier
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerId, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::HandshakeMismatch {
                reason: format!("expected {HANDSHAKE_LEN} bytes, got {}", data.len()),
            });
        }

        if &data[..PROTOCOL_IDENTIFIER.len()] != PROTOCOL_IDENTIFIER {
            return Err(PeerError::HandshakeMismatch {
                reason: "unknown protocol identifier".to_string(),
            });
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&data[PROTOCOL_IDENTIFIER.len() + RESERVED_LEN..]);
        Ok(PeerId::new(u32::from_be_bytes(id_bytes)))
    }

    /// Sends our handshake, then reads and validates the remote one.
    ///
    /// Both sides write before reading, so neither blocks on the other.
    ///
    /// # Errors
    /// - `PeerError::Transport` - Socket failed while exchanging headers
    /// - `PeerError::HandshakeMismatch` - Bad identifier or unexpected peer ID
    pub async fn exchange<S>(
        stream: &mut S,
        local_id: PeerId,
        expected: ExpectedPeer<'_>,
    ) -> Result<PeerId, PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&Self::serialize_handshake(local_id))
            .await?;
        stream.flush().await?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;

        let remote_id = Self::deserialize_handshake(&buf)?;
        if !expected.admits(remote_id) {
            return Err(PeerError::HandshakeMismatch {
                reason: format!("unexpected peer ID {remote_id}"),
            });
        }

        Ok(remote_id)
    }
}
