//! TCP connection to one remote peer

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use super::PeerError;
use super::handshake::{ExpectedPeer, HandshakeCodec};
use super::messages::MessageCodec;
use super::types::{ConnectionDirection, PeerId, PeerMessage};

/// Handshaken TCP connection, ready to be split into read and write halves.
pub struct PeerConnection {
    remote_id: PeerId,
    direction: ConnectionDirection,
    address: SocketAddr,
    stream: TcpStream,
}

impl PeerConnection {
    /// Dials `address` and performs the handshake, requiring the remote to be `remote_id`.
    ///
    /// # Errors
    /// - `PeerError::Transport` - TCP connect or handshake I/O failed
    /// - `PeerError::HandshakeMismatch` - Remote announced a different ID or protocol
    pub async fn connect(
        address: SocketAddr,
        local_id: PeerId,
        remote_id: PeerId,
    ) -> Result<Self, PeerError> {
        let mut stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;

        let announced =
            HandshakeCodec::exchange(&mut stream, local_id, ExpectedPeer::Exactly(remote_id))
                .await?;

        Ok(Self {
            remote_id: announced,
            direction: ConnectionDirection::Outbound,
            address,
            stream,
        })
    }

    /// Performs the handshake on an accepted stream; the remote may be any of `allowed`.
    ///
    /// # Errors
    /// - `PeerError::Transport` - Handshake I/O failed
    /// - `PeerError::HandshakeMismatch` - Remote is not a configured peer or spoke another protocol
    pub async fn accept(
        mut stream: TcpStream,
        local_id: PeerId,
        allowed: &[PeerId],
    ) -> Result<Self, PeerError> {
        let address = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let remote_id =
            HandshakeCodec::exchange(&mut stream, local_id, ExpectedPeer::AnyOf(allowed)).await?;

        Ok(Self {
            remote_id,
            direction: ConnectionDirection::Inbound,
            address,
            stream,
        })
    }

    /// Returns the handshake-verified remote peer ID.
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    /// Returns which side opened the connection.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Returns the remote socket address.
    pub fn peer_address(&self) -> SocketAddr {
        self.address
    }

    /// Splits into an independent reader and writer.
    pub fn into_split(
        self,
        codec: MessageCodec,
    ) -> (MessageReader<OwnedReadHalf>, MessageWriter<OwnedWriteHalf>) {
        let (read_half, write_half) = self.stream.into_split();
        (
            MessageReader::new(read_half, codec),
            MessageWriter::new(write_half),
        )
    }
}

/// Read half decoding frames one at a time.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    codec: MessageCodec,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wraps a raw read half.
    pub fn new(reader: R, codec: MessageCodec) -> Self {
        Self {
            reader: BufReader::new(reader),
            codec,
        }
    }

    /// Waits for the next message; `Ok(None)` means the remote closed cleanly.
    ///
    /// # Errors
    /// - `PeerError::MalformedMessage` - Remote sent an invalid frame
    /// - `PeerError::Transport` - Socket read failed
    pub async fn next_message(&mut self) -> Result<Option<PeerMessage>, PeerError> {
        self.codec.read_message(&mut self.reader).await
    }
}

/// Write half owned by a single writer task.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wraps a raw write half.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one message.
    ///
    /// # Errors
    /// - `PeerError::Transport` - Socket write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        self.writer
            .write_all(&MessageCodec::serialize_message(message))
            .await?;
        Ok(())
    }

    /// Writes queued messages in order until every sender is dropped, then
    /// shuts the write side down.
    ///
    /// Messages queued before the last sender went away are still written,
    /// so a closing session flushes its final `have`s.
    ///
    /// # Errors
    /// - `PeerError::Transport` - Socket write failed; remaining messages are dropped
    pub async fn drain(
        mut self,
        mut outbox: mpsc::UnboundedReceiver<PeerMessage>,
    ) -> Result<(), PeerError> {
        while let Some(message) = outbox.recv().await {
            self.send(&message).await?;
        }
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::wire::PieceIndex;

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let codec = MessageCodec::new(1024);

        let acceptor = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let connection = PeerConnection::accept(stream, PeerId::new(2), &[PeerId::new(1)])
                .await
                .unwrap();
            assert_eq!(connection.direction(), ConnectionDirection::Inbound);
            let (mut reader, _writer) = connection.into_split(codec);
            reader.next_message().await.unwrap()
        });

        let connection = PeerConnection::connect(address, PeerId::new(1), PeerId::new(2))
            .await
            .unwrap();
        assert_eq!(connection.remote_id(), PeerId::new(2));
        assert_eq!(connection.direction(), ConnectionDirection::Outbound);

        let (_reader, writer) = connection.into_split(codec);
        let (sender, receiver) = mpsc::unbounded_channel();
        sender
            .send(PeerMessage::Piece {
                piece_index: PieceIndex::new(0),
                data: Bytes::from_static(b"piece"),
            })
            .unwrap();
        drop(sender);
        writer.drain(receiver).await.unwrap();

        let received = acceptor.await.unwrap();
        assert_eq!(
            received,
            Some(PeerMessage::Piece {
                piece_index: PieceIndex::new(0),
                data: Bytes::from_static(b"piece"),
            })
        );
    }

    #[tokio::test]
    async fn test_accept_rejects_unconfigured_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, PeerId::new(2), &[PeerId::new(1)]).await
        });

        let _ = PeerConnection::connect(address, PeerId::new(9), PeerId::new(2)).await;
        let result = acceptor.await.unwrap();
        assert!(matches!(result, Err(PeerError::HandshakeMismatch { .. })));
    }
}
