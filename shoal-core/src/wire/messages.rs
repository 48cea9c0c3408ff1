//! Length-prefixed message serialization and deserialization

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::PeerError;
use super::types::{PeerMessage, PieceIndex};

/// Bytes in the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Bytes in a piece index field.
const INDEX_LEN: u32 = 4;

/// Frame codec for post-handshake messages.
///
/// Encoding is total. Decoding enforces a per-connection ceiling on the
/// declared frame length so a hostile peer cannot make us allocate
/// arbitrarily large buffers.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_len: u32,
}

impl MessageCodec {
    /// Creates a codec rejecting frames whose declared length exceeds `max_frame_len`.
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }

    /// Returns the largest accepted declared length.
    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Serializes a message into a complete frame including its length prefix.
    pub fn serialize_message(message: &PeerMessage) -> Bytes {
        let payload_len = match message {
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 0,
            PeerMessage::Have { .. } | PeerMessage::Request { .. } => INDEX_LEN as usize,
            PeerMessage::Bitfield { bitfield } => bitfield.len(),
            PeerMessage::Piece { data, .. } => INDEX_LEN as usize + data.len(),
        };

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + 1 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(message.type_code());

        match message {
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece_index } | PeerMessage::Request { piece_index } => {
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => buf.extend_from_slice(bitfield),
            PeerMessage::Piece { piece_index, data } => {
                buf.put_u32(piece_index.as_u32());
                buf.extend_from_slice(data);
            }
        }

        buf.freeze()
    }

    /// Deserializes one complete frame (length prefix included).
    ///
    /// # Errors
    /// - `PeerError::MalformedMessage` - Truncated frame, bad length, unknown type or bad payload
    pub fn deserialize_message(&self, data: &[u8]) -> Result<PeerMessage, PeerError> {
        if data.len() < LENGTH_PREFIX_LEN {
            return Err(malformed("frame shorter than length prefix"));
        }

        let mut buf = data;
        let length = buf.get_u32();
        self.check_length(length)?;

        if buf.len() < length as usize {
            return Err(malformed(format!(
                "frame truncated: declared {length} bytes, {} available",
                buf.len()
            )));
        }
        if buf.len() > length as usize {
            return Err(malformed(format!(
                "{} trailing bytes after frame",
                buf.len() - length as usize
            )));
        }

        Self::deserialize_body(Bytes::copy_from_slice(buf))
    }

    /// Reads the next frame from `reader`.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    ///
    /// # Errors
    /// - `PeerError::MalformedMessage` - Bad frame, or stream closed mid-frame
    /// - `PeerError::Transport` - Underlying read failed
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Option<PeerMessage>, PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_LEN {
            let read = reader.read(&mut length_buf[filled..]).await?;
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(malformed("stream closed inside length prefix"));
            }
            filled += read;
        }

        let length = u32::from_be_bytes(length_buf);
        self.check_length(length)?;

        let mut body = BytesMut::zeroed(length as usize);
        match reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(malformed(format!(
                    "stream closed inside {length}-byte frame"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Self::deserialize_body(body.freeze()).map(Some)
    }

    fn check_length(&self, length: u32) -> Result<(), PeerError> {
        if length == 0 {
            return Err(malformed("zero-length frame"));
        }
        if length > self.max_frame_len {
            return Err(malformed(format!(
                "declared length {length} exceeds maximum {}",
                self.max_frame_len
            )));
        }
        Ok(())
    }

    /// Decodes type byte + payload.
    fn deserialize_body(mut body: Bytes) -> Result<PeerMessage, PeerError> {
        let message_id = body.get_u8();
        let payload_len = body.len();

        let expect_empty = |message: PeerMessage| {
            if payload_len == 0 {
                Ok(message)
            } else {
                Err(malformed(format!(
                    "{} carries unexpected {payload_len}-byte payload",
                    message.name()
                )))
            }
        };

        match message_id {
            0 => expect_empty(PeerMessage::Choke),
            1 => expect_empty(PeerMessage::Unchoke),
            2 => expect_empty(PeerMessage::Interested),
            3 => expect_empty(PeerMessage::NotInterested),
            4 | 6 => {
                if payload_len != INDEX_LEN as usize {
                    return Err(malformed(format!(
                        "index payload must be 4 bytes, got {payload_len}"
                    )));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                if message_id == 4 {
                    Ok(PeerMessage::Have { piece_index })
                } else {
                    Ok(PeerMessage::Request { piece_index })
                }
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            7 => {
                if payload_len < INDEX_LEN as usize {
                    return Err(malformed("piece payload shorter than its index"));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                Ok(PeerMessage::Piece {
                    piece_index,
                    data: body,
                })
            }
            _ => Err(malformed(format!("unknown message type {message_id}"))),
        }
    }
}

fn malformed(reason: impl Into<String>) -> PeerError {
    PeerError::MalformedMessage {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TEST_MAX: u32 = 1 << 16;

    fn codec() -> MessageCodec {
        MessageCodec::new(TEST_MAX)
    }

    fn arb_message() -> impl Strategy<Value = PeerMessage> {
        prop_oneof![
            Just(PeerMessage::Choke),
            Just(PeerMessage::Unchoke),
            Just(PeerMessage::Interested),
            Just(PeerMessage::NotInterested),
            any::<u32>().prop_map(|i| PeerMessage::Have {
                piece_index: PieceIndex::new(i)
            }),
            any::<u32>().prop_map(|i| PeerMessage::Request {
                piece_index: PieceIndex::new(i)
            }),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(|b| PeerMessage::Bitfield {
                bitfield: Bytes::from(b)
            }),
            (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..512)).prop_map(|(i, d)| {
                PeerMessage::Piece {
                    piece_index: PieceIndex::new(i),
                    data: Bytes::from(d),
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(message in arb_message()) {
            let frame = MessageCodec::serialize_message(&message);
            prop_assert_eq!(codec().deserialize_message(&frame).unwrap(), message);
        }

        #[test]
        fn prop_truncated_frame_is_malformed(message in arb_message(), cut in 0usize..1024) {
            let frame = MessageCodec::serialize_message(&message);
            let cut = cut % frame.len();
            let result = codec().deserialize_message(&frame[..cut]);
            let is_malformed = matches!(result, Err(PeerError::MalformedMessage { .. }));
            prop_assert!(is_malformed);
        }
    }

    #[test]
    fn test_have_wire_format() {
        let frame = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(3),
        });
        assert_eq!(&frame[..], &[0, 0, 0, 5, 4, 0, 0, 0, 3]);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut frame = vec![];
        frame.put_u32(TEST_MAX + 1);
        frame.put_u8(7);

        let result = codec().deserialize_message(&frame);
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = codec().deserialize_message(&[0, 0, 0, 1, 9]);
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }

    #[test]
    fn test_flag_message_with_payload_rejected() {
        let result = codec().deserialize_message(&[0, 0, 0, 2, 0, 1]);
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }

    #[test]
    fn test_short_have_rejected() {
        let result = codec().deserialize_message(&[0, 0, 0, 3, 4, 0, 1]);
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }

    #[tokio::test]
    async fn test_read_message_sequence_then_clean_eof() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&MessageCodec::serialize_message(&PeerMessage::Interested));
        stream.extend_from_slice(&MessageCodec::serialize_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(2),
            data: Bytes::from_static(b"abc"),
        }));
        let mut reader = &stream[..];

        let first = codec().read_message(&mut reader).await.unwrap();
        assert_eq!(first, Some(PeerMessage::Interested));

        let second = codec().read_message(&mut reader).await.unwrap();
        assert_eq!(
            second,
            Some(PeerMessage::Piece {
                piece_index: PieceIndex::new(2),
                data: Bytes::from_static(b"abc"),
            })
        );

        assert_eq!(codec().read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_message_mid_frame_eof_is_malformed() {
        let frame = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(1),
        });
        let mut reader = &frame[..frame.len() - 2];

        let result = codec().read_message(&mut reader).await;
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }

    #[tokio::test]
    async fn test_read_message_eof_inside_prefix_is_malformed() {
        let mut reader: &[u8] = &[0, 0];

        let result = codec().read_message(&mut reader).await;
        assert!(matches!(result, Err(PeerError::MalformedMessage { .. })));
    }
}
