//! Piece storage for the shared file.
//!
//! The engine reads and writes whole pieces by index through [`PieceStore`]
//! and never touches the filesystem itself. [`PieceLayout`] holds the
//! arithmetic that splits a file into pieces.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
pub use file::FilePieceStore;
pub use memory::MemoryPieceStore;

use crate::wire::PieceIndex;

/// Abstract interface for piece storage and retrieval.
///
/// Implementations must tolerate concurrent calls from every connection task.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Returns the bytes of a held piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::IndexOutOfRange` - If index is beyond the layout
    /// - `StorageError::PieceNotFound` - If the piece has not been stored yet
    /// - `StorageError::Io` - If the backing medium failed
    async fn piece(&self, index: PieceIndex) -> Result<Bytes, StorageError>;

    /// Stores a complete piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::IndexOutOfRange` - If index is beyond the layout
    /// - `StorageError::SizeMismatch` - If data length differs from the piece length
    /// - `StorageError::Io` - If the backing medium failed
    async fn store_piece(&self, index: PieceIndex, data: Bytes) -> Result<(), StorageError>;

    /// Returns true if the piece is held; out-of-range indices are never held.
    fn has_piece(&self, index: PieceIndex) -> bool;

    /// Returns true once every piece has been stored.
    fn is_complete(&self) -> bool;

    /// Returns total number of pieces.
    fn piece_count(&self) -> u32;
}

/// Largest piece that still fits a `piece` frame (type byte plus index) in a u32 length.
pub const MAX_PIECE_SIZE: u32 = u32::MAX - 5;

/// Returns the piece count for these sizes if it fits in a u32.
pub fn checked_piece_count(file_size: u64, piece_size: u32) -> Option<u32> {
    if piece_size == 0 {
        return None;
    }
    u32::try_from(file_size.div_ceil(u64::from(piece_size))).ok()
}

/// How a file of `file_size` bytes splits into pieces of `piece_size` bytes.
///
/// Every piece is `piece_size` long except possibly the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    file_size: u64,
    piece_size: u32,
}

impl PieceLayout {
    /// Creates a layout; both sizes must be positive.
    ///
    /// # Panics
    ///
    /// Panics if either size is zero, if `piece_size` exceeds [`MAX_PIECE_SIZE`]
    /// or if the piece count overflows a u32. Configuration validation rejects
    /// these first.
    pub fn new(file_size: u64, piece_size: u32) -> Self {
        assert!(file_size > 0, "file size must be positive");
        assert!(piece_size > 0, "piece size must be positive");
        assert!(piece_size <= MAX_PIECE_SIZE, "piece size too large for a frame");
        assert!(
            checked_piece_count(file_size, piece_size).is_some(),
            "piece count does not fit in u32"
        );
        Self {
            file_size,
            piece_size,
        }
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Nominal piece size in bytes.
    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// `ceil(file_size / piece_size)`.
    pub fn piece_count(&self) -> u32 {
        checked_piece_count(self.file_size, self.piece_size).unwrap_or(u32::MAX)
    }

    /// Byte length of the bitfield message payload.
    pub fn bitfield_len(&self) -> usize {
        self.piece_count().div_ceil(8) as usize
    }

    /// Returns true if the index addresses a piece of this layout.
    pub fn contains(&self, index: PieceIndex) -> bool {
        index.as_u32() < self.piece_count()
    }

    /// Byte offset of a piece within the file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_size)
    }

    /// Exact length of a piece; only the last one may be short.
    ///
    /// # Errors
    ///
    /// - `StorageError::IndexOutOfRange` - If index is beyond the layout
    pub fn piece_len(&self, index: PieceIndex) -> Result<usize, StorageError> {
        if !self.contains(index) {
            return Err(StorageError::IndexOutOfRange {
                index,
                piece_count: self.piece_count(),
            });
        }
        let start = self.piece_offset(index);
        let end = (start + u64::from(self.piece_size)).min(self.file_size);
        Ok((end - start) as usize)
    }

    /// Largest declared frame length a peer may legitimately send.
    pub fn max_frame_len(&self) -> u32 {
        let piece_frame = self.piece_size.saturating_add(1 + 4);
        let bitfield_frame = 1 + self.bitfield_len() as u32;
        piece_frame.max(bitfield_frame)
    }
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Requested piece has not been stored yet
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the piece that was not found
        index: PieceIndex,
    },

    /// Index is outside the file layout
    #[error("Piece {index} out of range for {piece_count} pieces")]
    IndexOutOfRange {
        /// Offending index
        index: PieceIndex,
        /// Number of pieces in the layout
        piece_count: u32,
    },

    /// Data length does not match the piece length
    #[error("Piece {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Index of the piece being written
        index: PieceIndex,
        /// Length dictated by the layout
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_count_rounds_up() {
        assert_eq!(PieceLayout::new(10, 4).piece_count(), 3);
        assert_eq!(PieceLayout::new(12, 4).piece_count(), 3);
        assert_eq!(PieceLayout::new(1, 4).piece_count(), 1);
        assert_eq!(PieceLayout::new(10_000_232, 32_768).piece_count(), 306);
    }

    #[test]
    fn test_last_piece_is_short() {
        let layout = PieceLayout::new(10, 4);
        assert_eq!(layout.piece_len(PieceIndex::new(0)).unwrap(), 4);
        assert_eq!(layout.piece_len(PieceIndex::new(2)).unwrap(), 2);
        assert!(matches!(
            layout.piece_len(PieceIndex::new(3)),
            Err(StorageError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_bitfield_len_matches_piece_count() {
        assert_eq!(PieceLayout::new(8 * 4, 4).bitfield_len(), 1);
        assert_eq!(PieceLayout::new(9 * 4, 4).bitfield_len(), 2);
    }

    #[test]
    fn test_max_frame_len_covers_piece_and_bitfield() {
        let layout = PieceLayout::new(100, 10);
        assert_eq!(layout.max_frame_len(), 15);

        // Tiny pieces: the bitfield frame is the larger one
        let layout = PieceLayout::new(1000, 1);
        assert_eq!(layout.max_frame_len(), 1 + 125);

        let layout = PieceLayout::new(u64::from(MAX_PIECE_SIZE), MAX_PIECE_SIZE);
        assert_eq!(layout.max_frame_len(), u32::MAX);
    }

    #[test]
    fn test_checked_piece_count_limits() {
        assert_eq!(checked_piece_count(10, 4), Some(3));
        assert_eq!(checked_piece_count(u64::from(u32::MAX), 1), Some(u32::MAX));
        assert_eq!(checked_piece_count(u64::from(u32::MAX) + 1, 1), None);
        assert_eq!(checked_piece_count(10, 0), None);
    }

    #[test]
    #[should_panic(expected = "piece size too large for a frame")]
    fn test_oversized_piece_rejected() {
        PieceLayout::new(u64::from(u32::MAX), u32::MAX);
    }

    #[test]
    #[should_panic(expected = "piece count does not fit in u32")]
    fn test_too_many_pieces_rejected() {
        PieceLayout::new(1 << 33, 1);
    }
}
