//! In-memory piece store

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{PieceLayout, PieceStore, StorageError};
use crate::wire::PieceIndex;

/// Piece store keeping every piece in memory.
#[derive(Debug)]
pub struct MemoryPieceStore {
    layout: PieceLayout,
    pieces: RwLock<Vec<Option<Bytes>>>,
}

impl MemoryPieceStore {
    /// Creates a store holding no pieces.
    pub fn empty(layout: PieceLayout) -> Self {
        Self {
            layout,
            pieces: RwLock::new(vec![None; layout.piece_count() as usize]),
        }
    }

    /// Creates a complete store from the whole file contents.
    ///
    /// # Errors
    ///
    /// - `StorageError::SizeMismatch` - If contents length differs from the layout's file size
    pub fn with_contents(layout: PieceLayout, contents: &[u8]) -> Result<Self, StorageError> {
        if contents.len() as u64 != layout.file_size() {
            return Err(StorageError::SizeMismatch {
                index: PieceIndex::new(0),
                expected: layout.file_size() as usize,
                actual: contents.len(),
            });
        }

        let pieces = contents
            .chunks(layout.piece_size() as usize)
            .map(|chunk| Some(Bytes::copy_from_slice(chunk)))
            .collect();

        Ok(Self {
            layout,
            pieces: RwLock::new(pieces),
        })
    }

    /// Creates a store preloaded with selected pieces of `contents`.
    ///
    /// # Errors
    ///
    /// - `StorageError::SizeMismatch` - If contents length differs from the layout's file size
    /// - `StorageError::IndexOutOfRange` - If a listed index is beyond the layout
    pub fn with_pieces(
        layout: PieceLayout,
        contents: &[u8],
        held: &[PieceIndex],
    ) -> Result<Self, StorageError> {
        let full = Self::with_contents(layout, contents)?;
        let store = Self::empty(layout);
        {
            let source = full.pieces.read();
            let mut target = store.pieces.write();
            for &index in held {
                layout.piece_len(index)?;
                target[index.as_usize()] = source[index.as_usize()].clone();
            }
        }
        Ok(store)
    }

    /// Reassembles the file from stored pieces, if complete.
    pub fn contents(&self) -> Option<Vec<u8>> {
        let pieces = self.pieces.read();
        let mut contents = Vec::with_capacity(self.layout.file_size() as usize);
        for piece in pieces.iter() {
            contents.extend_from_slice(piece.as_ref()?);
        }
        Some(contents)
    }

    /// Indices currently held, ascending.
    pub fn held_pieces(&self) -> Vec<PieceIndex> {
        self.pieces
            .read()
            .iter()
            .enumerate()
            .filter(|(_, piece)| piece.is_some())
            .map(|(index, _)| PieceIndex::new(index as u32))
            .collect()
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.layout.piece_len(index)?;
        self.pieces.read()[index.as_usize()]
            .clone()
            .ok_or(StorageError::PieceNotFound { index })
    }

    async fn store_piece(&self, index: PieceIndex, data: Bytes) -> Result<(), StorageError> {
        let expected = self.layout.piece_len(index)?;
        if data.len() != expected {
            return Err(StorageError::SizeMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }
        self.pieces.write()[index.as_usize()] = Some(data);
        Ok(())
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces
            .read()
            .get(index.as_usize())
            .is_some_and(Option::is_some)
    }

    fn is_complete(&self) -> bool {
        self.pieces.read().iter().all(Option::is_some)
    }

    fn piece_count(&self) -> u32 {
        self.layout.piece_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PieceLayout {
        PieceLayout::new(10, 4)
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let store = MemoryPieceStore::empty(layout());
        assert!(!store.is_complete());

        store
            .store_piece(PieceIndex::new(2), Bytes::from_static(b"xy"))
            .await
            .unwrap();

        let piece = store.piece(PieceIndex::new(2)).await.unwrap();
        assert_eq!(&piece[..], b"xy");
        assert_eq!(store.held_pieces(), vec![PieceIndex::new(2)]);
    }

    #[tokio::test]
    async fn test_missing_piece_not_found() {
        let store = MemoryPieceStore::empty(layout());
        let result = store.piece(PieceIndex::new(0)).await;
        assert!(matches!(result, Err(StorageError::PieceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_wrong_size_rejected() {
        let store = MemoryPieceStore::empty(layout());
        let result = store
            .store_piece(PieceIndex::new(0), Bytes::from_static(b"abc"))
            .await;
        assert!(matches!(result, Err(StorageError::SizeMismatch { .. })));
    }

    #[test]
    fn test_with_contents_is_complete() {
        let store = MemoryPieceStore::with_contents(layout(), b"0123456789").unwrap();
        assert!(store.is_complete());
        assert_eq!(store.piece_count(), 3);
        assert_eq!(store.contents().unwrap(), b"0123456789");
    }

    #[test]
    fn test_with_pieces_holds_only_selected() {
        let store =
            MemoryPieceStore::with_pieces(layout(), b"0123456789", &[PieceIndex::new(1)]).unwrap();
        assert_eq!(store.held_pieces(), vec![PieceIndex::new(1)]);
        assert!(store.has_piece(PieceIndex::new(1)));
        assert!(!store.has_piece(PieceIndex::new(0)));
        assert!(!store.has_piece(PieceIndex::new(3)));
        assert!(store.contents().is_none());
    }
}
