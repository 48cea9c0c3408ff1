//! Single-file piece store on disk

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{PieceLayout, PieceStore, StorageError};
use crate::wire::{PeerId, PieceIndex};

/// Piece store backed by one pre-sized file.
///
/// Piece `i` lives at byte offset `i * piece_size`. Held pieces are tracked
/// in memory; the file is the only thing written to disk.
#[derive(Debug)]
pub struct FilePieceStore {
    layout: PieceLayout,
    path: PathBuf,
    file: Mutex<File>,
    held: RwLock<Vec<bool>>,
}

impl FilePieceStore {
    /// Conventional location of a peer's copy: `<root>/peer_<id>/<file_name>`.
    pub fn peer_path(root: &Path, peer_id: PeerId, file_name: &str) -> PathBuf {
        root.join(format!("peer_{peer_id}")).join(file_name)
    }

    /// Opens an existing complete file for seeding.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be opened
    /// - `StorageError::SizeMismatch` - If its length differs from the layout's file size
    pub async fn open_complete(path: &Path, layout: PieceLayout) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        let actual = file.metadata().await?.len();
        if actual != layout.file_size() {
            return Err(StorageError::SizeMismatch {
                index: PieceIndex::new(0),
                expected: layout.file_size() as usize,
                actual: actual as usize,
            });
        }

        tracing::debug!(
            path = %path.display(),
            pieces = layout.piece_count(),
            "Opened complete file"
        );

        Ok(Self {
            layout,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            held: RwLock::new(vec![true; layout.piece_count() as usize]),
        })
    }

    /// Creates (or truncates) a file sized for the layout with no pieces held.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the directory or file cannot be created
    pub async fn create_empty(path: &Path, layout: PieceLayout) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(layout.file_size()).await?;

        tracing::debug!(path = %path.display(), size = layout.file_size(), "Created empty file");

        Ok(Self {
            layout,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            held: RwLock::new(vec![false; layout.piece_count() as usize]),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceStore for FilePieceStore {
    async fn piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        let len = self.layout.piece_len(index)?;
        if !self.held.read()[index.as_usize()] {
            return Err(StorageError::PieceNotFound { index });
        }

        let mut buf = BytesMut::zeroed(len);
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
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

        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
                .await?;
            file.write_all(&data).await?;
            file.flush().await?;
        }

        self.held.write()[index.as_usize()] = true;
        Ok(())
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.held
            .read()
            .get(index.as_usize())
            .copied()
            .unwrap_or(false)
    }

    fn is_complete(&self) -> bool {
        self.held.read().iter().all(|&held| held)
    }

    fn piece_count(&self) -> u32 {
        self.layout.piece_count()
    }
}
