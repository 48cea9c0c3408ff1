//! Peer process engine
//!
//! Wires configuration, storage and the swarm together and runs one peer
//! until every configured peer holds the complete file.

pub mod process;

use std::path::Path;
use std::sync::Arc;

pub use process::PeerProcess;

use crate::ShoalError;
use crate::config::ShoalConfig;
use crate::storage::{FilePieceStore, PieceStore};
use crate::wire::PeerId;

/// Opens the local peer's copy under `root`: the existing file for the seed,
/// a fresh pre-sized one for everyone else.
///
/// # Errors
/// - `ShoalError::UnknownPeer` - `local_id` is not in the peer list
/// - `ShoalError::Storage` - File missing, wrong size or not creatable
pub async fn open_file_store(
    config: &ShoalConfig,
    local_id: PeerId,
    root: &Path,
) -> Result<Arc<dyn PieceStore>, ShoalError> {
    let info = config
        .peer(local_id)
        .ok_or(ShoalError::UnknownPeer { peer_id: local_id })?;
    let layout = config.swarm.layout();
    let path = FilePieceStore::peer_path(root, local_id, &config.swarm.file_name);

    let store = if info.has_file {
        FilePieceStore::open_complete(&path, layout).await?
    } else {
        FilePieceStore::create_empty(&path, layout).await?
    };
    tracing::info!(path = %path.display(), seed = info.has_file, "Opened piece store");
    Ok(Arc::new(store))
}
