//! Shared swarm state: sessions, piece tracker and completion knowledge

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{Notify, mpsc};

use super::bitfield::Bitfield;
use super::events::{EventLog, SwarmEvent};
use super::session::PeerSession;
use super::tracker::PieceTracker;
use crate::storage::{PieceLayout, PieceStore};
use crate::wire::{ConnectionDirection, PeerError, PeerId, PeerMessage, PieceIndex};

/// Consecutive failed piece writes after which the local peer gives up.
pub const MAX_CONSECUTIVE_STORE_FAULTS: u32 = 3;

/// Shared handle to one neighbor's session.
pub type SessionHandle = Arc<Mutex<PeerSession>>;

/// Parameters for creating a swarm.
pub struct SwarmParams {
    pub local_id: PeerId,
    /// Every configured peer except the local one
    pub neighbors: Vec<PeerId>,
    pub layout: PieceLayout,
    pub store: Arc<dyn PieceStore>,
    pub events: EventLog,
    /// Drives piece selection
    pub rng: ChaCha8Rng,
}

/// State shared by every connection task, the scheduler and the engine.
///
/// Lock order is session, then map or tracker. No path holds two session
/// locks at once and no lock is held across an `.await`.
pub struct Swarm {
    pub(crate) local_id: PeerId,
    pub(crate) neighbors: Vec<PeerId>,
    pub(crate) layout: PieceLayout,
    pub(crate) tracker: Mutex<PieceTracker>,
    sessions: RwLock<BTreeMap<PeerId, SessionHandle>>,
    /// Neighbors known to hold every piece; never shrinks
    finished_peers: Mutex<BTreeSet<PeerId>>,
    pub(crate) store: Arc<dyn PieceStore>,
    pub(crate) events: EventLog,
    state_changed: Notify,
    store_faults: AtomicU32,
    local_fault: AtomicBool,
}

impl Swarm {
    /// Creates the swarm state; the local bitfield starts from what the store holds.
    pub fn new(params: SwarmParams) -> Self {
        let piece_count = params.layout.piece_count();
        assert_eq!(
            params.store.piece_count(),
            piece_count,
            "store and layout disagree on piece count"
        );
        let mut local = Bitfield::new(piece_count);
        for index in (0..piece_count).map(PieceIndex::new) {
            if params.store.has_piece(index) {
                local.set_piece(index);
            }
        }

        Self {
            local_id: params.local_id,
            neighbors: params.neighbors,
            layout: params.layout,
            tracker: Mutex::new(PieceTracker::new(local, params.rng)),
            sessions: RwLock::new(BTreeMap::new()),
            finished_peers: Mutex::new(BTreeSet::new()),
            store: params.store,
            events: params.events,
            state_changed: Notify::new(),
            store_faults: AtomicU32::new(0),
            local_fault: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn neighbors(&self) -> &[PeerId] {
        &self.neighbors
    }

    pub fn layout(&self) -> PieceLayout {
        self.layout
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Registers a handshaken neighbor and returns its session plus the
    /// receiving end of its outbox.
    ///
    /// The local bitfield is queued first if at least one piece is held.
    ///
    /// # Errors
    /// - `PeerError::HandshakeMismatch` - Peer is not a neighbor or already has a session
    pub fn attach(
        &self,
        remote_id: PeerId,
        direction: ConnectionDirection,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<PeerMessage>), PeerError> {
        if !self.neighbors.contains(&remote_id) {
            return Err(PeerError::HandshakeMismatch {
                reason: format!("peer {remote_id} is not a configured neighbor"),
            });
        }

        let (outbox, receiver) = mpsc::unbounded_channel();
        let session = PeerSession::new(remote_id, direction, self.layout.piece_count(), outbox);
        let handle = Arc::new(Mutex::new(session));

        // Held until the bitfield is queued so it precedes any broadcast `have`
        let session = handle.lock();
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&remote_id) {
                return Err(PeerError::HandshakeMismatch {
                    reason: format!("peer {remote_id} is already connected"),
                });
            }
            sessions.insert(remote_id, Arc::clone(&handle));
        }

        let local = self.tracker.lock().local().clone();
        if !local.is_empty() {
            session.send(PeerMessage::Bitfield {
                bitfield: local.to_bytes(),
            });
        }
        drop(session);

        tracing::debug!(peer = %remote_id, %direction, "Session attached");
        self.events.emit(SwarmEvent::ConnectionEstablished {
            peer: remote_id,
            direction,
        });
        self.notify_changed();
        Ok((handle, receiver))
    }

    /// Removes a neighbor's session and releases its pending requests.
    pub fn detach(&self, remote_id: PeerId) {
        let Some(handle) = self.sessions.write().remove(&remote_id) else {
            return;
        };

        let mut session = handle.lock();
        session.close();
        let released = session.drain_pending();
        if !released.is_empty() {
            let mut tracker = self.tracker.lock();
            for index in &released {
                tracker.release(*index, remote_id);
            }
        }
        drop(session);

        tracing::debug!(peer = %remote_id, released = released.len(), "Session detached");
        self.events.emit(SwarmEvent::ConnectionClosed { peer: remote_id });
        self.notify_changed();
    }

    /// Session for a connected neighbor.
    pub fn session(&self, remote_id: PeerId) -> Option<SessionHandle> {
        self.sessions.read().get(&remote_id).cloned()
    }

    /// Snapshot of every connected session, ordered by peer ID.
    pub fn session_handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of connected neighbors.
    pub fn connected_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true once every piece is held locally.
    pub fn is_local_complete(&self) -> bool {
        self.tracker.lock().is_complete()
    }

    /// Number of pieces held locally.
    pub fn held_count(&self) -> u32 {
        self.tracker.lock().local().count_ones()
    }

    /// Records that a neighbor announced holding every piece.
    pub(crate) fn mark_finished(&self, peer: PeerId) {
        if self.finished_peers.lock().insert(peer) {
            tracing::debug!(%peer, "Neighbor holds the complete file");
            self.notify_changed();
        }
    }

    /// Neighbors known to hold the complete file.
    pub fn finished_peers(&self) -> Vec<PeerId> {
        self.finished_peers.lock().iter().copied().collect()
    }

    /// Returns true once the local peer and every neighbor are known complete.
    pub fn is_swarm_complete(&self) -> bool {
        if !self.is_local_complete() {
            return false;
        }
        let finished = self.finished_peers.lock();
        self.neighbors.iter().all(|peer| finished.contains(peer))
    }

    /// Counts a failed piece write; returns true once the limit is reached.
    pub(crate) fn record_store_fault(&self) -> bool {
        let faults = self.store_faults.fetch_add(1, Ordering::SeqCst) + 1;
        if faults >= MAX_CONSECUTIVE_STORE_FAULTS {
            self.local_fault.store(true, Ordering::SeqCst);
            self.notify_changed();
            return true;
        }
        false
    }

    pub(crate) fn clear_store_faults(&self) {
        self.store_faults.store(0, Ordering::SeqCst);
    }

    /// Returns true if the store failed too many times in a row.
    pub fn has_local_fault(&self) -> bool {
        self.local_fault.load(Ordering::SeqCst)
    }

    /// Wakes whoever waits in [`Swarm::changed`].
    pub fn notify_changed(&self) {
        self.state_changed.notify_one();
    }

    /// Resolves after the next state change notification.
    pub async fn changed(&self) {
        self.state_changed.notified().await;
    }

    /// Closes every session and drops them from the map.
    ///
    /// Outboxes close once the connection tasks drop their handles, which
    /// lets each writer drain what is queued and shut down.
    pub fn close_all(&self) {
        let sessions: Vec<SessionHandle> = {
            let mut map = self.sessions.write();
            std::mem::take(&mut *map).into_values().collect()
        };
        for handle in sessions {
            handle.lock().close();
        }
    }
}
