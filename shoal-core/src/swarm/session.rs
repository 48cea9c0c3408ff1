//! Per-neighbor session state

use std::collections::HashSet;

use tokio::sync::mpsc;

use super::bitfield::Bitfield;
use crate::wire::{ConnectionDirection, PeerId, PeerMessage, PieceIndex};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Handshake not yet verified
    #[default]
    Handshaking,
    /// Exchanging typed messages
    Connected,
    /// Terminal: socket error, protocol error or shutdown
    Closed,
}

/// State the local peer keeps about one connected neighbor.
///
/// Mutated by the neighbor's dispatch path and by the scheduler, always
/// under the session's own lock.
#[derive(Debug)]
pub struct PeerSession {
    remote_id: PeerId,
    direction: ConnectionDirection,
    state: SessionState,
    /// Pieces the neighbor holds, as last announced
    remote_pieces: Bitfield,
    /// We refuse to serve this neighbor
    am_choking: bool,
    /// This neighbor refuses to serve us
    am_choked: bool,
    /// We want something this neighbor holds
    am_interested: bool,
    /// This neighbor wants something we hold
    peer_interested: bool,
    /// Piece bytes received from this neighbor since the last ranking
    downloaded_this_interval: u64,
    /// Requests sent to this neighbor and not yet answered
    pending_requests: HashSet<PieceIndex>,
    outbox: mpsc::UnboundedSender<PeerMessage>,
}

impl PeerSession {
    /// Creates a session for a freshly handshaken neighbor.
    ///
    /// Both directions start choked and uninterested.
    pub fn new(
        remote_id: PeerId,
        direction: ConnectionDirection,
        piece_count: u32,
        outbox: mpsc::UnboundedSender<PeerMessage>,
    ) -> Self {
        Self {
            remote_id,
            direction,
            state: SessionState::Connected,
            remote_pieces: Bitfield::new(piece_count),
            am_choking: true,
            am_choked: true,
            am_interested: false,
            peer_interested: false,
            downloaded_this_interval: 0,
            pending_requests: HashSet::new(),
            outbox,
        }
    }

    /// Queues a message on the neighbor's writer.
    ///
    /// Never blocks. Returns false if the writer has gone away.
    pub fn send(&self, message: PeerMessage) -> bool {
        let name = message.name();
        if self.outbox.send(message).is_err() {
            tracing::debug!(
                peer = %self.remote_id,
                message = name,
                "Dropped message for closed writer"
            );
            return false;
        }
        true
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_pieces(&self) -> &Bitfield {
        &self.remote_pieces
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_choked(&self) -> bool {
        self.am_choked
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn downloaded_this_interval(&self) -> u64 {
        self.downloaded_this_interval
    }

    pub fn pending_requests(&self) -> &HashSet<PieceIndex> {
        &self.pending_requests
    }

    /// Returns true if the neighbor unchokes us and nothing is outstanding.
    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Connected && !self.am_choked && self.pending_requests.is_empty()
    }

    pub(crate) fn replace_remote_pieces(&mut self, remote_pieces: Bitfield) {
        self.remote_pieces = remote_pieces;
    }

    /// Returns true if the bit was newly set.
    pub(crate) fn mark_remote_piece(&mut self, index: PieceIndex) -> bool {
        self.remote_pieces.set_piece(index)
    }

    pub(crate) fn set_am_choking(&mut self, am_choking: bool) {
        self.am_choking = am_choking;
    }

    pub(crate) fn set_am_choked(&mut self, am_choked: bool) {
        self.am_choked = am_choked;
    }

    pub(crate) fn set_am_interested(&mut self, am_interested: bool) {
        self.am_interested = am_interested;
    }

    pub(crate) fn set_peer_interested(&mut self, peer_interested: bool) {
        self.peer_interested = peer_interested;
    }

    pub(crate) fn record_download(&mut self, bytes: usize) {
        self.downloaded_this_interval += bytes as u64;
    }

    /// Reads and zeroes the per-interval counter in one step.
    pub(crate) fn take_downloaded(&mut self) -> u64 {
        std::mem::take(&mut self.downloaded_this_interval)
    }

    pub(crate) fn add_pending(&mut self, index: PieceIndex) {
        self.pending_requests.insert(index);
    }

    /// Returns true if the index was pending.
    pub(crate) fn complete_pending(&mut self, index: PieceIndex) -> bool {
        self.pending_requests.remove(&index)
    }

    /// Empties the pending set, returning what was in it.
    pub(crate) fn drain_pending(&mut self) -> Vec<PieceIndex> {
        self.pending_requests.drain().collect()
    }

    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
