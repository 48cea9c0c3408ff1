//! Effects of inbound messages on the swarm

use bytes::Bytes;

use super::bitfield::Bitfield;
use super::events::SwarmEvent;
use super::session::{PeerSession, SessionState};
use super::state::{SessionHandle, Swarm};
use crate::wire::{PeerError, PeerId, PeerMessage, PieceIndex};

impl Swarm {
    /// Applies one decoded message from a connected neighbor.
    ///
    /// Storage failures are absorbed here; only protocol violations and a
    /// missing session come back as errors, and the caller closes the
    /// connection on those.
    ///
    /// # Errors
    /// - `PeerError::MalformedMessage` - Payload inconsistent with the piece layout
    /// - `PeerError::ConnectionClosed` - Neighbor has no session
    pub async fn handle_message(
        &self,
        from: PeerId,
        message: PeerMessage,
    ) -> Result<(), PeerError> {
        tracing::trace!(peer = %from, message = message.name(), "Dispatching message");

        match message {
            PeerMessage::Choke => self.handle_choke(from),
            PeerMessage::Unchoke => self.handle_unchoke(from),
            PeerMessage::Interested => self.handle_interest(from, true),
            PeerMessage::NotInterested => self.handle_interest(from, false),
            PeerMessage::Have { piece_index } => self.handle_have(from, piece_index),
            PeerMessage::Bitfield { bitfield } => self.handle_bitfield(from, &bitfield),
            PeerMessage::Request { piece_index } => self.handle_request(from, piece_index).await,
            PeerMessage::Piece { piece_index, data } => {
                self.handle_piece(from, piece_index, data).await
            }
        }
    }

    /// Requests a piece from every idle neighbor that has something we want.
    pub fn refill_requests(&self) {
        for handle in self.session_handles() {
            let mut session = handle.lock();
            if session.is_idle() && session.am_interested() {
                self.request_next(&mut session);
            }
        }
    }

    fn connected(&self, from: PeerId) -> Result<SessionHandle, PeerError> {
        self.session(from).ok_or(PeerError::ConnectionClosed { peer: from })
    }

    fn handle_choke(&self, from: PeerId) -> Result<(), PeerError> {
        let handle = self.connected(from)?;
        let mut session = handle.lock();
        session.set_am_choked(true);

        let discarded = session.drain_pending();
        if !discarded.is_empty() {
            let mut tracker = self.tracker.lock();
            for index in &discarded {
                tracker.release(*index, from);
            }
        }
        drop(session);

        tracing::debug!(peer = %from, discarded = discarded.len(), "Choked");
        self.events.emit(SwarmEvent::ChokeReceived { peer: from });
        Ok(())
    }

    fn handle_unchoke(&self, from: PeerId) -> Result<(), PeerError> {
        let handle = self.connected(from)?;
        let mut session = handle.lock();
        session.set_am_choked(false);
        self.events.emit(SwarmEvent::UnchokeReceived { peer: from });
        self.request_next(&mut session);
        Ok(())
    }

    fn handle_interest(&self, from: PeerId, interested: bool) -> Result<(), PeerError> {
        let handle = self.connected(from)?;
        handle.lock().set_peer_interested(interested);

        let event = if interested {
            SwarmEvent::InterestedReceived { peer: from }
        } else {
            SwarmEvent::NotInterestedReceived { peer: from }
        };
        self.events.emit(event);
        Ok(())
    }

    fn handle_have(&self, from: PeerId, piece_index: PieceIndex) -> Result<(), PeerError> {
        if !self.layout.contains(piece_index) {
            return Err(PeerError::MalformedMessage {
                reason: format!(
                    "have for piece {piece_index} beyond {} pieces",
                    self.layout.piece_count()
                ),
            });
        }

        let handle = self.connected(from)?;
        let remote_complete = {
            let mut session = handle.lock();
            self.events.emit(SwarmEvent::HaveReceived {
                peer: from,
                piece: piece_index,
            });
            if session.mark_remote_piece(piece_index) {
                self.update_interest(&mut session, false);
            }
            if session.is_idle() && session.am_interested() {
                self.request_next(&mut session);
            }
            session.remote_pieces().is_complete()
        };

        if remote_complete {
            self.mark_finished(from);
        }
        Ok(())
    }

    fn handle_bitfield(&self, from: PeerId, payload: &[u8]) -> Result<(), PeerError> {
        let remote = Bitfield::from_bytes(payload, self.layout.piece_count())?;
        let remote_complete = remote.is_complete();

        let handle = self.connected(from)?;
        {
            let mut session = handle.lock();
            session.replace_remote_pieces(remote);
            self.update_interest(&mut session, true);
            if session.is_idle() && session.am_interested() {
                self.request_next(&mut session);
            }
        }

        if remote_complete {
            self.mark_finished(from);
        }
        Ok(())
    }

    async fn handle_request(&self, from: PeerId, piece_index: PieceIndex) -> Result<(), PeerError> {
        if !self.layout.contains(piece_index) {
            return Err(PeerError::MalformedMessage {
                reason: format!(
                    "request for piece {piece_index} beyond {} pieces",
                    self.layout.piece_count()
                ),
            });
        }

        let handle = self.connected(from)?;
        if handle.lock().am_choking() {
            tracing::trace!(peer = %from, piece = %piece_index, "Ignoring request while choking");
            return Ok(());
        }
        if !self.tracker.lock().has_piece(piece_index) {
            tracing::trace!(peer = %from, piece = %piece_index, "Ignoring request, piece not held");
            return Ok(());
        }

        let data = match self.store.piece(piece_index).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    peer = %from,
                    piece = %piece_index,
                    error = %e,
                    "Failed to read piece"
                );
                return Ok(());
            }
        };

        handle.lock().send(PeerMessage::Piece { piece_index, data });
        Ok(())
    }

    async fn handle_piece(
        &self,
        from: PeerId,
        piece_index: PieceIndex,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let expected = self
            .layout
            .piece_len(piece_index)
            .map_err(|e| PeerError::MalformedMessage {
                reason: e.to_string(),
            })?;
        if data.len() != expected {
            return Err(PeerError::MalformedMessage {
                reason: format!(
                    "piece {piece_index} carries {} bytes, expected {expected}",
                    data.len()
                ),
            });
        }

        let handle = self.connected(from)?;
        let already_held = self.tracker.lock().has_piece(piece_index);
        if !already_held {
            if let Err(e) = self.store.store_piece(piece_index, data.clone()).await {
                tracing::warn!(
                    peer = %from,
                    piece = %piece_index,
                    error = %e,
                    "Failed to store piece"
                );
                let mut session = handle.lock();
                session.complete_pending(piece_index);
                self.tracker.lock().release(piece_index, from);
                if self.record_store_fault() {
                    tracing::error!("Piece store failing repeatedly, giving up");
                    return Ok(());
                }
                self.request_next(&mut session);
                return Ok(());
            }
            self.clear_store_faults();
        }

        let (newly_held, held, complete) = {
            let mut tracker = self.tracker.lock();
            let newly_held = tracker.mark_have(piece_index);
            (newly_held, tracker.local().count_ones(), tracker.is_complete())
        };

        {
            let mut session = handle.lock();
            session.record_download(data.len());
            session.complete_pending(piece_index);
        }

        if newly_held {
            tracing::debug!(peer = %from, piece = %piece_index, held, "Stored piece");
            self.events.emit(SwarmEvent::PieceReceived {
                peer: from,
                piece: piece_index,
                held,
                total: self.layout.piece_count(),
            });
            if complete {
                self.events.emit(SwarmEvent::DownloadComplete);
            }

            // The supplier hears it too, or it never learns we finished
            for other in self.session_handles() {
                let mut session = other.lock();
                if session.state() != SessionState::Connected {
                    continue;
                }
                session.send(PeerMessage::Have { piece_index });
                self.update_interest(&mut session, false);
            }
        }

        {
            let mut session = handle.lock();
            self.update_interest(&mut session, false);
            if !complete {
                self.request_next(&mut session);
            }
        }

        self.notify_changed();
        Ok(())
    }

    /// Recomputes whether we want anything from this neighbor.
    ///
    /// Sends `interested`/`not-interested` on a change, or unconditionally
    /// when `announce` is set.
    fn update_interest(&self, session: &mut PeerSession, announce: bool) {
        let wanted = self.tracker.lock().wants_from(session.remote_pieces());
        if !announce && wanted == session.am_interested() {
            return;
        }

        session.set_am_interested(wanted);
        let peer = session.remote_id();
        if wanted {
            session.send(PeerMessage::Interested);
            self.events.emit(SwarmEvent::InterestedSent { peer });
        } else {
            session.send(PeerMessage::NotInterested);
            self.events.emit(SwarmEvent::NotInterestedSent { peer });
        }
    }

    /// Requests one random qualifying piece if the neighbor unchokes us and
    /// nothing is pending on it.
    pub(crate) fn request_next(&self, session: &mut PeerSession) -> Option<PieceIndex> {
        if session.state() != SessionState::Connected
            || session.am_choked()
            || !session.pending_requests().is_empty()
        {
            return None;
        }

        let peer = session.remote_id();
        let chosen = self
            .tracker
            .lock()
            .reserve_random(session.remote_pieces(), peer)?;

        session.add_pending(chosen);
        session.send(PeerMessage::Request {
            piece_index: chosen,
        });
        self.events.emit(SwarmEvent::RequestSent {
            peer,
            piece: chosen,
        });
        Some(chosen)
    }
}
