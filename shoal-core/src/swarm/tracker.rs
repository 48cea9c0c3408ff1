//! Local piece ownership and the swarm-wide in-flight request table

use std::collections::HashMap;

use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;

use super::bitfield::Bitfield;
use crate::wire::{PeerId, PieceIndex};

/// Local bitfield plus which neighbor each outstanding request went to.
///
/// Both live behind one lock in the swarm so that "do I have it / is it
/// already requested" and "reserve it / mark it held" are atomic with
/// respect to each other. The RNG for piece selection lives here too, so
/// every draw happens under the same lock in a reproducible order.
#[derive(Debug)]
pub struct PieceTracker {
    local: Bitfield,
    in_flight: HashMap<PieceIndex, PeerId>,
    rng: ChaCha8Rng,
}

impl PieceTracker {
    /// Creates a tracker starting from the pieces already held locally.
    pub fn new(local: Bitfield, rng: ChaCha8Rng) -> Self {
        Self {
            local,
            in_flight: HashMap::new(),
            rng,
        }
    }

    /// Local bitfield.
    pub fn local(&self) -> &Bitfield {
        &self.local
    }

    /// Check if the piece is held locally.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.local.has_piece(index)
    }

    /// Returns true once every piece is held locally.
    pub fn is_complete(&self) -> bool {
        self.local.is_complete()
    }

    /// Returns true if `remote` holds any piece we lack.
    pub fn wants_from(&self, remote: &Bitfield) -> bool {
        self.local.missing_from(remote).next().is_some()
    }

    /// Neighbor currently holding the request for `index`, if any.
    pub fn requested_from(&self, index: PieceIndex) -> Option<PeerId> {
        self.in_flight.get(&index).copied()
    }

    /// Picks a piece `remote` holds, we lack, and nobody has pending, and
    /// reserves it for `peer`.
    ///
    /// Selection is uniform over all qualifying pieces.
    pub fn reserve_random(&mut self, remote: &Bitfield, peer: PeerId) -> Option<PieceIndex> {
        let candidates: Vec<PieceIndex> = self
            .local
            .missing_from(remote)
            .filter(|index| !self.in_flight.contains_key(index))
            .collect();

        let chosen = *candidates.choose(&mut self.rng)?;
        self.in_flight.insert(chosen, peer);
        Some(chosen)
    }

    /// Drops the reservation for `index` if `peer` holds it.
    pub fn release(&mut self, index: PieceIndex, peer: PeerId) {
        if self.in_flight.get(&index) == Some(&peer) {
            self.in_flight.remove(&index);
        }
    }

    /// Marks a piece held and clears any reservation on it.
    ///
    /// Returns true if the piece was not held before.
    pub fn mark_have(&mut self, index: PieceIndex) -> bool {
        self.in_flight.remove(&index);
        self.local.set_piece(index)
    }

    /// Number of outstanding requests across all neighbors.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
