//! Fixed-length piece bitfield, MSB-first as on the wire

use bytes::Bytes;

use crate::wire::{PeerError, PieceIndex};

/// Which pieces a peer holds.
///
/// The length is fixed at construction. Bits past `piece_count` in the last
/// byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Creates a bitfield with no pieces set.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        bitfield.bits.fill(0xff);
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Parses a bitfield payload received from a peer.
    ///
    /// Spare bits in the final byte are ignored.
    ///
    /// # Errors
    /// - `PeerError::MalformedMessage` - Payload length is not `ceil(piece_count / 8)`
    pub fn from_bytes(payload: &[u8], piece_count: u32) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8) as usize;
        if payload.len() != expected {
            return Err(PeerError::MalformedMessage {
                reason: format!(
                    "bitfield of {} bytes for {piece_count} pieces, expected {expected}",
                    payload.len()
                ),
            });
        }

        let mut bitfield = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Ok(bitfield)
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Number of pieces tracked.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Check if the piece is held; out-of-range indices are never held.
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let (byte, mask) = Self::locate(index);
        self.bits[byte] & mask != 0
    }

    /// Mark piece as held; returns true if it was not held before.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range index. Callers validate indices received
    /// from the network before they reach here.
    pub fn set_piece(&mut self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        assert!(
            index < self.piece_count,
            "piece index {index} out of range for {} pieces",
            self.piece_count
        );
        let (byte, mask) = Self::locate(index);
        let was_set = self.bits[byte] & mask != 0;
        self.bits[byte] |= mask;
        !was_set
    }

    /// Number of held pieces.
    pub fn count_ones(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Returns true if no piece is held.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&byte| byte == 0)
    }

    /// Returns true if every piece is held.
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.piece_count
    }

    /// Iterates held piece indices in ascending order.
    pub fn pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|&index| self.has_piece(index))
    }

    /// Iterates indices `other` holds and `self` lacks.
    pub fn missing_from<'a>(
        &'a self,
        other: &'a Bitfield,
    ) -> impl Iterator<Item = PieceIndex> + 'a {
        other.pieces().filter(|&index| !self.has_piece(index))
    }

    fn locate(index: u32) -> (usize, u8) {
        ((index / 8) as usize, 1 << (7 - (index % 8)))
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() as u32 * 8) - self.piece_count;
        if spare == 0 {
            return;
        }
        if let Some(last) = self.bits.last_mut() {
            *last &= 0xffu8 << spare;
        }
    }
}
