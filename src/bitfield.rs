//! A fixed-length, bit-indexed set of piece indices.
//!
//! The high bit of byte 0 is piece 0, mirroring the wire representation of
//! the `bitfield` message (BEP-3), so that a `Bitfield` can be built directly
//! from a received payload and serialized back out without any bit-order
//! translation.

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;

/// A bit-indexed set of piece indices, fixed to `⌈piece_count / 8⌉` bytes for
/// its entire lifetime.
///
/// Unlike a plain `BitVec`, this type never resizes after construction: the
/// piece count is fixed up front and `has`/`set` are the only ways to
/// interact with it. This matches the protocol's invariant that a bitfield's
/// length is fully determined by the torrent's piece count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    inner: BitVec<Msb0, u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an all-zero bitfield for a torrent with `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        let mut inner = BitVec::with_capacity(Self::byte_len(piece_count) * 8);
        inner.resize(Self::byte_len(piece_count) * 8, false);
        Self { inner, piece_count }
    }

    /// Builds a bitfield from a wire payload, checking that its length
    /// matches the expected `⌈piece_count / 8⌉` bytes exactly.
    ///
    /// Returns `None` on a length mismatch; callers translate this into a
    /// `Protocol` error, per the peer session's bitfield-exchange rules.
    pub fn from_payload(bytes: &[u8], piece_count: usize) -> Option<Self> {
        if bytes.len() != Self::byte_len(piece_count) {
            return None;
        }
        let mut inner: BitVec<Msb0, u8> = BitVec::from_slice(bytes);
        // zero out any spare trailing bits past `piece_count`, per the
        // bitfield invariant
        for i in piece_count..inner.len() {
            inner.set(i, false);
        }
        Some(Self { inner, piece_count })
    }

    /// The number of bytes needed to represent `piece_count` bits.
    fn byte_len(piece_count: usize) -> usize {
        (piece_count + 7) / 8
    }

    /// Returns whether piece `i` is present. Out-of-range indices return
    /// `false` rather than panicking, since peers may (incorrectly) probe
    /// bits past the piece count.
    pub fn has(&self, index: PieceIndex) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.inner[index]
    }

    /// Sets piece `i`. Out of range indices are silently ignored.
    pub fn set(&mut self, index: PieceIndex) {
        if index >= self.piece_count {
            return;
        }
        self.inner.set(index, true);
    }

    /// Returns true if every piece is present.
    pub fn is_all_set(&self) -> bool {
        (0..self.piece_count).all(|i| self.has(i))
    }

    /// The number of pieces this bitfield tracks (not the number of bytes).
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// The number of pieces currently marked as present.
    pub fn count_ones(&self) -> usize {
        (0..self.piece_count).filter(|&i| self.has(i)).count()
    }

    /// Serializes into the wire's packed byte representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.clone().into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bitfield_is_all_unset() {
        let b = Bitfield::new(10);
        for i in 0..10 {
            assert!(!b.has(i));
        }
    }

    #[test]
    fn byte_len_rounds_up() {
        assert_eq!(Bitfield::byte_len(1), 1);
        assert_eq!(Bitfield::byte_len(8), 1);
        assert_eq!(Bitfield::byte_len(9), 2);
        assert_eq!(Bitfield::byte_len(16), 2);
    }

    #[test]
    fn set_and_has() {
        let mut b = Bitfield::new(9);
        assert!(!b.has(0));
        b.set(0);
        assert!(b.has(0));
        b.set(8);
        assert!(b.has(8));
        assert!(!b.has(1));
    }

    #[test]
    fn has_out_of_range_is_false() {
        let b = Bitfield::new(4);
        assert!(!b.has(100));
    }

    #[test]
    fn set_out_of_range_is_noop() {
        let mut b = Bitfield::new(4);
        b.set(100);
        assert!(!b.has(100));
    }

    #[test]
    fn from_payload_rejects_wrong_length() {
        assert!(Bitfield::from_payload(&[0u8; 2], 4).is_none());
    }

    #[test]
    fn from_payload_high_bit_is_piece_zero() {
        // 0b1000_0001 -> pieces 0 and 7
        let b = Bitfield::from_payload(&[0b1000_0001], 8).unwrap();
        assert!(b.has(0));
        assert!(b.has(7));
        for i in 1..7 {
            assert!(!b.has(i));
        }
    }

    #[test]
    fn from_payload_clears_spare_trailing_bits() {
        // 10 pieces needs 2 bytes (16 bits), with 6 spare bits; if a buggy
        // peer sets those trailing bits we still must report them as unset
        let b = Bitfield::from_payload(&[0xff, 0xff], 10).unwrap();
        assert!(b.has(9));
        assert!(!b.has(10));
    }

    #[test]
    fn single_piece_bitfield_matches_s1_scenario() {
        // S1: 1-piece torrent; once the piece is set, the wire
        // representation must equal 0x80.
        let mut b = Bitfield::new(1);
        b.set(0);
        assert_eq!(b.to_bytes(), vec![0x80]);
    }

    #[test]
    fn is_all_set() {
        let mut b = Bitfield::new(3);
        assert!(!b.is_all_set());
        b.set(0);
        b.set(1);
        assert!(!b.is_all_set());
        b.set(2);
        assert!(b.is_all_set());
    }
}
