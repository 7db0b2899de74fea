use super::error::PeerError;
use bytes::Bytes;

/// A bitfield recording which pieces of the shared file a peer has.
///
/// Each bit represents whether a piece is present (1) or not (0).
/// Bits are numbered from the high bit of the first byte; spare bits in
/// the final byte are kept clear and never inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0; byte_count],
            piece_count,
        }
    }

    /// Creates a full bitfield (all pieces present).
    pub fn full(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        let mut bf = Self {
            bits: vec![0xFF; byte_count],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield from the raw bytes of a BITFIELD message payload.
    ///
    /// Short payloads are zero-extended and long ones truncated to the
    /// expected byte count; spare bits a remote peer set anyway are cleared.
    pub fn from_bytes(bytes: Bytes, piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        let expected_bytes = piece_count.div_ceil(8);
        bits.resize(expected_bytes, 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Returns true if the piece at the given index is present.
    ///
    /// Out-of-range indices read as absent.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    ///
    /// Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Returns the number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if every piece is present.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns the total number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.piece_count == 0
    }

    /// Returns true if `other` has at least one piece that `self` lacks.
    ///
    /// This is the interest test: a peer whose bitfield offers a piece we
    /// are missing is worth sending INTERESTED to. Comparing bitfields of
    /// different lengths is a protocol incompatibility, reported as an
    /// error rather than a panic.
    pub fn has_piece_missing_from(&self, other: &Bitfield) -> Result<bool, PeerError> {
        if self.piece_count != other.piece_count {
            return Err(PeerError::BitfieldMismatch {
                ours: self.piece_count,
                theirs: other.piece_count,
            });
        }
        Ok((0..self.piece_count).any(|i| other.has(i) && !self.has(i)))
    }

    /// Iterates over all piece bits in index order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.piece_count).map(|i| self.has(i))
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes for a BITFIELD message payload.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Clears any spare bits in the last byte that don't correspond to pieces.
    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}
