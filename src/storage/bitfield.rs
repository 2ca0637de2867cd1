//! Piece possession bitfield
//!
//! Bit `i` is the `i % 8`-th most significant bit of byte `i / 8`. Spare
//! bits in the last byte are always zero.

use bytes::Bytes;

/// A fixed-size bit vector over piece indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Create an empty bitfield
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Create a bitfield with every piece set
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Create a bitfield from wire bytes, padding or truncating to size
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);
        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Whether piece `index` is set
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Set piece `index`; returns true if the bit was previously clear
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
        true
    }

    /// Number of set pieces
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether every piece is set
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Whether no piece is set
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of pieces covered
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Raw bytes as sent on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Owned wire bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices set here but missing from `local` (`self AND NOT local`)
    pub fn missing_from(&self, local: &Bitfield) -> Vec<usize> {
        (0..self.piece_count)
            .filter(|&i| self.has(i) && !local.has(i))
            .collect()
    }

    /// Whether any index set here is missing from `local`
    pub fn has_any_missing_from(&self, local: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(local.bits.iter().chain(std::iter::repeat(&0u8)))
            .any(|(remote, ours)| remote & !ours != 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
