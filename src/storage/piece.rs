//! Piece layout
//!
//! Maps piece indices onto the flat file region.

use anyhow::Result;

use crate::error::SwarmError;

/// Index of a piece within the shared file
pub type PieceIndex = u32;

/// Geometry of the shared file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    file_size: u64,
    piece_size: u32,
    piece_count: u32,
}

impl PieceLayout {
    /// Create a layout; both sizes must be positive
    pub fn new(file_size: u64, piece_size: u32) -> Result<Self> {
        if file_size == 0 {
            return Err(SwarmError::config_error_with_field("file size must be positive", "FileSize").into());
        }
        if piece_size == 0 {
            return Err(SwarmError::config_error_with_field("piece size must be positive", "PieceSize").into());
        }

        let piece_count = file_size.div_ceil(piece_size as u64);
        let piece_count = u32::try_from(piece_count).map_err(|_| {
            SwarmError::config_error_with_field(
                format!("too many pieces: {}", piece_count),
                "PieceSize"
            )
        })?;

        Ok(Self {
            file_size,
            piece_size,
            piece_count,
        })
    }

    /// Total file size in bytes
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Nominal piece size in bytes
    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// Number of pieces
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Whether `index` names a piece of this file
    pub fn contains(&self, index: PieceIndex) -> bool {
        index < self.piece_count
    }

    /// Byte offset of piece `index`
    pub fn offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_size as u64
    }

    /// Length of piece `index`; the last piece may be shorter
    pub fn piece_len(&self, index: PieceIndex) -> Option<usize> {
        if !self.contains(index) {
            return None;
        }
        if index == self.piece_count - 1 {
            Some((self.file_size - self.offset(index)) as usize)
        } else {
            Some(self.piece_size as usize)
        }
    }

    /// Length of every piece, in index order
    pub fn piece_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter_map(move |i| self.piece_len(i))
    }

    /// Bytes needed for a bitfield over this file
    pub fn bitfield_len(&self) -> usize {
        (self.piece_count as usize).div_ceil(8)
    }

    /// Largest payload a legal frame can carry for this file
    pub fn max_payload(&self) -> usize {
        std::cmp::max(self.piece_size as usize + 4, self.bitfield_len())
    }
}
