//! Piece store
//!
//! Holds the shared file as one flat in-memory region plus the local
//! bitfield, and writes the assembled file to disk once complete.

use std::path::{Path, PathBuf};
use anyhow::Result;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace};

use crate::error::SwarmError;
use crate::storage::bitfield::Bitfield;
use crate::storage::piece::{PieceIndex, PieceLayout};

/// Piece data and local possession state
#[derive(Debug)]
pub struct PieceStore {
    layout: PieceLayout,
    /// Flat region of `file_size` bytes
    data: Vec<u8>,
    bitfield: Bitfield,
    /// Where the assembled file is written
    output_path: PathBuf,
    /// Set once completion has been claimed
    completion_claimed: bool,
}

impl PieceStore {
    /// Create an empty store
    pub fn new(layout: PieceLayout, output_path: PathBuf) -> Self {
        debug!("Creating empty piece store ({} pieces, {} bytes)", layout.piece_count(), layout.file_size());
        Self {
            layout,
            data: vec![0u8; layout.file_size() as usize],
            bitfield: Bitfield::new(layout.piece_count() as usize),
            output_path,
            completion_claimed: false,
        }
    }

    /// Create a complete store from existing bytes
    pub fn from_bytes(layout: PieceLayout, data: Vec<u8>, output_path: PathBuf) -> Result<Self> {
        if data.len() as u64 != layout.file_size() {
            error!("Source data has {} bytes, expected {}", data.len(), layout.file_size());
            return Err(SwarmError::storage_error_full(
                "Source file has the wrong size",
                output_path.display().to_string(),
                format!("expected {} bytes, found {}", layout.file_size(), data.len())
            ).into());
        }

        Ok(Self {
            layout,
            data,
            bitfield: Bitfield::full(layout.piece_count() as usize),
            output_path,
            completion_claimed: true,
        })
    }

    /// Load a complete store from the file at `path`
    pub async fn load(layout: PieceLayout, path: &Path) -> Result<Self> {
        info!("Loading shared file: {}", path.display());
        let data = fs::read(path).await
            .map_err(|e| {
                error!("Failed to read shared file '{}': {}", path.display(), e);
                SwarmError::storage_error_full("Failed to read shared file", path.display().to_string(), e.to_string())
            })?;
        Self::from_bytes(layout, data, path.to_path_buf())
    }

    /// Piece geometry
    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Local bitfield
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Whether piece `index` is held locally
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield.has(index as usize)
    }

    /// Whether every piece is held locally
    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    /// Path of the assembled output file
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Read piece `index`
    pub fn read(&self, index: PieceIndex) -> Result<Bytes> {
        let range = self.range(index)?;
        if !self.has_piece(index) {
            return Err(SwarmError::storage_error(format!("piece {} is not held", index)).into());
        }
        trace!("Reading piece {} ({} bytes)", index, range.len());
        Ok(Bytes::copy_from_slice(&self.data[range]))
    }

    /// Write piece `index`; returns true if the piece was newly acquired
    pub fn write(&mut self, index: PieceIndex, piece: &[u8]) -> Result<bool> {
        let range = self.range(index)?;
        if piece.len() != range.len() {
            error!("Piece {} has {} bytes, expected {}", index, piece.len(), range.len());
            return Err(SwarmError::storage_error(format!(
                "piece {} has {} bytes, expected {}",
                index,
                piece.len(),
                range.len()
            )).into());
        }

        if self.has_piece(index) {
            debug!("Piece {} already held, ignoring write", index);
            return Ok(false);
        }

        self.data[range].copy_from_slice(piece);
        self.bitfield.set(index as usize);
        trace!("Stored piece {} ({}/{} held)", index, self.bitfield.count(), self.layout.piece_count());
        Ok(true)
    }

    /// Claim the one-time completion; true only on the first call after
    /// the bitfield becomes full
    pub fn claim_completion(&mut self) -> bool {
        if self.completion_claimed || !self.is_complete() {
            return false;
        }
        self.completion_claimed = true;
        true
    }

    /// Copy of the flat region, in index order
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn range(&self, index: PieceIndex) -> Result<std::ops::Range<usize>> {
        let len = self.layout.piece_len(index).ok_or_else(|| {
            SwarmError::storage_error(format!(
                "piece index {} out of range (piece count {})",
                index,
                self.layout.piece_count()
            ))
        })?;
        let start = self.layout.offset(index) as usize;
        Ok(start..start + len)
    }
}

/// Write the assembled file to `path`, creating parent directories
pub async fn persist(path: &Path, data: &[u8]) -> Result<()> {
    info!("Writing assembled file: {} ({} bytes)", path.display(), data.len());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating directory: {}", parent.display());
            fs::create_dir_all(parent).await
                .map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    SwarmError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
        }
    }

    let mut file = fs::File::create(path).await
        .map_err(|e| {
            error!("Failed to create file '{}': {}", path.display(), e);
            SwarmError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
        })?;
    file.write_all(data).await
        .map_err(|e| {
            error!("Failed to write file '{}': {}", path.display(), e);
            SwarmError::storage_error_full("Failed to write file", path.display().to_string(), e.to_string())
        })?;
    file.sync_all().await
        .map_err(|e| {
            error!("Failed to sync file '{}': {}", path.display(), e);
            SwarmError::storage_error_full("Failed to sync file", path.display().to_string(), e.to_string())
        })?;

    debug!("Assembled file written: {}", path.display());
    Ok(())
}
