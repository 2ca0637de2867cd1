//! Storage module
//!
//! Piece geometry, the local bitfield and the piece store.

pub mod bitfield;
pub mod file;
pub mod piece;

pub use bitfield::Bitfield;
pub use file::{persist, PieceStore};
pub use piece::{PieceIndex, PieceLayout};
