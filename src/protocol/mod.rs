//! Swarm wire protocol
//!
//! Handshake, frame codec and typed messages.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_HEADER, HANDSHAKE_LENGTH};
pub use message::{Message, MessageId};
pub use wire::{encode_frame, Frame, PeerWire, WireProtocol};
