//! peer-swarm
//!
//! A peer for a fixed swarm that shares one file in pieces, with
//! choke/unchoke admission and periodic neighbor elections.

pub mod protocol;
pub mod peer;
pub mod storage;
pub mod cli;
pub mod error;

/// Tracing target for the per-peer protocol event log
pub const EVENT_LOG_TARGET: &str = "peer_swarm::event";

pub use error::SwarmError;

pub use protocol::{Handshake, Message, MessageId, PeerWire, WireProtocol};
pub use peer::{
    Neighbor, NeighborScheduler, PeerConnection, PeerId, PeerManager,
    RetryBackoff, SchedulerConfig, SessionState, Swarm,
};
pub use storage::{Bitfield, PieceIndex, PieceLayout, PieceStore};
pub use cli::{CliArgs, CommonConfig, Config, PeerInfoEntry};
