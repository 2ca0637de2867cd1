//! Peer management module
//!
//! Connection establishment, per-session state and message handling,
//! piece selection, neighbor elections and the shared swarm tables.

pub mod connection;
pub mod manager;
pub mod peer_id;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod state;
pub mod swarm;

// Re-export main types
pub use connection::{PeerConnection, SessionTasks};
pub use manager::{Neighbor, PeerManager, RetryBackoff};
pub use peer_id::PeerId;
pub use scheduler::{NeighborScheduler, OptimisticElection, PreferredElection, SchedulerConfig};
pub use selection::Selection;
pub use state::SessionState;
pub use swarm::{SessionHandle, Swarm, SwarmTables};
