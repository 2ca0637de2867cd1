//! Per-session state
//!
//! Choke and interest are tracked as four independent flags, since each
//! direction evolves on its own.

use std::net::SocketAddr;

use crate::peer::PeerId;
use crate::storage::{Bitfield, PieceIndex};

/// State kept for one connected neighbor
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Neighbor identifier
    pub peer_id: PeerId,
    /// Remote socket address
    pub addr: Option<SocketAddr>,
    /// Pieces the neighbor holds
    pub remote_bitfield: Bitfield,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested in them
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested in us
    pub peer_interested: bool,
    /// Piece requested from this neighbor and not yet received
    pub pending_request: Option<PieceIndex>,
    /// Pieces sent to this neighbor since the last preferred election
    pub pieces_served: u32,
}

impl SessionState {
    /// Fresh state: choked both ways, not interested both ways
    pub fn new(peer_id: PeerId, addr: Option<SocketAddr>, piece_count: usize) -> Self {
        Self {
            peer_id,
            addr,
            remote_bitfield: Bitfield::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            pending_request: None,
            pieces_served: 0,
        }
    }

    /// Whether the selection engine may issue a request on this session
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.pending_request.is_none()
    }

    /// Increment pieces served
    pub fn increment_served(&mut self) {
        self.pieces_served = self.pieces_served.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let addr: SocketAddr = "127.0.0.1:6008".parse().unwrap();
        let state = SessionState::new(PeerId(1002), Some(addr), 12);

        assert_eq!(state.peer_id, PeerId(1002));
        assert_eq!(state.addr, Some(addr));
        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
        assert!(state.pending_request.is_none());
        assert_eq!(state.pieces_served, 0);
        assert_eq!(state.remote_bitfield.piece_count(), 12);
        assert!(state.remote_bitfield.is_empty());
    }

    #[test]
    fn test_can_request() {
        let mut state = SessionState::new(PeerId(1), None, 4);
        assert!(!state.can_request());

        state.peer_choking = false;
        assert!(state.can_request());

        state.pending_request = Some(2);
        assert!(!state.can_request());
    }

    #[test]
    fn test_increment_served() {
        let mut state = SessionState::new(PeerId(1), None, 4);
        state.increment_served();
        state.increment_served();
        assert_eq!(state.pieces_served, 2);
    }
}
