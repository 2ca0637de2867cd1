//! Piece selection
//!
//! Random selection among pieces the neighbor has, we lack, and nobody
//! else has been asked for. Candidates are computed and reserved while
//! the caller holds the swarm write lock.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, trace};

use crate::peer::swarm::SwarmTables;
use crate::peer::PeerId;
use crate::protocol::Message;
use crate::storage::{Bitfield, PieceIndex};

/// Outcome of one selection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// REQUEST sent and the piece reserved
    Requested(PieceIndex),
    /// No candidates; NOT_INTERESTED sent
    NotInterested,
    /// Nothing to do
    Idle,
}

/// Run one selection pass for `peer_id`
pub(crate) fn select_piece<R: Rng + ?Sized>(
    tables: &mut SwarmTables,
    local: &Bitfield,
    peer_id: PeerId,
    rng: &mut R,
) -> Selection {
    if local.is_complete() {
        return Selection::Idle;
    }

    let requested = &tables.requested;
    let entry = match tables.sessions.get(&peer_id) {
        Some(entry) if entry.state.can_request() => entry,
        Some(_) => return Selection::Idle,
        None => return Selection::Idle,
    };

    let candidates: Vec<PieceIndex> = entry
        .state
        .remote_bitfield
        .missing_from(local)
        .into_iter()
        .map(|i| i as PieceIndex)
        .filter(|i| !requested.contains(i))
        .collect();
    trace!("Peer {} offers {} candidate pieces", peer_id, candidates.len());

    let Some(&index) = candidates.choose(rng) else {
        let Some(entry) = tables.sessions.get_mut(&peer_id) else {
            return Selection::Idle;
        };
        if entry.state.am_interested {
            entry.send(Message::NotInterested);
            entry.state.am_interested = false;
            debug!("Nothing left to request from peer {}", peer_id);
            return Selection::NotInterested;
        }
        return Selection::Idle;
    };

    tables.requested.insert(index);
    if let Some(entry) = tables.sessions.get_mut(&peer_id) {
        entry.send(Message::Request { piece_index: index });
        entry.state.pending_request = Some(index);
    }
    debug!("Requested piece {} from peer {}", index, peer_id);
    Selection::Requested(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::swarm::SessionHandle;
    use crate::peer::SessionState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn tables_with(
        peers: &[(u32, u8)],
        piece_count: usize,
    ) -> (SwarmTables, Vec<mpsc::UnboundedReceiver<Message>>) {
        let mut tables = SwarmTables::default();
        let mut outboxes = Vec::new();
        for (i, (id, bits)) in peers.iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = SessionState::new(PeerId(*id), None, piece_count);
            state.remote_bitfield = Bitfield::from_bytes(&[*bits], piece_count);
            state.peer_choking = false;
            state.am_interested = true;
            tables.insert_session(state, SessionHandle::new(tx), i as u64);
            outboxes.push(rx);
        }
        (tables, outboxes)
    }

    #[test]
    fn test_requests_missing_piece() {
        let (mut tables, mut outboxes) = tables_with(&[(2, 0b1100_0000)], 4);
        let local = Bitfield::from_bytes(&[0b1000_0000], 4);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(select_piece(&mut tables, &local, PeerId(2), &mut rng), Selection::Requested(1));
        assert_eq!(outboxes[0].try_recv().unwrap(), Message::Request { piece_index: 1 });
        assert!(tables.requested.contains(&1));
        assert_eq!(tables.session(PeerId(2)).unwrap().state.pending_request, Some(1));
    }

    #[test]
    fn test_subset_sends_not_interested() {
        let (mut tables, mut outboxes) = tables_with(&[(2, 0b1000_0000)], 4);
        let local = Bitfield::from_bytes(&[0b1000_0000], 4);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(select_piece(&mut tables, &local, PeerId(2), &mut rng), Selection::NotInterested);
        assert_eq!(outboxes[0].try_recv().unwrap(), Message::NotInterested);
        assert!(outboxes[0].try_recv().is_err());
        assert!(!tables.session(PeerId(2)).unwrap().state.am_interested);

        // Already not interested: nothing more is sent
        assert_eq!(select_piece(&mut tables, &local, PeerId(2), &mut rng), Selection::Idle);
        assert!(outboxes[0].try_recv().is_err());
    }

    #[test]
    fn test_reservations_never_overlap() {
        let peers = [(2, 0xF0), (3, 0xF0), (4, 0xF0), (5, 0xF0), (6, 0xF0)];
        let (mut tables, _outboxes) = tables_with(&peers, 4);
        let local = Bitfield::new(4);
        let mut rng = StdRng::seed_from_u64(42);

        let mut requested = Vec::new();
        for (id, _) in &peers {
            if let Selection::Requested(index) = select_piece(&mut tables, &local, PeerId(*id), &mut rng) {
                requested.push(index);
            }
        }

        requested.sort();
        assert_eq!(requested, vec![0, 1, 2, 3]);
        let pending: Vec<_> = tables.sessions.values().filter_map(|e| e.state.pending_request).collect();
        assert_eq!(pending.len(), 4);
        assert_eq!(tables.requested.len(), 4);
    }

    #[test]
    fn test_preconditions() {
        let (mut tables, mut outboxes) = tables_with(&[(2, 0xF0)], 4);
        let mut rng = StdRng::seed_from_u64(1);

        tables.session_mut(PeerId(2)).unwrap().state.peer_choking = true;
        assert_eq!(select_piece(&mut tables, &Bitfield::new(4), PeerId(2), &mut rng), Selection::Idle);

        tables.session_mut(PeerId(2)).unwrap().state.peer_choking = false;
        assert_eq!(select_piece(&mut tables, &Bitfield::full(4), PeerId(2), &mut rng), Selection::Idle);
        assert_eq!(select_piece(&mut tables, &Bitfield::new(4), PeerId(9), &mut rng), Selection::Idle);
        assert!(outboxes[0].try_recv().is_err());
    }
}
