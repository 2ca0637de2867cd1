//! Swarm state
//!
//! The tables shared by every session task and both scheduler tasks.
//!
//! Locking: the tables and the piece store share one lock, so a task
//! never waits on a second lock while holding the first. Messages are
//! handed to per-session unbounded channels, so the lock is never held
//! across I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::Result;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::SwarmError;
use crate::peer::selection::select_piece;
use crate::peer::{PeerId, SessionState};
use crate::protocol::Message;
use crate::storage::{Bitfield, PieceIndex, PieceLayout, PieceStore};

/// Outbound half of a session: messages queued here are written by the
/// session's writer task in order.
#[derive(Debug)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    /// Wrap the sending side of a session outbox
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a message; false if the writer has already gone away
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// A live session as stored in the swarm tables
#[derive(Debug)]
pub struct SessionEntry {
    pub state: SessionState,
    handle: SessionHandle,
    epoch: u64,
}

impl SessionEntry {
    /// Queue a message for this neighbor
    pub fn send(&self, message: Message) {
        trace!("Queueing {:?} for peer {}", message.message_id(), self.state.peer_id);
        if !self.handle.send(message) {
            debug!("Outbox for peer {} is closed", self.state.peer_id);
        }
    }
}

/// Shared tables: sessions, outstanding requests and neighbor sets
#[derive(Debug, Default)]
pub struct SwarmTables {
    pub(crate) sessions: HashMap<PeerId, SessionEntry>,
    /// Pieces currently requested from some neighbor
    pub(crate) requested: HashSet<PieceIndex>,
    pub(crate) interested: HashSet<PeerId>,
    pub(crate) preferred: HashSet<PeerId>,
    pub(crate) optimistic: Option<PeerId>,
}

impl SwarmTables {
    /// Insert a session
    pub fn insert_session(&mut self, state: SessionState, handle: SessionHandle, epoch: u64) {
        self.sessions.insert(state.peer_id, SessionEntry { state, handle, epoch });
    }

    /// Get a session
    pub fn session(&self, peer_id: PeerId) -> Option<&SessionEntry> {
        self.sessions.get(&peer_id)
    }

    /// Get a mutable session
    pub fn session_mut(&mut self, peer_id: PeerId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(&peer_id)
    }

    /// Get a mutable session or fail with a closed-session error
    pub(crate) fn live_session(&mut self, peer_id: PeerId) -> Result<&mut SessionEntry> {
        self.sessions.get_mut(&peer_id).ok_or_else(|| {
            SwarmError::peer_error_with_peer("Session is closed", peer_id.to_string()).into()
        })
    }

    /// Queue `message` for every live session
    pub fn broadcast(&self, message: &Message) {
        for entry in self.sessions.values() {
            entry.send(message.clone());
        }
    }

    /// Remove a session and purge it from every set. Its pending request,
    /// if any, is dropped from `requested` but not re-offered; see
    /// [`release_piece`].
    pub fn remove_session(&mut self, peer_id: PeerId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&peer_id)?;
        self.interested.remove(&peer_id);
        self.preferred.remove(&peer_id);
        if self.optimistic == Some(peer_id) {
            self.optimistic = None;
        }
        if let Some(index) = entry.state.pending_request {
            self.requested.remove(&index);
        }
        Some(entry)
    }

    /// Sessions whose pending request is `index`
    fn holders_of(&self, index: PieceIndex) -> Vec<PeerId> {
        self.sessions
            .values()
            .filter(|entry| entry.state.pending_request == Some(index))
            .map(|entry| entry.state.peer_id)
            .collect()
    }

    /// Clear every reservation on `index`
    pub(crate) fn clear_reservation(&mut self, index: PieceIndex) {
        self.requested.remove(&index);
        for peer_id in self.holders_of(index) {
            if let Some(entry) = self.sessions.get_mut(&peer_id) {
                entry.state.pending_request = None;
            }
        }
    }
}

/// Return a piece to the pool after its reservation was lost without the
/// piece arriving. Neighbors holding it are re-asked for interest, and
/// those already unchoking us get a chance to request it.
pub(crate) fn release_piece<R: Rng + ?Sized>(
    tables: &mut SwarmTables,
    local: &Bitfield,
    index: PieceIndex,
    rng: &mut R,
) {
    tables.clear_reservation(index);
    if local.has(index as usize) {
        return;
    }

    let mut holders: Vec<PeerId> = tables
        .sessions
        .values()
        .filter(|entry| entry.state.remote_bitfield.has(index as usize))
        .map(|entry| entry.state.peer_id)
        .collect();
    holders.sort();

    for peer_id in holders {
        let can_request = match tables.sessions.get_mut(&peer_id) {
            Some(entry) => {
                if !entry.state.am_interested {
                    entry.send(Message::Interested);
                    entry.state.am_interested = true;
                }
                entry.state.can_request()
            }
            None => false,
        };
        if can_request {
            select_piece(tables, local, peer_id, rng);
        }
    }
}

/// Everything guarded by the swarm lock
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) tables: SwarmTables,
    pub(crate) store: PieceStore,
}

/// Process-wide swarm state
#[derive(Debug)]
pub struct Swarm {
    local_id: PeerId,
    layout: PieceLayout,
    preferred_neighbors: usize,
    pub(crate) state: RwLock<SharedState>,
    next_epoch: AtomicU64,
}

impl Swarm {
    /// Create the swarm state around a piece store
    pub fn new(local_id: PeerId, store: PieceStore, preferred_neighbors: usize) -> Self {
        info!(
            "Creating swarm state for peer {} ({} of {} pieces held, {} preferred neighbors)",
            local_id,
            store.bitfield().count(),
            store.layout().piece_count(),
            preferred_neighbors
        );
        Self {
            local_id,
            layout: *store.layout(),
            preferred_neighbors,
            state: RwLock::new(SharedState {
                tables: SwarmTables::default(),
                store,
            }),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Our own peer id
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Piece geometry
    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Maximum size of the preferred set
    pub fn preferred_neighbors(&self) -> usize {
        self.preferred_neighbors
    }

    /// Register an established session and queue our BITFIELD on it.
    /// Returns the session epoch used to tear it down later.
    pub async fn register_session(
        &self,
        peer_id: PeerId,
        addr: Option<SocketAddr>,
        handle: SessionHandle,
    ) -> Result<u64> {
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        if peer_id == self.local_id {
            warn!("Refusing session with our own peer id {}", peer_id);
            return Err(SwarmError::peer_error_with_peer("Connection to self", peer_id.to_string()).into());
        }
        if tables.sessions.contains_key(&peer_id) {
            warn!("Refusing duplicate session with peer {}", peer_id);
            return Err(SwarmError::peer_error_with_peer("Duplicate session", peer_id.to_string()).into());
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        handle.send(Message::Bitfield {
            bitfield: store.bitfield().to_bytes(),
        });
        let state = SessionState::new(peer_id, addr, self.layout.piece_count() as usize);
        tables.insert_session(state, handle, epoch);

        info!("Session established with peer {} ({} live)", peer_id, tables.sessions.len());
        Ok(epoch)
    }

    /// Destroy a session: purge it from every table and release its
    /// pending request. Only the session registered under `epoch` is
    /// removed; returns false if it was already gone.
    pub async fn remove_session(&self, peer_id: PeerId, epoch: u64) -> bool {
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        match tables.session(peer_id) {
            Some(entry) if entry.epoch == epoch => {}
            _ => return false,
        }

        let pending = tables
            .remove_session(peer_id)
            .and_then(|entry| entry.state.pending_request);
        if let Some(index) = pending {
            debug!("Releasing piece {} held by closed session {}", index, peer_id);
            release_piece(tables, store.bitfield(), index, &mut rand::thread_rng());
        }

        info!("Session with peer {} closed ({} live)", peer_id, tables.sessions.len());
        true
    }

    /// Whether every piece is held locally
    pub async fn is_complete(&self) -> bool {
        self.state.read().await.store.is_complete()
    }

    /// Read a piece from the local store
    pub async fn read_piece(&self, index: PieceIndex) -> Result<bytes::Bytes> {
        self.state.read().await.store.read(index)
    }

    /// Snapshot of one session's state
    pub async fn session_state(&self, peer_id: PeerId) -> Option<SessionState> {
        self.state.read().await.tables.session(peer_id).map(|entry| entry.state.clone())
    }

    /// Ids of all live sessions
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.read().await.tables.sessions.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Pieces currently requested from some neighbor
    pub async fn requested_pieces(&self) -> HashSet<PieceIndex> {
        self.state.read().await.tables.requested.clone()
    }

    /// Neighbors interested in us
    pub async fn interested_peers(&self) -> HashSet<PeerId> {
        self.state.read().await.tables.interested.clone()
    }

    /// Current preferred neighbors
    pub async fn preferred_peers(&self) -> HashSet<PeerId> {
        self.state.read().await.tables.preferred.clone()
    }

    /// Current optimistically unchoked neighbor
    pub async fn optimistic_peer(&self) -> Option<PeerId> {
        self.state.read().await.tables.optimistic
    }

    /// True once we hold everything, `expected_neighbors` sessions are
    /// live and every one of them holds everything too
    pub async fn is_swarm_complete(&self, expected_neighbors: usize) -> bool {
        let guard = self.state.read().await;
        let SharedState { tables, store } = &*guard;

        store.is_complete()
            && tables.sessions.len() >= expected_neighbors
            && tables
                .sessions
                .values()
                .all(|entry| entry.state.remote_bitfield.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn empty_swarm(piece_count: u64) -> Swarm {
        let layout = PieceLayout::new(piece_count * 10, 10).unwrap();
        Swarm::new(PeerId(1), PieceStore::new(layout, PathBuf::from("out.dat")), 2)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_register_sends_bitfield() {
        let swarm = empty_swarm(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        swarm.register_session(PeerId(2), None, SessionHandle::new(tx)).await.unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages, vec![Message::Bitfield { bitfield: bytes::Bytes::from(vec![0u8, 0u8]) }]);

        let state = swarm.session_state(PeerId(2)).await.unwrap();
        assert!(state.am_choking);
        assert!(state.peer_choking);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_and_self() {
        let swarm = empty_swarm(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        swarm.register_session(PeerId(2), None, SessionHandle::new(tx)).await.unwrap();

        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(swarm.register_session(PeerId(2), None, SessionHandle::new(tx)).await.is_err());

        let (tx, _rx3) = mpsc::unbounded_channel();
        assert!(swarm.register_session(PeerId(1), None, SessionHandle::new(tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_session_purges_tables() {
        let swarm = empty_swarm(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let epoch = swarm.register_session(PeerId(2), None, SessionHandle::new(tx)).await.unwrap();

        {
            let mut guard = swarm.state.write().await;
            let tables = &mut guard.tables;
            tables.interested.insert(PeerId(2));
            tables.preferred.insert(PeerId(2));
            tables.optimistic = Some(PeerId(2));
            tables.requested.insert(3);
            tables.session_mut(PeerId(2)).unwrap().state.pending_request = Some(3);
        }

        assert!(!swarm.remove_session(PeerId(2), epoch + 1).await);
        assert!(swarm.remove_session(PeerId(2), epoch).await);
        assert!(swarm.session_state(PeerId(2)).await.is_none());
        assert!(swarm.interested_peers().await.is_empty());
        assert!(swarm.preferred_peers().await.is_empty());
        assert!(swarm.optimistic_peer().await.is_none());
        assert!(swarm.requested_pieces().await.is_empty());
    }

    #[tokio::test]
    async fn test_released_piece_is_reoffered() {
        let swarm = empty_swarm(4);
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let epoch_a = swarm.register_session(PeerId(2), None, SessionHandle::new(tx_a)).await.unwrap();
        swarm.register_session(PeerId(3), None, SessionHandle::new(tx_b)).await.unwrap();
        drain(&mut rx_b);

        {
            let mut guard = swarm.state.write().await;
            let tables = &mut guard.tables;
            tables.requested.insert(0);
            let a = tables.session_mut(PeerId(2)).unwrap();
            a.state.pending_request = Some(0);
            let b = tables.session_mut(PeerId(3)).unwrap();
            b.state.remote_bitfield = Bitfield::from_bytes(&[0b1000_0000], 4);
            b.state.peer_choking = false;
        }

        swarm.remove_session(PeerId(2), epoch_a).await;

        assert_eq!(drain(&mut rx_b), vec![Message::Interested, Message::Request { piece_index: 0 }]);
        let b = swarm.session_state(PeerId(3)).await.unwrap();
        assert_eq!(b.pending_request, Some(0));
        assert_eq!(swarm.requested_pieces().await, HashSet::from([0]));
    }

    #[tokio::test]
    async fn test_swarm_complete() {
        let layout = PieceLayout::new(20, 10).unwrap();
        let store = PieceStore::from_bytes(layout, vec![0u8; 20], PathBuf::from("in.dat")).unwrap();
        let swarm = Swarm::new(PeerId(1), store, 1);
        assert!(!swarm.is_swarm_complete(1).await);

        let (tx, _rx) = mpsc::unbounded_channel();
        swarm.register_session(PeerId(2), None, SessionHandle::new(tx)).await.unwrap();
        assert!(!swarm.is_swarm_complete(1).await);

        swarm.state.write().await.tables.session_mut(PeerId(2)).unwrap().state.remote_bitfield = Bitfield::full(2);
        assert!(swarm.is_swarm_complete(1).await);
    }
}
