//! Session message handling
//!
//! One receive loop and one writer task per established connection. The
//! receive loop dispatches each message to a handler on [`Swarm`], in
//! receipt order.

use std::sync::Arc;
use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::SwarmError;
use crate::peer::selection::select_piece;
use crate::peer::swarm::{release_piece, SharedState};
use crate::peer::{PeerId, Swarm};
use crate::protocol::{Message, PeerWire, WireProtocol};
use crate::storage::{persist, Bitfield, PieceIndex};
use crate::EVENT_LOG_TARGET;

impl Swarm {
    /// Dispatch one message received from `peer_id`
    pub async fn handle_message(&self, peer_id: PeerId, message: Message) -> Result<()> {
        debug!("Received {:?} from peer {}", message.message_id(), peer_id);
        match message {
            Message::Choke => self.on_choke(peer_id).await,
            Message::Unchoke => self.on_unchoke(peer_id).await,
            Message::Interested => self.on_interest(peer_id, true).await,
            Message::NotInterested => self.on_interest(peer_id, false).await,
            Message::Have { piece_index } => self.on_have(peer_id, piece_index).await,
            Message::Bitfield { bitfield } => self.on_bitfield(peer_id, bitfield).await,
            Message::Request { piece_index } => self.on_request(peer_id, piece_index).await,
            Message::Piece { piece_index, data } => self.on_piece(peer_id, piece_index, data).await,
        }
    }

    fn check_index(&self, peer_id: PeerId, index: PieceIndex) -> Result<()> {
        if !self.layout().contains(index) {
            warn!("Peer {} sent out-of-range piece index {}", peer_id, index);
            return Err(SwarmError::protocol_error_with_source(
                "Piece index out of range",
                format!("index {}, piece count {}", index, self.layout().piece_count())
            ).into());
        }
        Ok(())
    }

    async fn on_choke(&self, peer_id: PeerId) -> Result<()> {
        let mut guard = self.state.write().await;
        let entry = guard.tables.live_session(peer_id)?;
        entry.state.peer_choking = true;
        info!(target: EVENT_LOG_TARGET, "Peer {} is choked by {}.", self.local_id(), peer_id);
        Ok(())
    }

    async fn on_unchoke(&self, peer_id: PeerId) -> Result<()> {
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        tables.live_session(peer_id)?.state.peer_choking = false;
        info!(target: EVENT_LOG_TARGET, "Peer {} is unchoked by {}.", self.local_id(), peer_id);

        select_piece(tables, store.bitfield(), peer_id, &mut rand::thread_rng());
        Ok(())
    }

    async fn on_interest(&self, peer_id: PeerId, interested: bool) -> Result<()> {
        let mut guard = self.state.write().await;
        let tables = &mut guard.tables;
        tables.live_session(peer_id)?.state.peer_interested = interested;

        if interested {
            tables.interested.insert(peer_id);
            info!(target: EVENT_LOG_TARGET, "Peer {} received the 'interested' message from {}.", self.local_id(), peer_id);
        } else {
            tables.interested.remove(&peer_id);
            info!(target: EVENT_LOG_TARGET, "Peer {} received the 'not interested' message from {}.", self.local_id(), peer_id);
        }
        Ok(())
    }

    async fn on_have(&self, peer_id: PeerId, index: PieceIndex) -> Result<()> {
        self.check_index(peer_id, index)?;
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        let wanted = !store.has_piece(index);
        let reservable = wanted && !tables.requested.contains(&index);
        let entry = tables.live_session(peer_id)?;
        entry.state.remote_bitfield.set(index as usize);
        info!(
            target: EVENT_LOG_TARGET,
            "Peer {} received the 'have' message from {} for the piece {}.",
            self.local_id(),
            peer_id,
            index
        );

        if wanted && !entry.state.am_interested {
            entry.send(Message::Interested);
            entry.state.am_interested = true;
        }

        // A piece already reserved elsewhere is no new candidate
        if reservable && entry.state.can_request() {
            select_piece(tables, store.bitfield(), peer_id, &mut rand::thread_rng());
        }
        Ok(())
    }

    async fn on_bitfield(&self, peer_id: PeerId, bitfield: Bytes) -> Result<()> {
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        let entry = tables.live_session(peer_id)?;
        let remote = Bitfield::from_bytes(&bitfield, self.layout().piece_count() as usize);
        let interesting = remote.has_any_missing_from(store.bitfield());
        debug!(
            "Peer {} holds {} of {} pieces",
            peer_id,
            remote.count(),
            remote.piece_count()
        );
        entry.state.remote_bitfield = remote;

        if interesting {
            entry.send(Message::Interested);
        } else {
            entry.send(Message::NotInterested);
        }
        entry.state.am_interested = interesting;
        Ok(())
    }

    async fn on_request(&self, peer_id: PeerId, index: PieceIndex) -> Result<()> {
        self.check_index(peer_id, index)?;
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;

        let entry = tables.live_session(peer_id)?;
        if !store.has_piece(index) {
            warn!("Peer {} requested piece {} which is not held, ignoring", peer_id, index);
            return Ok(());
        }

        let data = store.read(index)?;
        entry.send(Message::Piece { piece_index: index, data });
        entry.state.increment_served();
        debug!("Served piece {} to peer {}", index, peer_id);
        Ok(())
    }

    async fn on_piece(&self, peer_id: PeerId, index: PieceIndex, data: Bytes) -> Result<()> {
        self.check_index(peer_id, index)?;

        let completed = {
            let mut guard = self.state.write().await;
            let SharedState { tables, store } = &mut *guard;
            tables.live_session(peer_id)?;

            match store.write(index, &data) {
                Ok(true) => {
                    tables.clear_reservation(index);
                    tables.broadcast(&Message::Have { piece_index: index });
                    info!(
                        target: EVENT_LOG_TARGET,
                        "Peer {} has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
                        self.local_id(),
                        peer_id,
                        index,
                        store.bitfield().count()
                    );

                    if store.claim_completion() {
                        for entry in tables.sessions.values_mut() {
                            if entry.state.am_interested {
                                entry.send(Message::NotInterested);
                                entry.state.am_interested = false;
                            }
                        }
                        true
                    } else {
                        select_piece(tables, store.bitfield(), peer_id, &mut rand::thread_rng());
                        false
                    }
                }
                Ok(false) => {
                    debug!("Duplicate piece {} from peer {}", index, peer_id);
                    tables.clear_reservation(index);
                    select_piece(tables, store.bitfield(), peer_id, &mut rand::thread_rng());
                    false
                }
                Err(e) => {
                    error!("Failed to store piece {} from peer {}: {}", index, peer_id, e);
                    release_piece(tables, store.bitfield(), index, &mut rand::thread_rng());
                    false
                }
            }
        };

        if completed {
            if let Err(e) = self.complete().await {
                error!("Failed to write the assembled file: {}", e);
            }
        }
        Ok(())
    }

    /// Write the assembled file; called once after the last piece arrives
    async fn complete(&self) -> Result<()> {
        let (path, data) = {
            let guard = self.state.read().await;
            let store = &guard.store;
            (store.output_path().to_path_buf(), store.snapshot())
        };

        persist(&path, &data).await?;
        info!(target: EVENT_LOG_TARGET, "Peer {} has downloaded the complete file.", self.local_id());
        Ok(())
    }
}

/// Read messages from `reader` until the transport fails, then destroy
/// the session
pub async fn run_receive_loop<R>(
    swarm: Arc<Swarm>,
    peer_id: PeerId,
    epoch: u64,
    mut reader: R,
    mut wire: PeerWire,
)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let message = match wire.read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                info!("Connection with peer {} closed: {}", peer_id, e);
                break;
            }
        };

        if let Err(e) = swarm.handle_message(peer_id, message).await {
            warn!("Dropping session with peer {}: {}", peer_id, e);
            break;
        }
    }

    swarm.remove_session(peer_id, epoch).await;
}

/// Drain a session outbox onto `writer`; a write failure destroys the
/// session
pub async fn run_writer<W>(
    swarm: Arc<Swarm>,
    peer_id: PeerId,
    epoch: u64,
    mut writer: W,
    mut wire: PeerWire,
    mut outbox: mpsc::UnboundedReceiver<Message>,
)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = outbox.recv().await {
        if let Err(e) = wire.write_message(&mut writer, &message).await {
            warn!("Failed to send {:?} to peer {}: {}", message.message_id(), peer_id, e);
            swarm.remove_session(peer_id, epoch).await;
            break;
        }
    }

    debug!("Writer for peer {} finished", peer_id);
    let _ = writer.shutdown().await;
}
