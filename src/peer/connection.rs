//! Peer connection module
//!
//! Dials or accepts one neighbor, runs the handshake, and turns the
//! socket into a session.

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::error::SwarmError;
use crate::peer::session::{run_receive_loop, run_writer};
use crate::peer::swarm::SessionHandle;
use crate::peer::{PeerId, Swarm};
use crate::protocol::{Handshake, PeerWire, WireProtocol};

/// Time allowed for the TCP connect and for the remote handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tasks driving one established session
#[derive(Debug)]
pub struct SessionTasks {
    pub epoch: u64,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// A connection whose handshake has completed
pub struct PeerConnection {
    /// Neighbor identifier from the handshake
    peer_id: PeerId,
    /// Remote socket address
    addr: SocketAddr,
    stream: TcpStream,
    wire: PeerWire,
}

impl PeerConnection {
    /// Connect to `host:port`, send our handshake and check that the
    /// reply comes from `expected`
    pub async fn connect(host: &str, port: u16, local_id: PeerId, expected: PeerId, mut wire: PeerWire) -> Result<Self> {
        let target = format!("{}:{}", host, port);
        debug!("Connecting to peer {} at {}", expected, target);

        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", target);
                SwarmError::network_error_full("Connection timeout", target.clone(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", target, e);
                SwarmError::network_error_full("Failed to connect", target.clone(), e.to_string())
            })?;
        let addr = stream.peer_addr()
            .map_err(|e| SwarmError::network_error_full("Failed to get peer address", target.clone(), e.to_string()))?;

        wire.write_handshake(&mut stream, &Handshake::new(local_id)).await
            .map_err(|e| {
                error!("Failed to send handshake to {}: {}", addr, e);
                SwarmError::peer_error_full("Failed to send handshake", addr.to_string(), e.to_string())
            })?;

        let handshake = timeout(HANDSHAKE_TIMEOUT, wire.read_handshake(&mut stream))
            .await
            .map_err(|e| {
                warn!("Handshake timeout from {}", addr);
                SwarmError::peer_error_full("Handshake timeout", addr.to_string(), e.to_string())
            })??;
        handshake.validate(expected)?;

        debug!("Handshake completed with peer {} at {}", expected, addr);
        Ok(Self { peer_id: expected, addr, stream, wire })
    }

    /// Read the handshake from an accepted socket and reply with ours.
    /// Only the header is checked; the claimed peer id is trusted.
    pub async fn accept(mut stream: TcpStream, local_id: PeerId, mut wire: PeerWire) -> Result<Self> {
        let addr = stream.peer_addr()
            .map_err(|e| {
                error!("Failed to get peer address from socket: {}", e);
                SwarmError::peer_error_full("Failed to get peer address", "unknown", e.to_string())
            })?;
        debug!("Accepted connection from {}", addr);

        let handshake = timeout(HANDSHAKE_TIMEOUT, wire.read_handshake(&mut stream))
            .await
            .map_err(|e| {
                warn!("Handshake timeout from {}", addr);
                SwarmError::peer_error_full("Handshake timeout", addr.to_string(), e.to_string())
            })??;

        wire.write_handshake(&mut stream, &Handshake::new(local_id)).await
            .map_err(|e| {
                error!("Failed to send handshake to {}: {}", addr, e);
                SwarmError::peer_error_full("Failed to send handshake", addr.to_string(), e.to_string())
            })?;

        debug!("Handshake completed with peer {} at {}", handshake.peer_id, addr);
        Ok(Self { peer_id: handshake.peer_id, addr, stream, wire })
    }

    /// Get the neighbor's id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Get the neighbor's address
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register the session with the swarm (which queues our BITFIELD)
    /// and spawn its reader and writer tasks
    pub async fn start_session(self, swarm: Arc<Swarm>) -> Result<SessionTasks> {
        let Self { peer_id, addr, stream, wire } = self;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let epoch = swarm.register_session(peer_id, Some(addr), SessionHandle::new(tx)).await?;
        info!("Starting session with peer {} at {}", peer_id, addr);

        let writer = tokio::spawn(run_writer(swarm.clone(), peer_id, epoch, writer, wire, rx));
        let reader = tokio::spawn(run_receive_loop(swarm, peer_id, epoch, reader, wire));
        Ok(SessionTasks { epoch, reader, writer })
    }
}
