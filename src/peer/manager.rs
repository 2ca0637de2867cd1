//! Peer manager module
//!
//! Establishes the swarm topology: dials every earlier neighbor until the
//! handshake succeeds and accepts connections from the rest.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::peer::{PeerConnection, PeerId, SessionTasks, Swarm};
use crate::protocol::PeerWire;
use crate::EVENT_LOG_TARGET;

/// A neighbor this process dials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
}

impl Neighbor {
    /// Create a new neighbor entry
    pub fn new(peer_id: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id,
            host: host.into(),
            port,
        }
    }
}

/// Exponential dial backoff with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
}

impl RetryBackoff {
    /// Create a backoff starting at `initial` and never exceeding `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Turns sockets into sessions on a shared [`Swarm`]
pub struct PeerManager {
    swarm: Arc<Swarm>,
    wire: PeerWire,
    backoff: RetryBackoff,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(swarm: Arc<Swarm>) -> Self {
        let wire = PeerWire::new(swarm.layout().max_payload());
        Self {
            swarm,
            wire,
            backoff: RetryBackoff::default(),
        }
    }

    /// Use a different dial backoff
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get the shared swarm state
    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    /// Dial `neighbor` until a handshake succeeds, then start the session
    pub async fn dial(&self, neighbor: &Neighbor) -> Option<SessionTasks> {
        let local_id = self.swarm.local_id();
        let mut attempt = 0u32;

        let connection = loop {
            match PeerConnection::connect(&neighbor.host, neighbor.port, local_id, neighbor.peer_id, self.wire).await {
                Ok(connection) => break connection,
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "Dial to peer {} at {}:{} failed (attempt {}): {}; retrying in {:?}",
                        neighbor.peer_id,
                        neighbor.host,
                        neighbor.port,
                        attempt + 1,
                        e,
                        delay
                    );
                    attempt = attempt.saturating_add(1);
                    sleep(delay).await;
                }
            }
        };

        info!(target: EVENT_LOG_TARGET, "Peer {} makes a connection to Peer {}.", local_id, neighbor.peer_id);
        match connection.start_session(self.swarm.clone()).await {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                warn!("Could not start session with peer {}: {}", neighbor.peer_id, e);
                None
            }
        }
    }

    /// Spawn a task dialing `neighbor`
    pub fn spawn_dialer(self: &Arc<Self>, neighbor: Neighbor) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.dial(&neighbor).await;
        })
    }

    /// Accept connections forever; each handshake runs in its own task
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Listening for neighbors on {}", addr),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(self.backoff.delay(0)).await;
                    continue;
                }
            };
            debug!("Incoming connection from {}", addr);

            let manager = self.clone();
            tokio::spawn(async move {
                let local_id = manager.swarm.local_id();
                let connection = match PeerConnection::accept(stream, local_id, manager.wire).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", addr, e);
                        return;
                    }
                };

                let peer_id = connection.peer_id();
                info!(target: EVENT_LOG_TARGET, "Peer {} is connected from Peer {}.", local_id, peer_id);
                if let Err(e) = connection.start_session(manager.swarm.clone()).await {
                    warn!("Could not start session with peer {}: {}", peer_id, e);
                }
            });
        }
    }

    /// Spawn the accept loop
    pub fn spawn_listener(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_listener(listener))
    }
}
