//! Neighbor scheduler
//!
//! Two independent timer tasks: the preferred-neighbor election every
//! unchoking interval and the optimistic unchoke every optimistic
//! unchoking interval.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::peer::swarm::{SharedState, SwarmTables};
use crate::peer::{PeerId, Swarm};
use crate::protocol::Message;
use crate::EVENT_LOG_TARGET;

/// Election periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unchoking_interval: Duration::from_secs(5),
            optimistic_unchoking_interval: Duration::from_secs(15),
        }
    }
}

/// Result of a preferred-neighbor election
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferredElection {
    /// New preferred set, best first
    pub preferred: Vec<PeerId>,
    /// Peers sent CHOKE
    pub choked: Vec<PeerId>,
    /// Peers sent UNCHOKE
    pub unchoked: Vec<PeerId>,
    /// Whether the preferred set differs from the previous one
    pub changed: bool,
}

/// Result of an optimistic-unchoke election
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimisticElection {
    /// Newly unchoked peer
    pub selected: Option<PeerId>,
    /// Previous optimistic peer that was choked
    pub choked: Option<PeerId>,
}

fn choke(tables: &mut SwarmTables, peer_id: PeerId) -> bool {
    match tables.session_mut(peer_id) {
        Some(entry) if !entry.state.am_choking => {
            entry.send(Message::Choke);
            entry.state.am_choking = true;
            true
        }
        _ => false,
    }
}

fn unchoke(tables: &mut SwarmTables, peer_id: PeerId) -> bool {
    match tables.session_mut(peer_id) {
        Some(entry) if entry.state.am_choking => {
            entry.send(Message::Unchoke);
            entry.state.am_choking = false;
            true
        }
        _ => false,
    }
}

/// Elect up to `k` preferred neighbors among interested peers.
///
/// While downloading, peers are ranked by pieces served since the last
/// election with ties broken uniformly at random. While seeding the order
/// is a plain shuffle. Every session's counter is reset afterwards.
pub(crate) fn elect_preferred<R: Rng + ?Sized>(
    tables: &mut SwarmTables,
    k: usize,
    seeding: bool,
    rng: &mut R,
) -> PreferredElection {
    let mut ranked: Vec<(PeerId, u32)> = tables
        .interested
        .iter()
        .filter_map(|id| tables.session(*id).map(|entry| (*id, entry.state.pieces_served)))
        .collect();
    ranked.sort_by_key(|(id, _)| *id);
    ranked.shuffle(rng);
    if !seeding {
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
    }

    let preferred: Vec<PeerId> = ranked.iter().take(k).map(|(id, _)| *id).collect();
    let next: HashSet<PeerId> = preferred.iter().copied().collect();
    let previous = std::mem::take(&mut tables.preferred);

    let mut leaving: Vec<PeerId> = previous.difference(&next).copied().collect();
    leaving.sort();
    let mut choked = Vec::new();
    for peer_id in leaving {
        if tables.optimistic != Some(peer_id) && choke(tables, peer_id) {
            choked.push(peer_id);
        }
    }

    let mut unchoked = Vec::new();
    for peer_id in &preferred {
        if unchoke(tables, *peer_id) {
            unchoked.push(*peer_id);
        }
    }

    for entry in tables.sessions.values_mut() {
        entry.state.pieces_served = 0;
    }

    let changed = previous != next;
    tables.preferred = next;
    PreferredElection {
        preferred,
        choked,
        unchoked,
        changed,
    }
}

/// Pick one interested, currently choked peer to unchoke optimistically
pub(crate) fn elect_optimistic<R: Rng + ?Sized>(tables: &mut SwarmTables, rng: &mut R) -> OptimisticElection {
    let mut candidates: Vec<PeerId> = tables
        .interested
        .iter()
        .filter(|id| tables.session(**id).map_or(false, |entry| entry.state.am_choking))
        .copied()
        .collect();
    candidates.sort();

    let previous = tables.optimistic;
    let mut election = OptimisticElection::default();

    match candidates.choose(rng).copied() {
        Some(pick) => {
            if let Some(prev) = previous {
                if prev != pick && !tables.preferred.contains(&prev) && choke(tables, prev) {
                    election.choked = Some(prev);
                }
            }
            unchoke(tables, pick);
            tables.optimistic = Some(pick);
            election.selected = Some(pick);
        }
        None => {
            if let Some(prev) = previous {
                if !tables.interested.contains(&prev) {
                    if !tables.preferred.contains(&prev) && choke(tables, prev) {
                        election.choked = Some(prev);
                    }
                    tables.optimistic = None;
                }
            }
        }
    }
    election
}

impl Swarm {
    /// Run one preferred-neighbor election
    pub async fn elect_preferred_neighbors(&self) -> PreferredElection {
        let mut guard = self.state.write().await;
        let SharedState { tables, store } = &mut *guard;
        let seeding = store.is_complete();

        let election = elect_preferred(tables, self.preferred_neighbors(), seeding, &mut rand::thread_rng());
        if election.changed {
            let names: Vec<String> = election.preferred.iter().map(|id| id.to_string()).collect();
            info!(
                target: EVENT_LOG_TARGET,
                "Peer {} has the preferred neighbors {}.",
                self.local_id(),
                names.join(", ")
            );
        }
        debug!(
            "Preferred election: {:?} (choked {:?}, unchoked {:?})",
            election.preferred, election.choked, election.unchoked
        );
        election
    }

    /// Run one optimistic-unchoke election
    pub async fn elect_optimistic_neighbor(&self) -> OptimisticElection {
        let mut guard = self.state.write().await;

        let election = elect_optimistic(&mut guard.tables, &mut rand::thread_rng());
        if let Some(peer_id) = election.selected {
            info!(
                target: EVENT_LOG_TARGET,
                "Peer {} has the optimistically unchoked neighbor {}.",
                self.local_id(),
                peer_id
            );
        }
        election
    }
}

/// Periodic neighbor elections
pub struct NeighborScheduler {
    swarm: Arc<Swarm>,
    config: SchedulerConfig,
}

impl NeighborScheduler {
    /// Create a new scheduler
    pub fn new(swarm: Arc<Swarm>, config: SchedulerConfig) -> Self {
        Self { swarm, config }
    }

    /// Start both election tasks. The first election of each kind runs one
    /// full interval after this call.
    pub fn spawn(self) -> (JoinHandle<()>, JoinHandle<()>) {
        info!(
            "Starting neighbor scheduler (unchoking every {:?}, optimistic every {:?})",
            self.config.unchoking_interval, self.config.optimistic_unchoking_interval
        );

        let swarm = self.swarm.clone();
        let period = self.config.unchoking_interval;
        let preferred = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                swarm.elect_preferred_neighbors().await;
            }
        });

        let swarm = self.swarm;
        let period = self.config.optimistic_unchoking_interval;
        let optimistic = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                swarm.elect_optimistic_neighbor().await;
            }
        });

        (preferred, optimistic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::swarm::SessionHandle;
    use crate::peer::SessionState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    type Outboxes = Vec<(PeerId, mpsc::UnboundedReceiver<Message>)>;

    fn tables_with(served: &[(u32, u32)]) -> (SwarmTables, Outboxes) {
        let mut tables = SwarmTables::default();
        let mut outboxes = Vec::new();
        for (i, (id, count)) in served.iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = SessionState::new(PeerId(*id), None, 8);
            state.pieces_served = *count;
            state.peer_interested = true;
            tables.insert_session(state, SessionHandle::new(tx), i as u64);
            tables.interested.insert(PeerId(*id));
            outboxes.push((PeerId(*id), rx));
        }
        (tables, outboxes)
    }

    fn sent(outboxes: &mut Outboxes, peer: u32) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some((_, rx)) = outboxes.iter_mut().find(|(id, _)| *id == PeerId(peer)) {
            while let Ok(message) = rx.try_recv() {
                messages.push(message);
            }
        }
        messages
    }

    #[test]
    fn test_preferred_by_pieces_served() {
        let (mut tables, mut outboxes) = tables_with(&[(1, 3), (2, 3), (3, 2), (4, 1), (5, 0)]);
        let mut rng = StdRng::seed_from_u64(3);

        let election = elect_preferred(&mut tables, 2, false, &mut rng);

        let mut preferred = election.preferred.clone();
        preferred.sort();
        assert_eq!(preferred, vec![PeerId(1), PeerId(2)]);
        assert!(election.changed);
        assert_eq!(tables.preferred, HashSet::from([PeerId(1), PeerId(2)]));
        assert!(tables.sessions.values().all(|entry| entry.state.pieces_served == 0));

        assert_eq!(sent(&mut outboxes, 1), vec![Message::Unchoke]);
        assert_eq!(sent(&mut outboxes, 2), vec![Message::Unchoke]);
        for peer in 3..=5 {
            assert!(sent(&mut outboxes, peer).is_empty());
        }
    }

    #[test]
    fn test_leaving_peer_is_choked_unless_optimistic() {
        let (mut tables, mut outboxes) = tables_with(&[(1, 5), (2, 4), (3, 0)]);
        let mut rng = StdRng::seed_from_u64(11);
        elect_preferred(&mut tables, 2, false, &mut rng);
        sent(&mut outboxes, 1);
        sent(&mut outboxes, 2);

        // Peer 3 now outranks peer 2, and peer 1 is no longer interested
        tables.interested.remove(&PeerId(1));
        tables.optimistic = Some(PeerId(1));
        tables.session_mut(PeerId(3)).unwrap().state.pieces_served = 9;
        let election = elect_preferred(&mut tables, 1, false, &mut rng);

        assert_eq!(election.preferred, vec![PeerId(3)]);
        assert_eq!(election.choked, vec![PeerId(2)]);
        assert!(sent(&mut outboxes, 1).is_empty());
        assert_eq!(sent(&mut outboxes, 2), vec![Message::Choke]);
        assert_eq!(sent(&mut outboxes, 3), vec![Message::Unchoke]);
    }

    #[test]
    fn test_seeding_election_ignores_counters() {
        let (mut tables, _outboxes) = tables_with(&[(1, 0), (2, 0), (3, 100)]);
        let mut picked = HashSet::new();
        for seed in 0..32 {
            for entry in tables.sessions.values_mut() {
                entry.state.am_choking = true;
            }
            tables.preferred.clear();
            let election = elect_preferred(&mut tables, 1, true, &mut StdRng::seed_from_u64(seed));
            picked.insert(election.preferred[0]);
        }
        assert!(picked.len() > 1);
    }

    #[test]
    fn test_optimistic_without_candidates() {
        let mut tables = SwarmTables::default();
        let mut rng = StdRng::seed_from_u64(5);

        let election = elect_optimistic(&mut tables, &mut rng);
        assert_eq!(election, OptimisticElection::default());
        assert!(tables.optimistic.is_none());
    }

    #[test]
    fn test_optimistic_rotates() {
        let (mut tables, mut outboxes) = tables_with(&[(1, 0), (2, 0)]);
        let mut rng = StdRng::seed_from_u64(9);

        let first = elect_optimistic(&mut tables, &mut rng).selected.unwrap();
        assert_eq!(tables.optimistic, Some(first));
        assert_eq!(sent(&mut outboxes, first.as_u32()), vec![Message::Unchoke]);

        let second = elect_optimistic(&mut tables, &mut rng);
        let other = if first == PeerId(1) { PeerId(2) } else { PeerId(1) };
        assert_eq!(second.selected, Some(other));
        assert_eq!(second.choked, Some(first));
        assert_eq!(sent(&mut outboxes, first.as_u32()), vec![Message::Choke]);
    }

    #[test]
    fn test_optimistic_slot_cleared_when_uninterested() {
        let (mut tables, mut outboxes) = tables_with(&[(1, 0)]);
        let mut rng = StdRng::seed_from_u64(2);
        elect_optimistic(&mut tables, &mut rng);
        sent(&mut outboxes, 1);

        tables.interested.remove(&PeerId(1));
        let election = elect_optimistic(&mut tables, &mut rng);

        assert_eq!(election.choked, Some(PeerId(1)));
        assert!(tables.optimistic.is_none());
        assert_eq!(sent(&mut outboxes, 1), vec![Message::Choke]);
    }
}
