use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use peer_swarm::{
    Neighbor, NeighborScheduler, PeerId, PeerManager, PieceLayout, PieceStore, RetryBackoff,
    SchedulerConfig, Swarm,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

const FILE_SIZE: u64 = 10_000;
const PIECE_SIZE: u32 = 512;
const DEADLINE: Duration = Duration::from_secs(20);

fn source_bytes() -> Vec<u8> {
    (0..FILE_SIZE as usize).map(|i| (i * 31 % 253) as u8).collect()
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        unchoking_interval: Duration::from_millis(100),
        optimistic_unchoking_interval: Duration::from_millis(150),
    }
}

struct TestPeer {
    swarm: Arc<Swarm>,
    manager: Arc<PeerManager>,
    port: u16,
    output: PathBuf,
}

async fn start_peer(id: u32, dir: &Path, seeding: bool, preferred: usize) -> TestPeer {
    let layout = PieceLayout::new(FILE_SIZE, PIECE_SIZE).unwrap();
    let output = dir.join(format!("peer_{}", id)).join("TheFile.dat");
    let store = if seeding {
        PieceStore::from_bytes(layout, source_bytes(), output.clone()).unwrap()
    } else {
        PieceStore::new(layout, output.clone())
    };

    let swarm = Arc::new(Swarm::new(PeerId(id), store, preferred));
    let manager = Arc::new(
        PeerManager::new(swarm.clone())
            .with_backoff(RetryBackoff::new(Duration::from_millis(20), Duration::from_millis(200))),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    manager.spawn_listener(listener);
    NeighborScheduler::new(swarm.clone(), scheduler_config()).spawn();

    TestPeer { swarm, manager, port, output }
}

async fn wait_for_file(path: &Path, expected: &[u8]) {
    let started = Instant::now();
    loop {
        if let Ok(contents) = std::fs::read(path) {
            if contents == expected {
                return;
            }
        }
        assert!(started.elapsed() < DEADLINE, "{} was not assembled in time", path.display());
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leecher_downloads_from_seeder() {
    let dir = tempfile::tempdir().unwrap();
    let seeder = start_peer(1001, dir.path(), true, 1).await;
    let leecher = start_peer(1002, dir.path(), false, 1).await;

    leecher.manager.spawn_dialer(Neighbor::new(PeerId(1001), "127.0.0.1", seeder.port));

    wait_for_file(&leecher.output, &source_bytes()).await;
    assert!(leecher.swarm.is_complete().await);
    assert!(leecher.swarm.requested_pieces().await.is_empty());
    assert_eq!(
        &leecher.swarm.read_piece(0).await.unwrap()[..],
        &source_bytes()[..PIECE_SIZE as usize]
    );

    let started = Instant::now();
    while !seeder.swarm.is_swarm_complete(1).await {
        assert!(started.elapsed() < DEADLINE, "seeder never saw the leecher complete");
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_peer_swarm_completes() {
    let dir = tempfile::tempdir().unwrap();
    let first = start_peer(1001, dir.path(), true, 1).await;
    let second = start_peer(1002, dir.path(), false, 1).await;
    let third = start_peer(1003, dir.path(), false, 1).await;

    second.manager.spawn_dialer(Neighbor::new(PeerId(1001), "127.0.0.1", first.port));
    third.manager.spawn_dialer(Neighbor::new(PeerId(1001), "127.0.0.1", first.port));
    third.manager.spawn_dialer(Neighbor::new(PeerId(1002), "127.0.0.1", second.port));

    let source = source_bytes();
    wait_for_file(&second.output, &source).await;
    wait_for_file(&third.output, &source).await;

    let started = Instant::now();
    for peer in [&first, &second, &third] {
        while !peer.swarm.is_swarm_complete(2).await {
            assert!(started.elapsed() < DEADLINE, "peer {} never saw the swarm complete", peer.swarm.local_id());
            sleep(Duration::from_millis(25)).await;
        }
    }
    assert!(!first.output.exists());
}
