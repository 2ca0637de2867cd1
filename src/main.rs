//! peer-process - Main entry point
//!
//! Runs one peer of the swarm described by the configuration files.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{Context, Result};
use peer_swarm::{
    CliArgs, Config, NeighborScheduler, PeerManager, PieceStore, Swarm, SwarmError,
    EVENT_LOG_TARGET,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, Subscriber};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

/// How often the swarm-complete condition is checked
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time left for queued messages to drain before exiting
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Timestamp prefix of event log lines
const EVENT_LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args, &args.event_log_path())
        .context("Failed to initialize logging")?;
    info!("peer-process {} starting", args.peer_id);
    debug!("CLI arguments: {:?}", args);

    // Load and validate configuration
    let config = Config::from_args(&args)
        .context("Failed to load configuration")?;
    config.validate()
        .context("Invalid configuration")?;
    display_config(&config)?;

    // Initialize components
    let swarm = Arc::new(build_swarm(&config).await?);
    let manager = Arc::new(PeerManager::new(swarm.clone()));

    let listen_addr = config.listen_addr()?;
    let listener = TcpListener::bind(&listen_addr).await
        .map_err(|e| {
            error!("Failed to bind {}: {}", listen_addr, e);
            anyhow::Error::from(SwarmError::network_error_full("Failed to bind listener", listen_addr.clone(), e.to_string()))
        })?;
    manager.spawn_listener(listener);

    for entry in config.neighbors_to_dial() {
        manager.spawn_dialer(entry.neighbor());
    }

    NeighborScheduler::new(swarm.clone(), config.scheduler_config()).spawn();

    if config.exit_when_swarm_complete {
        wait_for_swarm_completion(&swarm, config.neighbor_count()).await;
        info!("Every peer holds the complete file, shutting down");
        tokio::time::sleep(EXIT_GRACE_PERIOD).await;
    } else {
        std::future::pending::<()>().await;
    }

    info!("peer-process {} finished", args.peer_id);
    Ok(())
}

/// Initialize console logging and the protocol event log
fn init_logging(args: &CliArgs, event_log: &Path) -> Result<()> {
    let level = args.log_level();

    let event_file = File::create(event_log)
        .map_err(|e| SwarmError::storage_error_full("Failed to create event log", event_log.display().to_string(), e.to_string()))?;

    let console = if args.is_verbose() {
        fmt::layer()
            .pretty()
            .with_target(false)
            .with_thread_ids(false)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console.with_filter(LevelFilter::from_level(level)))
        .with(event_log_layer(Mutex::new(event_file)))
        .init();

    debug!("Logging initialized with level {:?}, event log at {}", level, event_log.display());
    Ok(())
}

/// Layer writing protocol events as `yyyy-MM-dd HH:mm:ss <event>` lines
fn event_log_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_timer(ChronoLocal::new(EVENT_LOG_TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_filter(filter_fn(|metadata| metadata.target() == EVENT_LOG_TARGET))
}

/// Load or create the piece store and wrap it in swarm state
async fn build_swarm(config: &Config) -> Result<Swarm> {
    let layout = config.layout()?;
    let local = config.local_entry()?;
    let path = config.shared_file_path();

    let store = if local.has_file {
        PieceStore::load(layout, &path).await
            .context("Failed to load the shared file")?
    } else {
        PieceStore::new(layout, path)
    };

    Ok(Swarm::new(local.peer_id, store, config.common.number_of_preferred_neighbors))
}

/// Display configuration
fn display_config(config: &Config) -> Result<()> {
    let layout = config.layout()?;
    let local = config.local_entry()?;

    info!(
        "Peer {} on port {} ({})",
        local.peer_id,
        local.port,
        if local.has_file { "seeding" } else { "downloading" }
    );
    info!(
        "File {}: {} bytes in {} pieces of {} bytes",
        config.common.file_name,
        layout.file_size(),
        layout.piece_count(),
        layout.piece_size()
    );
    info!(
        "{} preferred neighbors, unchoking every {:?}, optimistic unchoking every {:?}",
        config.common.number_of_preferred_neighbors,
        config.common.unchoking_interval,
        config.common.optimistic_unchoking_interval
    );
    debug!("Dialing {} earlier neighbors", config.neighbors_to_dial().len());
    Ok(())
}

/// Wait until we and every configured neighbor hold the complete file
async fn wait_for_swarm_completion(swarm: &Swarm, expected_neighbors: usize) {
    let mut ticker = tokio::time::interval(COMPLETION_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if swarm.is_swarm_complete(expected_neighbors).await {
            return;
        }
    }
}
