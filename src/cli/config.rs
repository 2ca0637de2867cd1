//! CLI configuration module
//!
//! Loads `Common.cfg` and `PeerInfo.cfg` and derives the per-peer working
//! layout from them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::cli::args::CliArgs;
use crate::error::SwarmError;
use crate::peer::{Neighbor, PeerId, SchedulerConfig};
use crate::storage::PieceLayout;

/// Settings shared by every peer of the swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonConfig {
    pub number_of_preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

fn parse_number<T: std::str::FromStr<Err = std::num::ParseIntError>>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|e| {
        error!("Invalid value '{}' for {}: {}", value, key, e);
        SwarmError::config_error_with_field(format!("invalid number '{}': {}", value, e), key).into()
    })
}

impl CommonConfig {
    /// Parse `Key Value` lines; blank lines and `#` comments are skipped
    pub fn parse(contents: &str) -> Result<Self> {
        let mut preferred = None;
        let mut unchoking = None;
        let mut optimistic = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                return Err(SwarmError::config_error(format!("malformed line in common config: '{}'", line)).into());
            };

            match key {
                "NumberOfPreferredNeighbors" => preferred = Some(parse_number::<usize>(key, value)?),
                "UnchokingInterval" => unchoking = Some(parse_number::<u64>(key, value)?),
                "OptimisticUnchokingInterval" => optimistic = Some(parse_number::<u64>(key, value)?),
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_number::<u64>(key, value)?),
                "PieceSize" => piece_size = Some(parse_number::<u32>(key, value)?),
                _ => warn!("Ignoring unknown common config key '{}'", key),
            }
        }

        fn required<T>(value: Option<T>, key: &str) -> Result<T> {
            value.ok_or_else(|| SwarmError::config_error_with_field("missing required key", key).into())
        }

        Ok(Self {
            number_of_preferred_neighbors: required(preferred, "NumberOfPreferredNeighbors")?,
            unchoking_interval: Duration::from_secs(required(unchoking, "UnchokingInterval")?),
            optimistic_unchoking_interval: Duration::from_secs(required(optimistic, "OptimisticUnchokingInterval")?),
            file_name: required(file_name, "FileName")?,
            file_size: required(file_size, "FileSize")?,
            piece_size: required(piece_size, "PieceSize")?,
        })
    }
}

/// One line of the peer info file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfoEntry {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

impl PeerInfoEntry {
    /// Dial target for this entry
    pub fn neighbor(&self) -> Neighbor {
        Neighbor::new(self.peer_id, self.host.clone(), self.port)
    }
}

/// Parse `peerId host port hasFile` lines, in swarm order
pub fn parse_peer_info(contents: &str) -> Result<Vec<PeerInfoEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(SwarmError::config_error(format!("malformed line in peer info: '{}'", line)).into());
        }

        let peer_id = PeerId(parse_number::<u32>("peerId", fields[0])?);
        let port = parse_number::<u16>("port", fields[2])?;
        let has_file = match fields[3] {
            "0" => false,
            "1" => true,
            other => {
                return Err(SwarmError::config_error_with_field(
                    format!("expected 0 or 1, found '{}'", other),
                    "hasFile"
                ).into());
            }
        };

        if !seen.insert(peer_id) {
            return Err(SwarmError::config_error_with_field(format!("duplicate peer id {}", peer_id), "peerId").into());
        }
        entries.push(PeerInfoEntry {
            peer_id,
            host: fields[1].to_string(),
            port,
            has_file,
        });
    }

    Ok(entries)
}

/// Configuration for one peer process
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared swarm settings
    pub common: CommonConfig,
    /// Every peer of the swarm, in swarm order
    pub peers: Vec<PeerInfoEntry>,
    /// This process's peer id
    pub local_peer_id: PeerId,
    /// Root of the peer directories and logs
    pub work_dir: PathBuf,
    /// Exit once the whole swarm is complete
    pub exit_when_swarm_complete: bool,
}

impl Config {
    /// Create configuration from CLI arguments, reading both files
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let common = CommonConfig::parse(&read_config_file(&args.common_config_path())?)?;
        let peers = parse_peer_info(&read_config_file(&args.peer_info_path())?)?;

        let mut config = Self::new(common, peers, PeerId(args.peer_id), args.config_dir.clone());
        config.exit_when_swarm_complete = args.exit_when_swarm_complete;
        Ok(config)
    }

    /// Create configuration from already-parsed parts
    pub fn new(common: CommonConfig, peers: Vec<PeerInfoEntry>, local_peer_id: PeerId, work_dir: PathBuf) -> Self {
        Self {
            common,
            peers,
            local_peer_id,
            work_dir,
            exit_when_swarm_complete: false,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.common.file_size == 0 {
            return Err(SwarmError::config_error_with_field("file size must be positive", "FileSize").into());
        }
        if self.common.piece_size == 0 {
            return Err(SwarmError::config_error_with_field("piece size must be positive", "PieceSize").into());
        }
        if self.common.number_of_preferred_neighbors == 0 {
            return Err(SwarmError::config_error_with_field(
                "at least one preferred neighbor is required",
                "NumberOfPreferredNeighbors"
            ).into());
        }
        if self.common.unchoking_interval.is_zero() {
            return Err(SwarmError::config_error_with_field("interval must be positive", "UnchokingInterval").into());
        }
        if self.common.optimistic_unchoking_interval.is_zero() {
            return Err(SwarmError::config_error_with_field(
                "interval must be positive",
                "OptimisticUnchokingInterval"
            ).into());
        }
        if self.common.file_name.is_empty() {
            return Err(SwarmError::config_error_with_field("file name cannot be empty", "FileName").into());
        }
        self.local_entry()?;
        Ok(())
    }

    /// This process's entry in the peer list
    pub fn local_entry(&self) -> Result<&PeerInfoEntry> {
        self.peers
            .iter()
            .find(|entry| entry.peer_id == self.local_peer_id)
            .ok_or_else(|| {
                SwarmError::config_error_with_field(
                    format!("peer {} is not listed in the peer info file", self.local_peer_id),
                    "peerId"
                ).into()
            })
    }

    /// Neighbors listed before this peer; those are dialed, the rest
    /// connect to us
    pub fn neighbors_to_dial(&self) -> Vec<&PeerInfoEntry> {
        self.peers
            .iter()
            .take_while(|entry| entry.peer_id != self.local_peer_id)
            .collect()
    }

    /// Number of other peers in the swarm
    pub fn neighbor_count(&self) -> usize {
        self.peers.iter().filter(|entry| entry.peer_id != self.local_peer_id).count()
    }

    /// Get the listen address for incoming connections
    pub fn listen_addr(&self) -> Result<String> {
        Ok(format!("0.0.0.0:{}", self.local_entry()?.port))
    }

    /// Directory holding this peer's copy of the file
    pub fn peer_dir(&self) -> PathBuf {
        self.work_dir.join(format!("peer_{}", self.local_peer_id))
    }

    /// Path of this peer's copy of the shared file
    pub fn shared_file_path(&self) -> PathBuf {
        self.peer_dir().join(&self.common.file_name)
    }

    /// Piece geometry of the shared file
    pub fn layout(&self) -> Result<PieceLayout> {
        PieceLayout::new(self.common.file_size, self.common.piece_size)
    }

    /// Election periods
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            unchoking_interval: self.common.unchoking_interval,
            optimistic_unchoking_interval: self.common.optimistic_unchoking_interval,
        }
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    info!("Loading configuration file: {}", path.display());
    let contents = std::fs::read_to_string(path)
        .map_err(|e| {
            error!("Failed to read configuration file '{}': {}", path.display(), e);
            SwarmError::config_error(format!("failed to read '{}': {}", path.display(), e))
        })?;
    debug!("Configuration file size: {} bytes", contents.len());
    Ok(contents)
}
