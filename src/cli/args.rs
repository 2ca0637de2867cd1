//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the peer process
#[derive(Debug, Parser)]
#[command(name = "peer-process")]
#[command(about = "A peer in a fixed file-sharing swarm", long_about = None)]
pub struct CliArgs {
    /// This peer's id, as listed in the peer info file
    #[arg(value_name = "PEER_ID")]
    pub peer_id: u32,

    /// Directory holding the configuration files, peer directories and logs
    #[arg(short = 'd', long, value_name = "DIR", default_value = ".")]
    pub config_dir: PathBuf,

    /// Common configuration file, relative to the config directory
    #[arg(long, value_name = "FILE", default_value = "Common.cfg")]
    pub common_config: PathBuf,

    /// Peer info file, relative to the config directory
    #[arg(long, value_name = "FILE", default_value = "PeerInfo.cfg")]
    pub peer_info: PathBuf,

    /// Exit once every peer in the swarm holds the complete file
    #[arg(long)]
    pub exit_when_swarm_complete: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Path of the common configuration file
    pub fn common_config_path(&self) -> PathBuf {
        self.config_dir.join(&self.common_config)
    }

    /// Path of the peer info file
    pub fn peer_info_path(&self) -> PathBuf {
        self.config_dir.join(&self.peer_info)
    }

    /// Path of the protocol event log
    pub fn event_log_path(&self) -> PathBuf {
        self.config_dir.join(format!("log_peer_{}.log", self.peer_id))
    }
}
