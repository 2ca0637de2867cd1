//! CLI module
//!
//! Command-line interface and configuration files for the peer process.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{parse_peer_info, CommonConfig, Config, PeerInfoEntry};
