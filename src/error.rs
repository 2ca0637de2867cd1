//! Error types for the swarm peer
//!
//! This module defines the error types shared by the codec, the session
//! engine, the piece store and configuration loading.

use std::fmt;

/// Error type for swarm operations
#[derive(Debug, Clone)]
pub enum SwarmError {
    /// Wire protocol errors (bad frames, out-of-range indices)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Handshake header or peer id did not match
    HandshakeMismatch {
        message: String,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    /// Session level errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Piece store and file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl SwarmError {
    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        SwarmError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a HandshakeMismatch for a bad header
    pub fn handshake_header_mismatch() -> Self {
        SwarmError::HandshakeMismatch {
            message: "invalid handshake header".to_string(),
            expected: None,
            actual: None,
        }
    }

    /// Create a HandshakeMismatch for an unexpected peer id
    pub fn handshake_peer_mismatch(expected: u32, actual: u32) -> Self {
        SwarmError::HandshakeMismatch {
            message: "unexpected peer id in handshake".to_string(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    /// Create a new PeerError with peer
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        SwarmError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        SwarmError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        SwarmError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        SwarmError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        SwarmError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        SwarmError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        SwarmError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Whether this error came from a handshake check
    pub fn is_handshake_mismatch(&self) -> bool {
        matches!(self, SwarmError::HandshakeMismatch { .. })
    }
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            SwarmError::HandshakeMismatch { message, expected, actual } => {
                match (expected, actual) {
                    (Some(e), Some(a)) => write!(f, "Handshake mismatch: {} (expected: {}, got: {})", message, e, a),
                    _ => write!(f, "Handshake mismatch: {}", message),
                }
            }
            SwarmError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            SwarmError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            SwarmError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            SwarmError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
        }
    }
}

impl std::error::Error for SwarmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_with_source() {
        let err = SwarmError::protocol_error_with_source("Frame payload too large", "declared 9 bytes, max 8");
        assert_eq!(err.to_string(), "Protocol error: Frame payload too large (source: declared 9 bytes, max 8)");
    }

    #[test]
    fn test_network_error_full() {
        let err = SwarmError::network_error_full("Failed to connect", "127.0.0.1:6008", "connection refused");
        assert!(err.to_string().starts_with("Network error: Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:6008"));
    }

    #[test]
    fn test_handshake_peer_mismatch() {
        let err = SwarmError::handshake_peer_mismatch(1001, 1003);
        assert!(err.is_handshake_mismatch());
        assert!(err.to_string().contains("expected: 1001"));
        assert!(err.to_string().contains("got: 1003"));
    }

    #[test]
    fn test_handshake_header_mismatch() {
        let err = SwarmError::handshake_header_mismatch();
        assert!(err.is_handshake_mismatch());
        assert_eq!(err.to_string(), "Handshake mismatch: invalid handshake header");
    }

    #[test]
    fn test_peer_error_with_peer() {
        let err = SwarmError::peer_error_with_peer("Session closed", "1002");
        assert!(err.to_string().contains("Peer error"));
        assert!(err.to_string().contains("1002"));
    }

    #[test]
    fn test_storage_error_full() {
        let err = SwarmError::storage_error_full("Write failed", "/tmp/out", "disk full");
        assert!(err.to_string().contains("/tmp/out"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = SwarmError::config_error_with_field("must be positive", "PieceSize");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("PieceSize"));
    }
}
