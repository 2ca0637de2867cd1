//! Swarm handshake
//!
//! The first 32 bytes exchanged on every connection.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, trace, warn};

use crate::error::SwarmError;
use crate::peer::PeerId;

/// Fixed protocol header
pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// Number of zero bytes between the header and the peer id
pub const HANDSHAKE_ZERO_BITS: usize = 10;

/// Total handshake length on the wire
pub const HANDSHAKE_LENGTH: usize = 32;

/// Swarm handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Id of the sending peer
    pub peer_id: PeerId,
}

impl Handshake {
    /// Create a new handshake announcing `peer_id`
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake for peer {}", self.peer_id);
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_slice(HANDSHAKE_HEADER);
        buf.put_slice(&[0u8; HANDSHAKE_ZERO_BITS]);
        buf.put_u32(self.peer_id.as_u32());
        buf.to_vec()
    }

    /// Deserialize a handshake, checking only the header literal
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LENGTH {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(SwarmError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len())
            ).into());
        }

        if &data[..HANDSHAKE_HEADER.len()] != HANDSHAKE_HEADER {
            warn!("Invalid handshake header: {:?}", String::from_utf8_lossy(&data[..HANDSHAKE_HEADER.len()]));
            return Err(SwarmError::handshake_header_mismatch().into());
        }

        let id_offset = HANDSHAKE_LENGTH - 4;
        let peer_id = u32::from_be_bytes([
            data[id_offset],
            data[id_offset + 1],
            data[id_offset + 2],
            data[id_offset + 3],
        ]);
        debug!("Handshake from peer {}", peer_id);

        Ok(Self { peer_id: PeerId(peer_id) })
    }

    /// Check that the handshake came from the peer we dialed
    pub fn validate(&self, expected: PeerId) -> Result<()> {
        if self.peer_id != expected {
            warn!("Handshake validation failed: expected peer {}, got {}", expected, self.peer_id);
            return Err(SwarmError::handshake_peer_mismatch(expected.as_u32(), self.peer_id.as_u32()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let serialized = Handshake::new(PeerId(1001)).serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LENGTH);
        assert_eq!(&serialized[..18], b"P2PFILESHARINGPROJ");
        assert!(serialized[18..28].iter().all(|&b| b == 0));
        assert_eq!(&serialized[28..], &1001u32.to_be_bytes());
    }

    #[test]
    fn test_handshake_serialize_deserialize() {
        let handshake = Handshake::new(PeerId(0xDEAD_BEEF));
        let deserialized = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_handshake_bad_header() {
        let mut serialized = Handshake::new(PeerId(7)).serialize();
        serialized[0] = b'X';
        let err = Handshake::deserialize(&serialized).unwrap_err();
        let err = err.downcast_ref::<SwarmError>().unwrap();
        assert!(err.is_handshake_mismatch());
    }

    #[test]
    fn test_handshake_too_short() {
        assert!(Handshake::deserialize(&HANDSHAKE_HEADER[..]).is_err());
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new(PeerId(1002));
        assert!(handshake.validate(PeerId(1002)).is_ok());

        let err = handshake.validate(PeerId(1003)).unwrap_err();
        assert!(err.downcast_ref::<SwarmError>().unwrap().is_handshake_mismatch());
    }
}
