//! Swarm protocol messages
//!
//! Typed view over [`Frame`]s. Type codes are decoded once here and the
//! rest of the crate dispatches on [`Message`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::Result;
use tracing::{error, trace, warn};

use super::wire::{encode_frame, Frame};
use crate::error::SwarmError;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            _ => Err(SwarmError::protocol_error_with_source(
                "Unknown message type",
                format!("value: {}", value)
            ).into()),
        }
    }
}

/// Swarm protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { piece_index: u32 },
    Piece { piece_index: u32, data: Bytes },
}

impl Message {
    /// Get the message type code
    pub fn message_id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
        }
    }

    /// Payload length (excluding length prefix and type byte)
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have { .. } | Message::Request { .. } => 4,
            Message::Bitfield { bitfield } => bitfield.len(),
            Message::Piece { data, .. } => 4 + data.len(),
        }
    }

    /// Convert into a raw frame
    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::with_capacity(self.payload_len());
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } | Message::Request { piece_index } => {
                payload.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                payload.put_slice(bitfield);
            }
            Message::Piece { piece_index, data } => {
                payload.put_u32(*piece_index);
                payload.put_slice(data);
            }
        }
        Frame::new(self.message_id() as u8, payload.freeze())
    }

    /// Decode a raw frame; unknown type codes yield `Ok(None)`
    pub fn from_frame(frame: Frame) -> Result<Option<Self>> {
        let message_id = match MessageId::try_from(frame.id) {
            Ok(id) => id,
            Err(_) => {
                warn!("Ignoring message with unknown type {} ({} payload bytes)", frame.id, frame.payload.len());
                return Ok(None);
            }
        };

        let mut payload = frame.payload;
        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: read_index(&mut payload, message_id)?,
            },
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request => Message::Request {
                piece_index: read_index(&mut payload, message_id)?,
            },
            MessageId::Piece => {
                let piece_index = read_index(&mut payload, message_id)?;
                Message::Piece { piece_index, data: payload }
            }
        };

        trace!("Decoded {:?} message", message_id);
        Ok(Some(message))
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let frame = self.to_frame();
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        encode_frame(&mut buf, &frame);
        buf.to_vec()
    }
}

fn read_index(payload: &mut Bytes, message_id: MessageId) -> Result<u32> {
    if payload.remaining() < 4 {
        error!("{:?} message too short: expected 4 bytes, got {}", message_id, payload.remaining());
        return Err(SwarmError::protocol_error_with_source(
            format!("{:?} message too short", message_id),
            format!("expected 4 bytes, got {}", payload.remaining())
        ).into());
    }
    Ok(payload.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let serialized = message.serialize();
        let frame = message.to_frame();
        assert_eq!(serialized.len(), frame.encoded_len());
        assert_eq!(&serialized[..4], &(frame.payload.len() as u32).to_be_bytes());
        assert_eq!(serialized[4], frame.id);
        Message::from_frame(frame).unwrap().unwrap()
    }

    #[test]
    fn test_control_messages() {
        for message in [Message::Choke, Message::Unchoke, Message::Interested, Message::NotInterested] {
            let serialized = message.serialize();
            assert_eq!(serialized.len(), 5);
            assert_eq!(&serialized[..4], &[0, 0, 0, 0]);
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_have_and_request() {
        assert_eq!(round_trip(Message::Have { piece_index: 42 }), Message::Have { piece_index: 42 });
        assert_eq!(round_trip(Message::Request { piece_index: 7 }), Message::Request { piece_index: 7 });
        assert_eq!(Message::Request { piece_index: 7 }.serialize(), vec![0, 0, 0, 4, 6, 0, 0, 0, 7]);
    }

    #[test]
    fn test_piece_message() {
        let data = Bytes::from(vec![9u8; 400]);
        let message = Message::Piece { piece_index: 2, data: data.clone() };
        assert_eq!(message.payload_len(), 404);
        assert_eq!(round_trip(message), Message::Piece { piece_index: 2, data });
    }

    #[test]
    fn test_empty_bitfield() {
        let message = Message::Bitfield { bitfield: Bytes::new() };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let frame = Frame::new(8, vec![0, 0, 0, 1]);
        assert!(Message::from_frame(frame).unwrap().is_none());
    }

    #[test]
    fn test_short_have_is_error() {
        let frame = Frame::new(MessageId::Have as u8, vec![0, 1]);
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(7).unwrap(), MessageId::Piece);
        assert!(MessageId::try_from(8).is_err());
    }
}
