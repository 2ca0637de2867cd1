//! Wire protocol utilities
//!
//! Frame layout: 4-byte big-endian payload length, 1-byte type, payload.
//! The length counts the payload only.

use bytes::{BufMut, Bytes, BytesMut};
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::HANDSHAKE_LENGTH;
use super::{Handshake, Message};
use crate::error::SwarmError;

/// Length prefix plus type byte
pub const FRAME_HEADER_LENGTH: usize = 5;

/// A raw frame: type code and untyped payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Size of the frame on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LENGTH + self.payload.len()
    }
}

/// WireProtocol trait for reading and writing swarm traffic
pub trait WireProtocol {
    /// Read one frame from the stream
    async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Frame>;

    /// Read one typed message; `None` for an unknown type code
    async fn read_message<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Message>>;

    /// Write one frame to the stream
    async fn write_frame<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, frame: &Frame) -> Result<()>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Clone, Copy)]
pub struct PeerWire {
    /// Largest payload accepted from a remote
    max_payload: usize,
}

impl PeerWire {
    /// Create a wire handler that rejects payloads above `max_payload`
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Largest payload accepted from a remote
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl WireProtocol for PeerWire {
    async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_LENGTH];
        reader.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let id = header[4];

        if length > self.max_payload {
            error!("Frame payload too large: {} bytes (max {})", length, self.max_payload);
            return Err(SwarmError::protocol_error_with_source(
                "Frame payload too large",
                format!("declared {} bytes, max {}", length, self.max_payload)
            ).into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        trace!("Read frame type {} with {} payload bytes", id, length);

        Ok(Frame::new(id, payload))
    }

    async fn read_message<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Message>> {
        let frame = self.read_frame(reader).await?;
        Message::from_frame(frame)
    }

    async fn write_frame<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        encode_frame(&mut buf, frame);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        trace!("Wrote frame type {} with {} payload bytes", frame.id, frame.payload.len());
        Ok(())
    }

    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        self.write_frame(writer, &message.to_frame()).await
    }

    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        let serialized = handshake.serialize();
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Encode a frame into the buffer
pub fn encode_frame(buf: &mut BytesMut, frame: &Frame) {
    buf.reserve(frame.encoded_len());
    buf.put_u32(frame.payload.len() as u32);
    buf.put_u8(frame.id);
    buf.put_slice(&frame.payload);
}
