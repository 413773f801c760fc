//! Reference packet codec for the client wire protocol.
//!
//! The packet framing itself is an external collaborator; this module
//! supplies a minimal, length-prefixed implementation so the end-to-end
//! scenarios are runnable without depending on a production acceptor.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Wire packet kinds, matching the four packet types of the client protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Initial handshake blob sent by the client.
    Handshake(Vec<u8>),
    /// Handshake acknowledgement sent by the client after accepting the
    /// server's handshake reply.
    HandshakeAck,
    /// Application payload, decoded further by the handler service into a
    /// [`crate::message::Message`].
    Data(Vec<u8>),
    /// Keep-alive; carries no payload.
    Heartbeat,
}

const TAG_HANDSHAKE: u8 = 1;
const TAG_HANDSHAKE_ACK: u8 = 2;
const TAG_DATA: u8 = 3;
const TAG_HEARTBEAT: u8 = 4;

/// Maximum accepted frame body, guarding against a malicious length prefix.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Failure decoding or encoding a packet frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The declared frame length exceeded [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
    /// An unrecognised packet tag byte.
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
}

/// Length-prefixed `[u32 len][u8 tag][body]` framing.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Builds a new codec instance.
    #[must_use]
    pub const fn new() -> Self { Self }
}

impl Decoder for PacketCodec {
    type Error = CodecError;
    type Item = Packet;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(CodecError::FrameTooLarge(0));
        }
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(len);
        let tag = body.get_u8();
        let packet = match tag {
            TAG_HANDSHAKE => Packet::Handshake(body.to_vec()),
            TAG_HANDSHAKE_ACK => Packet::HandshakeAck,
            TAG_DATA => Packet::Data(body.to_vec()),
            TAG_HEARTBEAT => Packet::Heartbeat,
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, body): (u8, &[u8]) = match &item {
            Packet::Handshake(body) => (TAG_HANDSHAKE, body),
            Packet::HandshakeAck => (TAG_HANDSHAKE_ACK, &[]),
            Packet::Data(body) => (TAG_DATA, body),
            Packet::Heartbeat => (TAG_HEARTBEAT, &[]),
        };
        let len = body.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        dst.reserve(4 + len);
        #[expect(
            clippy::cast_possible_truncation,
            reason = "len is bounded by MAX_FRAME_LEN above u32::MAX range"
        )]
        dst.put_u32(len as u32);
        dst.put_u8(tag);
        dst.put_slice(body);
        Ok(())
    }
}
