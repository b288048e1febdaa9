//! RFC 6455 frame parsing and serialization.
//!
//! [`FrameCodec`] is a server-role codec: decoded frames must be masked
//! (clients are required to mask everything they send) and encoded frames
//! are written unmasked. Message reassembly from fragments is not the
//! codec's job; the connection reader layers it on top.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::mask::apply_mask;
use super::CloseFrame;
use crate::error::{Error, ProtocolError};

/// Frame type per RFC 6455 §5.2.
///
/// Opcodes 3-7 and 11-15 are reserved and rejected during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continues the payload of a fragmented text or binary message.
    Continuation,
    /// A UTF-8 text frame.
    Text,
    /// A binary frame.
    Binary,
    /// Starts the close handshake.
    Close,
    /// Keep-alive probe; answered with a pong carrying the same payload.
    Ping,
    /// Answer to a ping.
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(ProtocolError::BadOpcode(other)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    /// Whether this is a ping, pong or close frame.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single frame, with the payload already unmasked.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment of the message.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Unmasked payload bytes.
    pub payload: Bytes,
}

impl Frame {
    pub(crate) fn text(payload: Bytes) -> Self {
        Self { fin: true, opcode: OpCode::Text, payload }
    }

    pub(crate) fn binary(payload: Bytes) -> Self {
        Self { fin: true, opcode: OpCode::Binary, payload }
    }

    pub(crate) fn ping(payload: Bytes) -> Self {
        Self { fin: true, opcode: OpCode::Ping, payload }
    }

    pub(crate) fn pong(payload: Bytes) -> Self {
        Self { fin: true, opcode: OpCode::Pong, payload }
    }

    /// Build a close frame; an absent [`CloseFrame`] produces an empty
    /// payload.
    pub(crate) fn close(frame: Option<&CloseFrame>) -> Self {
        let payload = match frame {
            None => Bytes::new(),
            Some(close) => {
                let reason = close.reason.as_str().as_bytes();
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(close.code);
                buf.extend_from_slice(reason);
                buf.freeze()
            }
        };
        Self { fin: true, opcode: OpCode::Close, payload }
    }

    /// Parse a received close payload into code and reason.
    ///
    /// An empty payload means the peer sent no status. A one-byte payload
    /// is a truncated status code; reserved codes are rejected so they
    /// never round-trip back onto the wire.
    pub(crate) fn parse_close(&self) -> Result<Option<CloseFrame>, ProtocolError> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::BadCloseCode(u16::from(self.payload[0]))),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if !valid_close_code(code) {
                    return Err(ProtocolError::BadCloseCode(code));
                }
                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                }))
            }
        }
    }
}

/// Whether a close code may legally appear on the wire (RFC 6455 §7.4).
///
/// 1004, 1005, 1006 and 1015 are reserved for endpoint-internal use;
/// 1016-2999 await protocol revisions; 3000-4999 are registered/private
/// and allowed through.
pub(crate) fn valid_close_code(code: u16) -> bool {
    !(code < 1000 || (1004..=1006).contains(&code) || (1015..=2999).contains(&code) || code >= 5000)
}

/// Streaming server-role frame codec.
///
/// Decoding returns `Ok(None)` until a whole frame is buffered, so it can
/// sit directly under `FramedRead`. Oversized frames are rejected before
/// their payload is buffered.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    /// Create a codec that rejects frames larger than `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];

        if b0 & 0x70 != 0 {
            return Err(ProtocolError::RsvBits.into());
        }
        let opcode = OpCode::from_u8(b0 & 0x0f)?;
        let fin = b0 & 0x80 != 0;
        if opcode.is_control() && !fin {
            return Err(ProtocolError::ControlFragmented.into());
        }

        // RFC 6455 §5.1: the server MUST close the connection on an
        // unmasked client frame, so the mask key is always present below.
        if b1 & 0x80 == 0 {
            return Err(ProtocolError::UnmaskedClient.into());
        }

        // Longer-than-necessary length forms are legal and accepted.
        let (payload_len, len_bytes) = match b1 & 0x7f {
            len @ 0..=125 => (u64::from(len), 0usize),
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from((&src[2..4]).get_u16()), 2)
            }
            _ => {
                if src.len() < 10 {
                    return Ok(None);
                }
                ((&src[2..10]).get_u64(), 8)
            }
        };

        if opcode.is_control() && payload_len > 125 {
            return Err(ProtocolError::ControlTooLong(payload_len as usize).into());
        }
        if payload_len > self.max_message_size as u64 {
            return Err(ProtocolError::MessageTooLarge(payload_len as usize).into());
        }
        let payload_len = payload_len as usize;

        let frame_len = 2 + len_bytes + 4 + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(2 + len_bytes);
        let mut key = [0u8; 4];
        key.copy_from_slice(&src[..4]);
        src.advance(4);

        let mut payload = src.split_to(payload_len);
        apply_mask(&mut payload, key);

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        if frame.opcode.is_control() && frame.payload.len() > 125 {
            return Err(ProtocolError::ControlTooLong(frame.payload.len()).into());
        }

        let len = frame.payload.len();
        dst.reserve(10 + len);
        dst.put_u8((u8::from(frame.fin) << 7) | frame.opcode.as_u8());

        // smallest legal length form; server frames carry no mask
        if len <= 125 {
            dst.put_u8(len as u8);
        } else if len <= 65535 {
            dst.put_u8(126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(len as u64);
        }

        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Serialize a frame the way a conforming client would: masked.
///
/// Test-only: the server never masks, but its tests have to speak for the
/// client side of the wire.
#[cfg(test)]
pub(crate) fn client_frame(fin: bool, opcode: u8, key: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push((u8::from(fin) << 7) | opcode);
    let len = payload.len();
    if len <= 125 {
        out.push(0x80 | len as u8);
    } else if len <= 65535 {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(&key);
    let mut masked = payload.to_vec();
    apply_mask(&mut masked, key);
    out.extend_from_slice(&masked);
    out
}
