//! Wire frame codec.
//!
//! Format: `u32_be length || u8 type || payload[length - 1]`, where the
//! length counts the type byte plus the payload.
//!
//! The codec ensures:
//! - Frames are length-prefixed for stream framing
//! - Maximum frame size is enforced before buffering
//! - Partial reads return Ok(None) to support streaming

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};

use super::{Packet, PacketType};

/// Length of the frame header (4 bytes, big-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Codec for length-prefixed packet frames.
pub struct Codec;

impl Codec {
    /// Encode a packet to bytes including the 4-byte length header.
    pub fn encode(pkt: &Packet) -> Result<Bytes> {
        let frame_len = 1 + pkt.payload.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "frame too large: {} bytes (max {})",
                    frame_len, MAX_FRAME_SIZE
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(pkt.packet_type as u8);
        buf.put_slice(&pkt.payload);

        Ok(buf.freeze())
    }

    /// Decode one packet from a buffer.
    ///
    /// Returns:
    /// - Ok(Some(pkt)) if a complete frame was decoded (buffer is advanced)
    /// - Ok(None) if more data is needed (buffer unchanged)
    /// - Err if the frame is invalid
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Peek the length without consuming
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if len == 0 {
            return Err(Error::Codec {
                message: "zero-length frame".into(),
            });
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!("frame length {} exceeds maximum {}", len, MAX_FRAME_SIZE),
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let packet_type = PacketType::try_from(buf[0])?;
        buf.advance(1);
        let payload = buf.split_to(len - 1).freeze();

        Ok(Some(Packet {
            packet_type,
            payload,
        }))
    }

    /// True if the buffer holds at least one complete, well-sized frame.
    pub fn has_frame(buf: &BytesMut) -> bool {
        if buf.len() < FRAME_HEADER_LEN {
            return false;
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        len > 0 && len <= MAX_FRAME_SIZE && buf.len() >= FRAME_HEADER_LEN + len
    }

    /// Decode from a slice (convenience for testing).
    pub fn decode_slice(data: &[u8]) -> Result<Option<Packet>> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)
    }
}
