//! Packet definitions for the everterm wire protocol.
//!
//! Every packet is a type byte plus a payload. Structured payloads are
//! bincode-encoded serde records; the keepalive payload is empty. The set of
//! type codes is closed: an unregistered code is a protocol error and
//! terminates the session.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

mod codec;

pub use codec::{Codec, FRAME_HEADER_LEN};

// =============================================================================
// Packet Types
// =============================================================================

/// Closed set of packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// First packet of a session, carrying connection metadata.
    InitialPayload = 0,
    /// Raw terminal bytes in either direction.
    TerminalBuffer = 1,
    /// Terminal dimensions, sent on every change.
    TerminalInfo = 2,
    /// Liveness probe; echoed by the peer.
    KeepAlive = 3,
    /// Ask the peer to open a listening socket.
    PortForwardSourceRequest = 4,
    /// Result of a source request.
    PortForwardSourceResponse = 5,
    /// Ask the peer to dial a destination for a new connection.
    PortForwardDestinationRequest = 6,
    /// Result of a destination request, binding the two conn ids.
    PortForwardDestinationResponse = 7,
    /// Bytes on one forwarded connection; empty buffer is end-of-stream.
    PortForwardData = 8,
}

impl PacketType {
    /// True for the packet types owned by the port-forward subsystem.
    pub fn is_port_forward(self) -> bool {
        matches!(
            self,
            PacketType::PortForwardSourceRequest
                | PacketType::PortForwardSourceResponse
                | PacketType::PortForwardDestinationRequest
                | PacketType::PortForwardDestinationResponse
                | PacketType::PortForwardData
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::InitialPayload),
            1 => Ok(PacketType::TerminalBuffer),
            2 => Ok(PacketType::TerminalInfo),
            3 => Ok(PacketType::KeepAlive),
            4 => Ok(PacketType::PortForwardSourceRequest),
            5 => Ok(PacketType::PortForwardSourceResponse),
            6 => Ok(PacketType::PortForwardDestinationRequest),
            7 => Ok(PacketType::PortForwardDestinationResponse),
            8 => Ok(PacketType::PortForwardData),
            other => Err(Error::protocol(format!("unknown packet type: {other}"))),
        }
    }
}

/// One framed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Build a packet from a structured payload record.
    pub fn from_record<T: Serialize>(packet_type: PacketType, record: &T) -> Result<Self> {
        Ok(Self::new(packet_type, encode_payload(record)?))
    }

    /// Decode this packet's payload into a structured record.
    pub fn record<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }

    /// An empty-payload keepalive probe.
    pub fn keep_alive() -> Self {
        Self::new(PacketType::KeepAlive, Bytes::new())
    }
}

// =============================================================================
// Payload Records
// =============================================================================

/// Connection metadata sent once after the initial connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPayload {
    pub jumphost: bool,
}

/// Raw terminal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalBuffer {
    pub buffer: Vec<u8>,
}

impl TerminalBuffer {
    pub fn new(buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: buffer.into(),
        }
    }
}

/// Terminal dimensions. Field-wise equality; any change is a resize event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

/// Ask the peer to listen on `source_port`, targeting `destination_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardSourceRequest {
    pub source_port: u16,
    pub destination_port: u16,
}

/// Outcome of a source request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardSourceResponse {
    pub source_port: u16,
    pub error: Option<String>,
}

/// Ask the peer to dial `port` on its loopback for connection `conn_id`.
///
/// `conn_id` lives in the requester's id space; the responder echoes it in
/// the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardDestinationRequest {
    pub port: u16,
    pub conn_id: u64,
}

/// Outcome of a destination request.
///
/// `conn_id` echoes the request; `socket_id` is the responder's id for the
/// new connection. Data frames are always tagged with the receiver's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardDestinationResponse {
    pub conn_id: u64,
    pub socket_id: u64,
    pub error: Option<String>,
}

/// Bytes on one forwarded connection. An empty buffer signals end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardData {
    pub conn_id: u64,
    pub buffer: Vec<u8>,
}

impl PortForwardData {
    pub fn new(conn_id: u64, buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            conn_id,
            buffer: buffer.into(),
        }
    }

    /// End-of-stream marker for `conn_id`.
    pub fn eof(conn_id: u64) -> Self {
        Self::new(conn_id, Vec::new())
    }

    pub fn is_eof(&self) -> bool {
        self.buffer.is_empty()
    }
}

// =============================================================================
// Payload Encoding
// =============================================================================

/// Encode a payload record with the stable wire serialization.
pub fn encode_payload<T: Serialize>(record: &T) -> Result<Bytes> {
    let bytes = bincode::serialize(record).map_err(|e| Error::Codec {
        message: format!("payload serialization failed: {e}"),
    })?;
    Ok(Bytes::from(bytes))
}

/// Decode a payload record.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::Codec {
        message: format!("payload deserialization failed: {e}"),
    })
}
