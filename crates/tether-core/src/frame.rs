//! RPC framing: protocol events and the encoder that turns them into
//! length-prefixed messages for a write channel.
//!
//! Each frame is a 16-byte `FrameHeader` followed by `length` payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, I32, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::WireError;

// ── Events ────────────────────────────────────────────────────────────────────

/// Every event a session can push toward its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Opens the exchange: names the event the peer should run.
    Invoke { event: String },
    /// A piece of the response or request body.
    Chunk(Bytes),
    /// Terminates the exchange with an application error.
    Error { code: i32, reason: String },
    /// Terminates the exchange normally.
    Choke,
}

impl ProtocolEvent {
    pub fn kind(&self) -> FrameKind {
        match self {
            ProtocolEvent::Invoke { .. } => FrameKind::Invoke,
            ProtocolEvent::Chunk(_) => FrameKind::Chunk,
            ProtocolEvent::Error { .. } => FrameKind::Error,
            ProtocolEvent::Choke => FrameKind::Choke,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Invoke = 0x01,
    Chunk = 0x02,
    Error = 0x03,
    Choke = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(FrameKind::Invoke),
            0x02 => Ok(FrameKind::Chunk),
            0x03 => Ok(FrameKind::Error),
            0x04 => Ok(FrameKind::Choke),
            other => Err(WireError::MalformedFrame(format!(
                "unknown frame kind 0x{other:02x}"
            ))),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Payload length, not including this header.
    pub length: U32<NetworkEndian>,
    /// Session the frame belongs to.
    pub session_id: U64<NetworkEndian>,
    pub kind: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 3],
}

assert_eq_size!(FrameHeader, [u8; 16]);

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Frames larger than this are refused by the decoder.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Turns a session's events into self-delimiting messages.
///
/// The transport never looks inside the result. An event that cannot be
/// framed is refused rather than truncated.
pub trait Encoder: Send + Sync {
    fn encode(&self, session_id: u64, event: &ProtocolEvent) -> Result<Bytes, WireError>;
}

/// The default tether framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl Encoder for FrameEncoder {
    fn encode(&self, session_id: u64, event: &ProtocolEvent) -> Result<Bytes, WireError> {
        let payload_len = match event {
            ProtocolEvent::Invoke { event } => event.len(),
            ProtocolEvent::Chunk(data) => data.len(),
            ProtocolEvent::Error { reason, .. } => 4 + reason.len(),
            ProtocolEvent::Choke => 0,
        };
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_len));
        }

        let header = FrameHeader {
            length: U32::new(payload_len as u32),
            session_id: U64::new(session_id),
            kind: event.kind() as u8,
            reserved: [0; 3],
        };

        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        out.put_slice(header.as_bytes());
        match event {
            ProtocolEvent::Invoke { event } => out.put_slice(event.as_bytes()),
            ProtocolEvent::Chunk(data) => out.put_slice(data),
            ProtocolEvent::Error { code, reason } => {
                out.put_slice(I32::<NetworkEndian>::new(*code).as_bytes());
                out.put_slice(reason.as_bytes());
            }
            ProtocolEvent::Choke => {}
        }
        Ok(out.freeze())
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session_id: u64,
    pub event: ProtocolEvent,
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, and
/// otherwise the frame plus the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
    let header = match FrameHeader::read_from_prefix(buf) {
        Some(h) => h,
        None => return Ok(None),
    };

    let length = header.length.get() as usize;
    if length > MAX_FRAME_PAYLOAD {
        return Err(WireError::MalformedFrame(format!(
            "payload length {length} exceeds {MAX_FRAME_PAYLOAD}"
        )));
    }
    if buf.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length];
    let event = match FrameKind::try_from(header.kind)? {
        FrameKind::Invoke => ProtocolEvent::Invoke {
            event: utf8(payload)?,
        },
        FrameKind::Chunk => ProtocolEvent::Chunk(Bytes::copy_from_slice(payload)),
        FrameKind::Error => {
            let code = I32::<NetworkEndian>::read_from_prefix(payload)
                .ok_or_else(|| WireError::MalformedFrame("error frame without code".into()))?;
            ProtocolEvent::Error {
                code: code.get(),
                reason: utf8(&payload[4..])?,
            }
        }
        FrameKind::Choke => ProtocolEvent::Choke,
    };

    Ok(Some((
        Frame {
            session_id: header.session_id.get(),
            event,
        },
        FRAME_HEADER_SIZE + length,
    )))
}

fn utf8(bytes: &[u8]) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| WireError::MalformedFrame(format!("invalid utf-8: {e}")))
}
