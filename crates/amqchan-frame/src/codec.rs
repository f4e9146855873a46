use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: type (1) + channel (2) + size (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Frame-end octet that terminates every frame.
pub const FRAME_END: u8 = 0xCE;

/// Header plus frame-end: bytes a frame costs beyond its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Protocol header a client sends on connect, and a broker sends back when
/// it refuses the requested version.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Default frame-max (whole frame, overhead included): 128 KiB.
pub const DEFAULT_FRAME_MAX: usize = 128 * 1024;

/// General frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Method,
    Header,
    Body,
    Heartbeat,
}

impl FrameKind {
    /// Wire value of this frame type.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Method => 1,
            FrameKind::Header => 2,
            FrameKind::Body => 3,
            FrameKind::Heartbeat => 8,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Method),
            2 => Ok(FrameKind::Header),
            3 => Ok(FrameKind::Body),
            8 => Ok(FrameKind::Heartbeat),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// A raw frame with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameKind,
    /// The channel this frame belongs to.
    pub channel: u16,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    /// A heartbeat frame (always on channel 0, empty payload).
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, crate::CONNECTION, Bytes::new())
    }

    /// The total wire size of this frame (header + payload + frame-end).
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬───────────┬───────────┬──────────────────┬──────────┐
/// │ Type(1B) │ Channel   │ Size      │ Payload          │ End (1B) │
/// │          │ (2B BE)   │ (4B BE)   │ (Size bytes)     │ 0xCE     │
/// └──────────┴───────────┴───────────┴──────────────────┴──────────┘
/// ```
pub fn encode_frame(
    kind: FrameKind,
    channel: u16,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_u8(kind.as_u8());
    dst.put_u16(channel);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    dst.put_u8(FRAME_END);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.first() == Some(&PROTOCOL_HEADER[0]) {
        return check_protocol_header(src);
    }
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind = FrameKind::try_from(src[0])?;
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = FRAME_OVERHEAD + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    let end = src[HEADER_SIZE + payload_len];
    if end != FRAME_END {
        return Err(FrameError::InvalidFrameEnd(end));
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    src.advance(1);

    Ok(Some(Frame {
        kind,
        channel,
        payload,
    }))
}

/// Treat a leading `AMQP` as the broker's version-refusal header.
fn check_protocol_header(src: &BytesMut) -> Result<Option<Frame>> {
    let n = src.len().min(4);
    if src[..n] != PROTOCOL_HEADER[..n] {
        return Err(FrameError::UnknownFrameType(src[0]));
    }
    if src.len() < PROTOCOL_HEADER.len() {
        return Ok(None);
    }
    Err(FrameError::ProtocolRejected {
        major: src[5],
        minor: src[6],
        revision: src[7],
    })
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: frame-max minus overhead.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl FrameConfig {
    /// Config whose payload limit matches a negotiated frame-max.
    pub fn for_frame_max(frame_max: usize) -> Self {
        Self {
            max_payload_size: frame_max.saturating_sub(FRAME_OVERHEAD),
            ..Self::default()
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_FRAME_MAX - FRAME_OVERHEAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
