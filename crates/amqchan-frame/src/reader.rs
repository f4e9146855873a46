use std::io::{ErrorKind, Read};

use amqchan_transport::Stream;
use bytes::BytesMut;

use crate::codec::{
    decode_frame, Frame, FrameConfig, FRAME_OVERHEAD, HEADER_SIZE, PROTOCOL_HEADER,
};
use crate::error::{FrameError, Result};

/// Blocking reader of AMQP frames.
///
/// Bytes already received stay buffered across errors, so a read timeout in
/// the middle of a frame can simply be retried.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    frames: u64,
}

impl<T: Read> FrameReader<T> {
    /// Reader with the default frame limits.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Reader with explicit limits; `read_timeout` is not applied to `inner`.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_SIZE + 4096),
            config,
            frames: 0,
        }
    }

    /// Block until the next whole frame is available.
    ///
    /// EOF at a frame boundary or inside a frame is `ConnectionClosed`.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                self.frames += 1;
                return Ok(frame);
            }
            let wanted = self.bytes_wanted();
            self.fill(wanted)?;
        }
    }

    /// Bytes still missing for the frame at the head of the buffer.
    fn bytes_wanted(&self) -> usize {
        if self.buf.first() == Some(&PROTOCOL_HEADER[0]) {
            return PROTOCOL_HEADER.len().saturating_sub(self.buf.len()).max(1);
        }
        if self.buf.len() < HEADER_SIZE {
            return HEADER_SIZE - self.buf.len();
        }
        let size = u32::from_be_bytes([self.buf[3], self.buf[4], self.buf[5], self.buf[6]]);
        (FRAME_OVERHEAD + size as usize).saturating_sub(self.buf.len()).max(1)
    }

    /// Append at least one byte (and at most `wanted`) to the buffer.
    fn fill(&mut self, wanted: usize) -> Result<()> {
        let start = self.buf.len();
        self.buf.resize(start + wanted, 0);
        loop {
            match self.inner.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    return Err(FrameError::ConnectionClosed);
                }
                Ok(n) => {
                    self.buf.truncate(start + n);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.truncate(start);
                    return Err(FrameError::Io(err));
                }
            }
        }
    }

    /// Frames decoded so far.
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Borrow the underlying reader.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwrap the underlying reader. Buffered bytes of a partial frame are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Apply a renegotiated frame-max to subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame limits.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<Stream> {
    /// Reader over a transport stream, with the configured read timeout applied.
    pub fn with_config_stream(inner: Stream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

fn transport_to_frame_error(err: amqchan_transport::TransportError) -> FrameError {
    match err {
        amqchan_transport::TransportError::Io(io) => FrameError::Io(io),
        amqchan_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
