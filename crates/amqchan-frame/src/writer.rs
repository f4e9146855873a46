use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};

use crate::codec::{encode_frame, Frame, FrameConfig, FrameKind, FRAME_END, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::method::Method;

/// Blocking writer of AMQP frames.
///
/// Every frame is encoded in full before a single `write_all`, so a writer
/// shared behind a lock never interleaves two frames' bytes.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Writer with the default frame limits.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Writer that rejects payloads over `config.max_payload_size`.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(512),
            config,
        }
    }

    /// Send an already-built frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, frame.channel, frame.payload.as_ref())
    }

    /// Encode `method` straight into a method frame on `channel`.
    ///
    /// Nothing is written if the method cannot be encoded or exceeds the
    /// payload limit.
    pub fn send_method(&mut self, channel: u16, method: &Method) -> Result<()> {
        self.buf.clear();
        self.buf.put_u8(FrameKind::Method.as_u8());
        self.buf.put_u16(channel);
        self.buf.put_u32(0);
        method.encode(&mut self.buf)?;

        let size = self.buf.len() - HEADER_SIZE;
        self.check_size(size)?;
        self.buf[3..HEADER_SIZE].copy_from_slice(&(size as u32).to_be_bytes());
        self.buf.put_u8(FRAME_END);
        self.flush_buf()
    }

    /// A heartbeat on channel 0.
    pub fn send_heartbeat(&mut self) -> Result<()> {
        self.write_frame(&Frame::heartbeat())
    }

    /// Frame and send a raw payload.
    pub fn send(&mut self, kind: FrameKind, channel: u16, payload: &[u8]) -> Result<()> {
        self.check_size(payload.len())?;
        self.buf.clear();
        encode_frame(kind, channel, payload, &mut self.buf)?;
        self.flush_buf()
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        match self.inner.write_all(&self.buf) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WriteZero => {
                return Err(FrameError::ConnectionClosed)
            }
            Err(err) => return Err(FrameError::Io(err)),
        }
        self.flush()
    }

    /// Flush the underlying writer, retrying on `Interrupted`.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying writer.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwrap the underlying writer.
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
