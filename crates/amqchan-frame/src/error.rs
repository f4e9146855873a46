/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header names a frame type this codec does not know.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The octet after the payload is not the frame-end marker.
    #[error("invalid frame end 0x{0:02X} (expected 0xCE)")]
    InvalidFrameEnd(u8),

    /// The broker answered with its own protocol header instead of a frame,
    /// which is how it refuses the client's protocol version.
    #[error("broker rejected protocol, it speaks AMQP {major}-{minor}-{revision}")]
    ProtocolRejected { major: u8, minor: u8, revision: u8 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A method payload could not be decoded or encoded.
    #[error("malformed method: {0}")]
    Malformed(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
