//! AMQP 0-9-1 frame codec and method table.
//!
//! Every unit on the wire is a general frame:
//! - A 1-byte frame type (method, content header, content body, heartbeat)
//! - A 2-byte big-endian channel number
//! - A 4-byte big-endian payload size, the payload, then the `0xCE` end octet
//!
//! Method frames decode into a typed [`Method`]. The table behind
//! [`Method::is_synchronous`] and [`Method::valid_responses`] tells the
//! client which replies complete a synchronous exchange.

pub mod channel;
pub mod codec;
pub mod error;
pub mod method;
pub mod reader;
pub mod writer;

pub use channel::{is_connection_level, CONNECTION, DEFAULT_CHANNEL_MAX, FIRST_CHANNEL};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameKind, DEFAULT_FRAME_MAX, FRAME_END,
    FRAME_OVERHEAD, HEADER_SIZE, PROTOCOL_HEADER,
};
pub use error::{FrameError, Result};
pub use method::{sync_responses, Method, MethodFrame, MethodId};
pub use reader::FrameReader;
pub use writer::FrameWriter;
