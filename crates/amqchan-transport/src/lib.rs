//! Duplex byte-stream transport for amqchan connections.
//!
//! This is the lowest layer of amqchan. It knows nothing about frames or
//! channels: a [`Stream`] is a connected socket that can be cloned into a
//! reader half and a writer half.
//!
//! - TCP (`Stream::connect_tcp`)
//! - Unix domain sockets (`Stream::connect_unix`, Unix only)

pub mod error;
pub mod stream;

pub use error::{Result, TransportError};
pub use stream::Stream;
