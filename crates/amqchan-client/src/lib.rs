//! Client-side channel multiplexing for AMQP connections.
//!
//! One [`Connection`] owns the transport and a single dispatch thread that
//! reads every incoming frame. Each [`Channel`] is a small state machine
//! whose synchronous calls register a pending reply with the connection's
//! [`Router`] before the request is written, then block until the dispatch
//! loop hands over the matching frame, a protocol error, or a
//! connection-closed error.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod router;
pub mod state;

mod table;

#[cfg(all(test, unix))]
mod testing;

pub use channel::Channel;
pub use config::ConnectionConfig;
pub use connection::{Connection, Unsolicited};
pub use error::{ClientError, CloseReason, Result};
pub use router::{PendingReply, Router, RouterStats};
pub use state::{ChannelState, ConnectionState};
