//! Client-side AMQP 0-9-1 channel multiplexing.
//!
//! One [`client::Connection`] carries many [`client::Channel`]s. A single
//! dispatch thread reads frames and hands each synchronous reply to the call
//! waiting on its channel.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix socket byte streams
//! - [`frame`]: AMQP frame codec and typed channel/connection methods
//! - [`client`]: connection, dispatch loop, channels and RPC correlation
//! - `logging`: `tracing-subscriber` setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use amqchan_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use amqchan_frame::*;
}

/// Re-export client types.
pub mod client {
    pub use amqchan_client::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use amqchan_client::{Channel, ClientError, Connection, ConnectionConfig};
