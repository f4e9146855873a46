use std::fmt;

use serde::Serialize;

use crate::error::CloseReason;

/// Lifecycle of one channel.
///
/// `Opening -> Open -> Closing -> Closed`, with `Errored` reachable from any
/// state when an exchange fails or the connection dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
    Errored,
}

impl ChannelState {
    /// Closed or Errored: nothing more will happen on this channel.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }

    /// Lowercase label, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Opening => "opening",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a connection, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// `Connection.Close` sent, waiting for `Connection.CloseOk`.
    Closing(CloseReason),
    Closed(CloseReason),
}

impl ConnectionState {
    /// True before any close has started.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}
