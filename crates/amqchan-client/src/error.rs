use std::fmt;
use std::time::Duration;

use amqchan_frame::channel::channel_label;
use amqchan_frame::MethodId;

use crate::state::ChannelState;

/// Why a connection stopped accepting work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The broker sent `Connection.Close`.
    Broker { code: u16, text: String },
    /// This side requested the close.
    Local { code: u16, text: String },
    /// The transport failed, hit EOF, or could not be written.
    Transport(String),
    /// The broker sent something undecodable on channel 0.
    Protocol(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Broker { code, text } => write!(f, "closed by broker ({code} {text})"),
            CloseReason::Local { code, text } => write!(f, "closed locally ({code} {text})"),
            CloseReason::Transport(msg) => write!(f, "transport failure: {msg}"),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

/// Errors that can occur in connection and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] amqchan_transport::TransportError),

    /// Frame-level error (I/O or an undecodable frame from the broker).
    #[error("frame error: {0}")]
    Frame(#[from] amqchan_frame::FrameError),

    /// A method could not be encoded; nothing was written.
    #[error("cannot encode method: {0}")]
    Encode(amqchan_frame::FrameError),

    /// The connection is gone. Every waiter on every channel sees this.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// A reply arrived that does not answer the outstanding call.
    #[error(
        "unexpected {received} on {} (expected {})",
        channel_label(*.channel),
        format_ids(.expected)
    )]
    UnexpectedFrame {
        channel: u16,
        expected: Vec<MethodId>,
        received: MethodId,
    },

    /// The broker closed the channel while a call was outstanding.
    #[error("channel {channel} closed by broker ({code} {text})")]
    ChannelClosed { channel: u16, code: u16, text: String },

    /// The operation is not valid in the channel's current state.
    #[error("channel {channel} is {state}, cannot {operation}")]
    InvalidState {
        channel: u16,
        state: ChannelState,
        operation: &'static str,
    },

    /// A call is already outstanding on this channel number.
    #[error("channel {0} already has a call in flight")]
    ChannelBusy(u16),

    /// Every channel number up to channel-max is in use or retired.
    #[error("no free channel numbers (channel-max {0})")]
    ChannelsExhausted(u16),

    /// Invalid connection configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bounded wait expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True for bounded-wait expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// True when the whole connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionClosed(_) | ClientError::Transport(_)
        ) || matches!(self, ClientError::Frame(err) if !matches!(err, amqchan_frame::FrameError::Malformed(_)))
    }

    /// True for caller mistakes reported before anything reached the wire.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidState { .. }
                | ClientError::ChannelBusy(_)
                | ClientError::ChannelsExhausted(_)
                | ClientError::Encode(_)
                | ClientError::Config(_)
        )
    }
}

fn format_ids(ids: &[MethodId]) -> String {
    if ids.is_empty() {
        return "nothing".to_string();
    }
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use amqchan_frame::FrameError;

    use super::*;

    #[test]
    fn unexpected_frame_names_both_sides() {
        let err = ClientError::UnexpectedFrame {
            channel: 3,
            expected: vec![MethodId::BASIC_GET_OK, MethodId::BASIC_GET_EMPTY],
            received: MethodId::CHANNEL_FLOW_OK,
        };
        assert_eq!(
            err.to_string(),
            "unexpected channel.flow-ok on channel #3 (expected basic.get-ok | basic.get-empty)"
        );
    }

    #[test]
    fn classification() {
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(ClientError::ConnectionClosed(CloseReason::Transport("eof".into()))
            .is_connection_error());
        assert!(ClientError::Frame(FrameError::ConnectionClosed).is_connection_error());
        assert!(!ClientError::Frame(FrameError::Malformed("x".into())).is_connection_error());
        assert!(ClientError::InvalidState {
            channel: 1,
            state: ChannelState::Closed,
            operation: "close",
        }
        .is_usage_error());
        assert!(!ClientError::ChannelClosed {
            channel: 1,
            code: 404,
            text: "NOT_FOUND".into(),
        }
        .is_usage_error());
    }

    #[test]
    fn close_reason_display() {
        let reason = CloseReason::Broker {
            code: 320,
            text: "CONNECTION_FORCED".into(),
        };
        assert_eq!(reason.to_string(), "closed by broker (320 CONNECTION_FORCED)");
    }
}
