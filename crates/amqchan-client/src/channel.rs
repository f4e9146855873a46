//! Channel handle and its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use amqchan_frame::{Method, MethodFrame, MethodId};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::state::ChannelState;
use crate::table::ChannelShared;

/// One logical channel on a [`Connection`].
///
/// Synchronous calls on the same channel are serialized: a second caller
/// blocks until the first call completes, then re-checks the channel state.
pub struct Channel {
    connection: Connection,
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Send `Channel.Open` and wait for `Channel.OpenOk`.
    pub(crate) fn open(connection: Connection, shared: Arc<ChannelShared>) -> Result<Self> {
        let number = shared.number();
        let timeout = connection.config().rpc_timeout;

        let opened = connection
            .call(number, &Method::ChannelOpen, timeout)
            .and_then(|_| shared.transition(ChannelState::Opening, ChannelState::Open, "open"));
        if let Err(err) = opened {
            warn!(channel = number, error = %err, "channel open failed");
            shared.mark_errored();
            return Err(err);
        }
        debug!(channel = number, "channel open");

        Ok(Self { connection, shared })
    }

    /// The channel number on the wire.
    pub fn number(&self) -> u16 {
        self.shared.number()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// True while synchronous calls may be made.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The connection this channel runs on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Close with `200 Normal Shutdown`.
    pub fn close(&self) -> Result<()> {
        self.close_with(200, "Normal Shutdown")
    }

    /// Close with a custom reply code and text.
    ///
    /// Requires `Open`. On `Channel.CloseOk` the channel is `Closed` and its
    /// number may be reused. A close that cannot be encoded leaves the channel
    /// `Open`; any other failure leaves it `Errored` with the number retired.
    pub fn close_with(&self, reply_code: u16, reply_text: impl Into<String>) -> Result<()> {
        let _call = self.shared.lock_call();
        self.close_locked(&Method::channel_close(reply_code, reply_text))
            .map(|_| ())
    }

    /// Send `method` and, if it is synchronous, wait for its reply under the
    /// configured `rpc_timeout`.
    ///
    /// Returns `None` for asynchronous methods once the frame is written.
    pub fn rpc(&self, method: &Method) -> Result<Option<MethodFrame>> {
        self.rpc_with_timeout(method, self.connection.config().rpc_timeout)
    }

    /// As [`Channel::rpc`] with an explicit bound; `None` waits indefinitely.
    pub fn rpc_with_timeout(
        &self,
        method: &Method,
        timeout: Option<Duration>,
    ) -> Result<Option<MethodFrame>> {
        let number = self.number();
        let _call = self.shared.lock_call();

        match method.id() {
            MethodId::CHANNEL_CLOSE => {
                return self.close_locked_with(method, timeout).map(Some);
            }
            MethodId::CHANNEL_OPEN => {
                return Err(ClientError::InvalidState {
                    channel: number,
                    state: self.state(),
                    operation: "open",
                });
            }
            _ => {}
        }

        let state = self.state();
        if state != ChannelState::Open {
            return Err(ClientError::InvalidState {
                channel: number,
                state,
                operation: "rpc",
            });
        }

        if !method.is_synchronous() {
            self.connection.write_frame(method, number)?;
            return Ok(None);
        }

        match self.connection.call(number, method, timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(err) if err.is_usage_error() => Err(err),
            Err(err) => {
                warn!(channel = number, method = %method.id(), error = %err, "rpc failed");
                self.fail();
                Err(err)
            }
        }
    }

    fn close_locked(&self, method: &Method) -> Result<MethodFrame> {
        self.close_locked_with(method, self.connection.config().rpc_timeout)
    }

    fn close_locked_with(&self, method: &Method, timeout: Option<Duration>) -> Result<MethodFrame> {
        let number = self.number();
        self.shared
            .transition(ChannelState::Open, ChannelState::Closing, "close")?;
        debug!(channel = number, "closing channel");

        match self.connection.call(number, method, timeout) {
            Ok(reply) => {
                self.shared.finish(ChannelState::Closed);
                self.connection.release_channel(number);
                debug!(channel = number, "channel closed");
                Ok(reply)
            }
            Err(err) if err.is_usage_error() => {
                // Nothing reached the wire.
                let _ = self
                    .shared
                    .transition(ChannelState::Closing, ChannelState::Open, "close");
                Err(err)
            }
            Err(err) => {
                warn!(channel = number, error = %err, "channel close failed");
                self.fail();
                Err(err)
            }
        }
    }

    /// Errored channels keep their number out of circulation, so a late reply
    /// can never reach a later owner of the number.
    fn fail(&self) {
        self.shared.mark_errored();
        self.connection.retire_channel(self.number());
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::testing::{connect_pair, connect_pair_with, open_channel_pair};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn open_waits_for_open_ok() {
        let (conn, channel, _broker) = open_channel_pair();

        assert_eq!(channel.number(), 1);
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(conn.pending_channels().is_empty());
        assert_eq!(conn.channel_count(), 1);
    }

    #[test]
    fn rpc_close_runs_close_transitions() {
        let (conn, channel, mut broker) = open_channel_pair();
        let closer = thread::spawn(move || {
            let reply = channel.rpc(&Method::channel_close(200, "Normal Shutdown"));
            (channel, reply)
        });

        let request = broker.expect_method(MethodId::CHANNEL_CLOSE);
        assert_eq!(request.channel, 1);
        assert!(matches!(
            request.method,
            Method::ChannelClose {
                reply_code: 200,
                ..
            }
        ));
        broker.send(1, Method::ChannelCloseOk);

        let (channel, reply) = closer.join().unwrap();
        let reply = reply.unwrap().unwrap();
        assert_eq!(reply, MethodFrame::new(1, Method::ChannelCloseOk));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(conn.channel_count(), 0);
    }

    #[test]
    fn closed_channel_number_is_reused() {
        let (conn, channel, mut broker) = open_channel_pair();
        let closer = thread::spawn(move || channel.close());
        broker.accept_close();
        closer.join().unwrap().unwrap();

        let opener = {
            let conn = conn.clone();
            thread::spawn(move || conn.open_channel())
        };
        assert_eq!(broker.accept_open(), 1);
        assert_eq!(opener.join().unwrap().unwrap().number(), 1);
    }

    #[test]
    fn unencodable_close_leaves_the_channel_open() {
        let (conn, channel, mut broker) = open_channel_pair();

        let err = channel.close_with(200, "x".repeat(300)).unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
        assert!(err.is_usage_error());
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(conn.channel_count(), 1);

        let closer = thread::spawn(move || {
            let result = channel.close();
            (channel, result)
        });
        assert_eq!(broker.accept_close(), 1);
        let (channel, result) = closer.join().unwrap();
        result.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(conn.channel_count(), 0);
    }

    #[test]
    fn untyped_close_runs_close_transitions() {
        let (conn, channel, mut broker) = open_channel_pair();
        // reply-code 200, empty reply-text, class-id 0, method-id 0
        let close = Method::other(
            MethodId::CHANNEL_CLOSE,
            &b"\x00\xc8\x00\x00\x00\x00\x00"[..],
        );
        let closer = thread::spawn(move || {
            let reply = channel.rpc(&close);
            (channel, reply)
        });

        let request = broker.expect_method(MethodId::CHANNEL_CLOSE);
        assert!(matches!(
            request.method,
            Method::ChannelClose {
                reply_code: 200,
                ..
            }
        ));
        broker.send(1, Method::ChannelCloseOk);

        let (channel, reply) = closer.join().unwrap();
        assert_eq!(reply.unwrap().unwrap().id(), MethodId::CHANNEL_CLOSE_OK);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(conn.channel_count(), 0);
    }

    #[test]
    fn close_requires_open() {
        let (_conn, channel, mut broker) = open_channel_pair();
        let channel = Arc::new(channel);
        let closer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.close())
        };
        broker.accept_close();
        closer.join().unwrap().unwrap();

        let err = channel.close().unwrap_err();
        assert!(err.is_usage_error());
        assert!(matches!(
            err,
            ClientError::InvalidState {
                channel: 1,
                state: ChannelState::Closed,
                operation: "close",
            }
        ));
        assert!(matches!(
            channel.rpc(&Method::ChannelFlow { active: true }),
            Err(ClientError::InvalidState {
                operation: "rpc",
                ..
            })
        ));
    }

    #[test]
    fn open_ok_out_of_order_reaches_the_right_channel() {
        let (conn, mut broker) = connect_pair();
        let openers: Vec<_> = (0..2)
            .map(|_| {
                let conn = conn.clone();
                thread::spawn(move || conn.open_channel())
            })
            .collect();

        let first = broker.expect_method(MethodId::CHANNEL_OPEN).channel;
        let second = broker.expect_method(MethodId::CHANNEL_OPEN).channel;
        let mut numbers = [first, second];
        numbers.sort_unstable();
        assert_eq!(numbers, [1, 2]);

        broker.send(2, Method::ChannelOpenOk);
        broker.send(1, Method::ChannelOpenOk);

        let mut opened: Vec<u16> = openers
            .into_iter()
            .map(|opener| {
                let channel = opener.join().unwrap().unwrap();
                assert!(channel.is_open());
                channel.number()
            })
            .collect();
        opened.sort_unstable();
        assert_eq!(opened, vec![1, 2]);
        assert!(conn.pending_channels().is_empty());
    }

    #[test]
    fn rpc_timeout_leaves_channel_errored() {
        let (conn, mut broker) = connect_pair_with(ConnectionConfig {
            rpc_timeout: Some(Duration::from_secs(1)),
            ..ConnectionConfig::default()
        });
        let opener = {
            let conn = conn.clone();
            thread::spawn(move || conn.open_channel())
        };
        broker.accept_open();
        let channel = opener.join().unwrap().unwrap();

        let started = Instant::now();
        let err = channel
            .rpc(&Method::other(MethodId::QUEUE_DECLARE, &b"\x00\x00"[..]))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(channel.state(), ChannelState::Errored);
        assert_eq!(conn.channel_count(), 0);

        broker.expect_method(MethodId::QUEUE_DECLARE);
        broker.send(1, Method::other(MethodId::QUEUE_DECLARE_OK, &b"\x00"[..]));
        wait_until(|| conn.stats().unsolicited == 1);
        assert_eq!(conn.stats().delivered, 1);
    }

    #[test]
    fn rpc_returns_the_reply() {
        let (_conn, channel, mut broker) = open_channel_pair();
        let caller = thread::spawn(move || channel.rpc(&Method::ChannelFlow { active: false }));

        let request = broker.expect_method(MethodId::CHANNEL_FLOW);
        assert_eq!(request.method, Method::ChannelFlow { active: false });
        broker.send(1, Method::ChannelFlowOk { active: false });

        let reply = caller.join().unwrap().unwrap().unwrap();
        assert_eq!(reply.method, Method::ChannelFlowOk { active: false });
    }

    #[test]
    fn unexpected_reply_errors_the_channel() {
        let (_conn, channel, mut broker) = open_channel_pair();
        let channel = Arc::new(channel);
        let caller = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.rpc(&Method::other(MethodId::QUEUE_DECLARE, &b""[..])))
        };

        broker.expect_method(MethodId::QUEUE_DECLARE);
        broker.send(1, Method::other(MethodId::EXCHANGE_DECLARE_OK, &b""[..]));

        match caller.join().unwrap() {
            Err(ClientError::UnexpectedFrame {
                channel: 1,
                expected,
                received,
            }) => {
                assert_eq!(expected, vec![MethodId::QUEUE_DECLARE_OK]);
                assert_eq!(received, MethodId::EXCHANGE_DECLARE_OK);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(channel.state(), ChannelState::Errored);
    }

    #[test]
    fn broker_close_fails_the_call_in_flight() {
        let (conn, channel, mut broker) = open_channel_pair();
        let channel = Arc::new(channel);
        let caller = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                channel.rpc(&Method::other(MethodId::QUEUE_DECLARE, &b"\x00\x00"[..]))
            })
        };

        broker.expect_method(MethodId::QUEUE_DECLARE);
        broker.send(
            1,
            Method::ChannelClose {
                reply_code: 404,
                reply_text: "NOT_FOUND".to_string(),
                class_id: 50,
                method_id: 10,
            },
        );

        match caller.join().unwrap() {
            Err(ClientError::ChannelClosed {
                channel: 1,
                code: 404,
                text,
            }) => assert_eq!(text, "NOT_FOUND"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(broker.expect().method, Method::ChannelCloseOk);
        assert_eq!(channel.state(), ChannelState::Errored);
        assert!(conn.is_open());
    }

    #[test]
    fn broker_close_of_idle_channel_releases_its_number() {
        let (conn, channel, mut broker) = open_channel_pair();
        broker.send(1, Method::channel_close(406, "PRECONDITION_FAILED"));
        assert_eq!(broker.expect().method, Method::ChannelCloseOk);
        wait_until(|| conn.channel_count() == 0);

        let opener = {
            let conn = conn.clone();
            thread::spawn(move || conn.open_channel())
        };
        assert_eq!(broker.accept_open(), 1);
        let reopened = opener.join().unwrap().unwrap();
        assert!(reopened.is_open());
        assert_eq!(channel.state(), ChannelState::Errored);
    }

    #[test]
    fn refused_open_retires_the_number() {
        let (conn, mut broker) = connect_pair();
        let opener = {
            let conn = conn.clone();
            thread::spawn(move || conn.open_channel())
        };
        broker.expect_method(MethodId::CHANNEL_OPEN);
        broker.send(1, Method::channel_close(504, "CHANNEL_ERROR"));

        assert!(matches!(
            opener.join().unwrap(),
            Err(ClientError::ChannelClosed { code: 504, .. })
        ));
        assert_eq!(broker.expect().method, Method::ChannelCloseOk);
        assert_eq!(conn.channel_count(), 0);

        let opener = {
            let conn = conn.clone();
            thread::spawn(move || conn.open_channel())
        };
        assert_eq!(broker.accept_open(), 2);
        opener.join().unwrap().unwrap();
    }

    #[test]
    fn asynchronous_rpc_returns_none() {
        let (conn, channel, mut broker) = open_channel_pair();
        let reply = channel
            .rpc(&Method::other(MethodId::BASIC_PUBLISH, &b"\x00\x00"[..]))
            .unwrap();
        assert!(reply.is_none());
        assert!(conn.pending_channels().is_empty());
        assert_eq!(broker.expect().id(), MethodId::BASIC_PUBLISH);
    }

    #[test]
    fn open_on_open_channel_is_rejected() {
        let (_conn, channel, _broker) = open_channel_pair();
        let err = channel.rpc(&Method::ChannelOpen).unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidState {
                state: ChannelState::Open,
                operation: "open",
                ..
            }
        ));
        assert!(channel.is_open());
    }

    #[test]
    fn concurrent_calls_are_serialized() {
        let (conn, channel, mut broker) = open_channel_pair();
        let channel = Arc::new(channel);
        let callers: Vec<_> = [true, false]
            .into_iter()
            .map(|active| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || channel.rpc(&Method::ChannelFlow { active }))
            })
            .collect();

        for _ in 0..2 {
            let request = broker.expect_method(MethodId::CHANNEL_FLOW);
            assert_eq!(conn.pending_channels(), vec![1]);
            let Method::ChannelFlow { active } = request.method else {
                unreachable!()
            };
            broker.send(1, Method::ChannelFlowOk { active });
        }

        for caller in callers {
            assert!(caller.join().unwrap().unwrap().is_some());
        }
        assert!(channel.is_open());
    }

    #[test]
    fn connection_close_errors_open_channels() {
        let (conn, channel, mut broker) = open_channel_pair();
        broker.send(0, Method::connection_close(320, "CONNECTION_FORCED"));

        wait_until(|| channel.state() == ChannelState::Errored);
        assert!(!conn.is_open());
        assert!(matches!(
            channel.rpc(&Method::ChannelFlow { active: true }),
            Err(ClientError::InvalidState { .. })
        ));
    }
}
