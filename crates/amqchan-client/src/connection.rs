//! Connection: owns the transport, the dispatch loop and the channel table.
//!
//! ```text
//!  Channel::rpc ──register──▶ Router ◀──route── dispatch thread ◀── reader
//!       │                                            │
//!       └────────write_frame──▶ writer (Mutex) ◀─────┘ (CloseOk replies)
//! ```
//!
//! Only the dispatch thread reads from the transport. Callers never poll;
//! they block on their own [`PendingReply`].

use std::io::{ErrorKind, Read, Write};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use amqchan_frame::{
    is_connection_level, Frame, FrameError, FrameKind, FrameReader, FrameWriter, Method,
    MethodFrame, MethodId, CONNECTION,
};
use amqchan_transport::Stream;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::config::ConnectionConfig;
use crate::error::{ClientError, CloseReason, Result};
use crate::router::{PendingReply, Routed, Router, RouterStats};
use crate::state::{ChannelState, ConnectionState};
use crate::table::ChannelTable;

/// A frame nobody was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    /// A broker-initiated method, or a reply that arrived after its caller
    /// gave up.
    Method(MethodFrame),
    /// A content header or body frame.
    Content(Frame),
}

type UnsolicitedHandler = Box<dyn FnMut(Unsolicited) + Send>;
type BoxedWriter = FrameWriter<Box<dyn Write + Send>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: ConnectionConfig,
    writer: Mutex<BoxedWriter>,
    router: Arc<Router>,
    channels: Mutex<ChannelTable>,
    state: Mutex<ConnectionState>,
    unsolicited: Mutex<Option<UnsolicitedHandler>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    /// Present when built from a `Stream`; shut down once the connection ends.
    transport: Option<Stream>,
}

/// A multiplexed connection. Cloning yields another handle to the same
/// connection.
///
/// Dropping the last handle (channels hold one each) ends the connection
/// without a close handshake: pending calls fail and a `Stream` transport is
/// shut down. A reader passed to [`Connection::start`] is not ours to shut
/// down, so the dispatch thread lingers until that reader fails or hits EOF.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    _owner: Arc<Owner>,
}

/// Shared by user handles only; the dispatch thread holds `Inner` directly.
struct Owner(Arc<Inner>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.finish(
            CloseReason::Local {
                code: 200,
                text: "connection dropped".to_string(),
            },
            ChannelState::Closed,
        );
    }
}

impl Connection {
    /// Start a connection over an already-negotiated transport stream.
    pub fn from_stream(stream: Stream, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let frame_config = config.frame_config();

        let reader_stream = stream.try_clone()?;
        let shutdown_handle = stream.try_clone()?;
        stream.set_write_timeout(config.write_timeout)?;

        let reader = FrameReader::with_config_stream(reader_stream, frame_config.clone())?;
        let writer: BoxedWriter = FrameWriter::with_config(Box::new(stream), frame_config);
        debug!(peer = %shutdown_handle.peer_label(), "starting connection");

        Self::spawn(reader, writer, Some(shutdown_handle), config)
    }

    /// Start a connection over any reader/writer pair.
    ///
    /// The dispatch loop runs until the reader reports EOF or an error, or
    /// the broker closes the connection.
    pub fn start<R, W>(reader: R, writer: W, config: ConnectionConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        config.validate()?;
        let frame_config = config.frame_config();
        let reader = FrameReader::with_config(reader, frame_config.clone());
        let writer: BoxedWriter = FrameWriter::with_config(Box::new(writer), frame_config);
        Self::spawn(reader, writer, None, config)
    }

    fn spawn<R>(
        reader: FrameReader<R>,
        writer: BoxedWriter,
        transport: Option<Stream>,
        config: ConnectionConfig,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let inner = Arc::new(Inner {
            channels: Mutex::new(ChannelTable::new(config.channel_max)),
            config,
            writer: Mutex::new(writer),
            router: Arc::new(Router::new()),
            state: Mutex::new(ConnectionState::Open),
            unsolicited: Mutex::new(None),
            dispatch: Mutex::new(None),
            transport,
        });

        let loop_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("amqchan-dispatch".to_string())
            .spawn(move || run_dispatch(loop_inner, reader))
            .map_err(amqchan_transport::TransportError::Io)?;
        *lock(&inner.dispatch) = Some(handle);

        Ok(Self {
            _owner: Arc::new(Owner(Arc::clone(&inner))),
            inner,
        })
    }

    /// Encode `method` and write it on `channel`.
    ///
    /// A write failure is fatal to the connection: every pending call is
    /// failed and the connection moves to `Closed`.
    pub fn write_frame(&self, method: &Method, channel: u16) -> Result<()> {
        self.inner.ensure_writable(channel)?;
        self.inner.write_raw(method, channel)
    }

    /// Register interest in one of `expected` on `channel`.
    ///
    /// Register before writing the request that triggers the reply, then
    /// [`PendingReply::wait`].
    pub fn expect_frame(&self, expected: &[MethodId], channel: u16) -> Result<PendingReply> {
        self.inner.router.register(channel, expected)
    }

    /// Block until one of `expected` arrives on `channel`.
    ///
    /// `timeout` of `None` waits until the frame arrives or the connection
    /// closes.
    pub fn wait_on_frame(
        &self,
        expected: &[MethodId],
        channel: u16,
        timeout: Option<Duration>,
    ) -> Result<MethodFrame> {
        self.expect_frame(expected, channel)?.wait(timeout)
    }

    /// Send a synchronous method and wait for its reply.
    pub(crate) fn call(
        &self,
        channel: u16,
        method: &Method,
        timeout: Option<Duration>,
    ) -> Result<MethodFrame> {
        let pending = self.expect_frame(method.valid_responses(), channel)?;
        self.write_frame(method, channel)?;
        pending.wait(timeout)
    }

    /// Allocate a channel number and open a channel on it.
    ///
    /// The channel is returned only once the broker's `Channel.OpenOk` has
    /// been received. On failure the number is retired.
    pub fn open_channel(&self) -> Result<Channel> {
        let shared = lock(&self.inner.channels).allocate()?;
        let number = shared.number();

        match Channel::open(self.clone(), shared) {
            Ok(channel) => Ok(channel),
            Err(err) => {
                lock(&self.inner.channels).retire(number);
                Err(err)
            }
        }
    }

    /// Close the connection with `200 Normal Shutdown`.
    ///
    /// Waits up to `close_timeout` for `Connection.CloseOk`, then fails every
    /// outstanding wait. Returns `Ok` if already closed.
    pub fn close(&self) -> Result<()> {
        let reason = CloseReason::Local {
            code: 200,
            text: "Normal Shutdown".to_string(),
        };
        {
            let mut state = lock(&self.inner.state);
            if !state.is_open() {
                return Ok(());
            }
            *state = ConnectionState::Closing(reason.clone());
        }
        debug!("closing connection");

        let result = self.call(
            CONNECTION,
            &Method::connection_close(200, "Normal Shutdown"),
            Some(self.inner.config.close_timeout),
        );
        self.inner.finish(reason, ChannelState::Closed);

        match result {
            Ok(_) | Err(ClientError::ConnectionClosed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Install the handler for frames nobody is waiting for.
    ///
    /// The handler runs on the dispatch thread. It must not block on a
    /// synchronous call of this connection, since only the dispatch thread
    /// can complete it. It may replace itself. A handler that panics closes
    /// the connection. A handler that captures a `Connection` keeps the
    /// connection alive until it is closed explicitly.
    pub fn set_unsolicited_handler<F>(&self, handler: F)
    where
        F: FnMut(Unsolicited) + Send + 'static,
    {
        *lock(&self.inner.unsolicited) = Some(Box::new(handler));
    }

    /// Current lifecycle state, with the close reason once closing.
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }

    /// True until a close starts or the connection fails.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// The configuration the connection was started with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Number of channels that are allocated and not yet closed or retired.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Channel numbers with a synchronous call in flight, sorted.
    pub fn pending_channels(&self) -> Vec<u16> {
        self.inner.router.pending_channels()
    }

    /// Routing counters for this connection.
    pub fn stats(&self) -> RouterStats {
        self.inner.router.stats()
    }

    /// Wait for the dispatch thread to exit.
    ///
    /// Only useful after the connection has closed or the peer has gone away.
    pub fn join(&self) {
        let handle = lock(&self.inner.dispatch).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
    }

    pub(crate) fn release_channel(&self, number: u16) {
        lock(&self.inner.channels).release(number);
    }

    pub(crate) fn retire_channel(&self, number: u16) {
        lock(&self.inner.channels).retire(number);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("channels", &self.channel_count())
            .field("pending", &self.pending_channels())
            .finish()
    }
}

impl Inner {
    /// Reject writes once closed; while closing only channel 0 may write.
    fn ensure_writable(&self, channel: u16) -> Result<()> {
        match &*lock(&self.state) {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing(_) if is_connection_level(channel) => Ok(()),
            ConnectionState::Closing(reason) | ConnectionState::Closed(reason) => {
                Err(ClientError::ConnectionClosed(reason.clone()))
            }
        }
    }

    fn write_raw(&self, method: &Method, channel: u16) -> Result<()> {
        let result = lock(&self.writer).send_method(channel, method);
        match result {
            Ok(()) => {
                trace!(channel, method = %method.id(), "frame written");
                Ok(())
            }
            Err(err @ (FrameError::Malformed(_) | FrameError::PayloadTooLarge { .. })) => {
                Err(ClientError::Encode(err))
            }
            Err(err) => {
                warn!(channel, error = %err, "write failed, closing connection");
                self.finish(
                    CloseReason::Transport(err.to_string()),
                    ChannelState::Errored,
                );
                Err(ClientError::Frame(err))
            }
        }
    }

    /// Move to `Closed`, fail every pending call and settle live channels.
    ///
    /// Idempotent: the first reason wins.
    fn finish(&self, reason: CloseReason, channel_state: ChannelState) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnectionState::Closed(_)) {
                return;
            }
            *state = ConnectionState::Closed(reason.clone());
        }

        let failed = self.router.close(reason.clone());
        for shared in lock(&self.channels).live() {
            shared.finish(channel_state);
        }
        if let Some(transport) = &self.transport {
            let _ = transport.shutdown();
        }
        debug!(%reason, failed, "connection finished");
    }

    /// Run the handler outside its lock. A replacement installed meanwhile
    /// wins; a panic is fatal to the connection.
    fn deliver_unsolicited(&self, frame: Unsolicited) -> ControlFlow<()> {
        let taken = lock(&self.unsolicited).take();
        let Some(mut handler) = taken else {
            debug!(?frame, "discarding unsolicited frame");
            return ControlFlow::Continue(());
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
            warn!("unsolicited handler panicked, closing connection");
            self.finish(
                CloseReason::Transport("unsolicited handler panicked".to_string()),
                ChannelState::Errored,
            );
            return ControlFlow::Break(());
        }

        let mut slot = lock(&self.unsolicited);
        if slot.is_none() {
            *slot = Some(handler);
            return ControlFlow::Continue(());
        }
        drop(slot);
        // Superseded; dropped outside the lock since it may own a handle.
        drop(handler);
        ControlFlow::Continue(())
    }

    fn handle_frame(&self, frame: Frame) -> ControlFlow<()> {
        match frame.kind {
            FrameKind::Heartbeat => {
                trace!("heartbeat");
                ControlFlow::Continue(())
            }
            FrameKind::Header | FrameKind::Body => {
                self.router.count_unsolicited();
                self.deliver_unsolicited(Unsolicited::Content(frame))
            }
            FrameKind::Method => {
                let channel = frame.channel;
                match MethodFrame::try_from(frame) {
                    Ok(frame) if is_connection_level(channel) => {
                        self.handle_connection_method(frame)
                    }
                    Ok(frame) => self.handle_channel_method(frame),
                    Err(err) if is_connection_level(channel) => {
                        warn!(error = %err, "malformed connection-level frame");
                        self.finish(
                            CloseReason::Protocol(err.to_string()),
                            ChannelState::Errored,
                        );
                        ControlFlow::Break(())
                    }
                    Err(err) => {
                        warn!(channel, error = %err, "malformed method frame");
                        if !self.router.fail(channel, ClientError::Frame(err)) {
                            self.router.count_unsolicited();
                        }
                        ControlFlow::Continue(())
                    }
                }
            }
        }
    }

    fn handle_connection_method(&self, frame: MethodFrame) -> ControlFlow<()> {
        match &frame.method {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            } => {
                warn!(code = reply_code, text = %reply_text, "broker closed connection");
                let reason = CloseReason::Broker {
                    code: *reply_code,
                    text: reply_text.clone(),
                };
                // Best effort: the connection is going away either way.
                let ack = lock(&self.writer).send_method(CONNECTION, &Method::ConnectionCloseOk);
                if let Err(err) = ack {
                    debug!(error = %err, "could not acknowledge connection close");
                }
                self.finish(reason, ChannelState::Errored);
                ControlFlow::Break(())
            }
            Method::ConnectionCloseOk => {
                let reason = match &*lock(&self.state) {
                    ConnectionState::Closing(reason) => reason.clone(),
                    _ => CloseReason::Protocol("unrequested connection.close-ok".to_string()),
                };
                let _ = self.router.route(frame);
                self.finish(reason, ChannelState::Closed);
                ControlFlow::Break(())
            }
            _ => {
                match self.router.route(frame) {
                    Routed::Unsolicited(frame) => {
                        self.deliver_unsolicited(Unsolicited::Method(frame))
                    }
                    Routed::Delivered | Routed::Unexpected => ControlFlow::Continue(()),
                }
            }
        }
    }

    fn handle_channel_method(&self, frame: MethodFrame) -> ControlFlow<()> {
        let channel = frame.channel;

        if let Method::ChannelClose {
            reply_code,
            reply_text,
            ..
        } = &frame.method
        {
            warn!(channel, code = reply_code, text = %reply_text, "broker closed channel");
            let had_pending = self.router.fail(
                channel,
                ClientError::ChannelClosed {
                    channel,
                    code: *reply_code,
                    text: reply_text.clone(),
                },
            );
            let shared = lock(&self.channels).get(channel);
            if let Some(shared) = &shared {
                shared.mark_errored();
            }

            if self.write_raw(&Method::ChannelCloseOk, channel).is_err() {
                return ControlFlow::Break(());
            }

            // A call that was cut off may still draw a late reply; keep its
            // number out of circulation.
            let mut table = lock(&self.channels);
            if had_pending {
                table.retire(channel);
            } else {
                table.release(channel);
            }
            return ControlFlow::Continue(());
        }

        match self.router.route(frame) {
            Routed::Delivered | Routed::Unexpected => ControlFlow::Continue(()),
            Routed::Unsolicited(frame) => {
                debug!(channel, method = %frame.id(), "no pending call for frame");
                self.deliver_unsolicited(Unsolicited::Method(frame))
            }
        }
    }
}

/// Finishes the connection however the dispatch loop exits, unwinding included.
struct DispatchExit<'a>(&'a Inner);

impl Drop for DispatchExit<'_> {
    fn drop(&mut self) {
        self.0.finish(
            CloseReason::Transport("dispatch loop stopped".to_string()),
            ChannelState::Errored,
        );
        debug!("dispatch loop stopped");
    }
}

fn run_dispatch<R: Read>(inner: Arc<Inner>, mut reader: FrameReader<R>) {
    debug!("dispatch loop started");
    let _exit = DispatchExit(&*inner);
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                inner.finish(
                    CloseReason::Transport("connection closed by peer".to_string()),
                    ChannelState::Errored,
                );
                break;
            }
            Err(
                err @ (FrameError::UnknownFrameType(_)
                | FrameError::InvalidFrameEnd(_)
                | FrameError::PayloadTooLarge { .. }
                | FrameError::ProtocolRejected { .. }),
            ) => {
                warn!(error = %err, "undecodable frame from broker");
                inner.finish(CloseReason::Protocol(err.to_string()), ChannelState::Errored);
                break;
            }
            Err(err) => {
                warn!(error = %err, "dispatch read failed");
                inner.finish(CloseReason::Transport(err.to_string()), ChannelState::Errored);
                break;
            }
        };

        if inner.handle_frame(frame).is_break() {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::testing::{connect_pair, connect_pair_with};

    #[test]
    fn write_frame_reaches_the_wire() {
        let (conn, mut broker) = connect_pair();
        conn.write_frame(&Method::ChannelFlow { active: false }, 3)
            .unwrap();

        let frame = broker.expect();
        assert_eq!(frame, MethodFrame::new(3, Method::ChannelFlow { active: false }));
    }

    #[test]
    fn wait_on_frame_receives_matching_frame() {
        let (conn, mut broker) = connect_pair();
        let waiter = {
            let conn = conn.clone();
            thread::spawn(move || {
                conn.wait_on_frame(&[MethodId::CHANNEL_FLOW], 5, Some(Duration::from_secs(5)))
            })
        };

        while conn.pending_channels() != vec![5] {
            thread::yield_now();
        }
        broker.send(5, Method::ChannelFlow { active: true });

        let frame = waiter.join().unwrap().unwrap();
        assert_eq!(frame.method, Method::ChannelFlow { active: true });
    }

    #[test]
    fn wait_on_frame_times_out_after_bound() {
        let (conn, _broker) = connect_pair();
        let started = Instant::now();
        let err = conn
            .wait_on_frame(&[MethodId::CHANNEL_OPEN_OK], 1, Some(Duration::from_secs(1)))
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(conn.pending_channels().is_empty());
        assert_eq!(conn.stats().withdrawn, 1);
    }

    #[test]
    fn broker_connection_close_fails_all_waiters() {
        let (conn, mut broker) = connect_pair();
        let waiters: Vec<_> = [1u16, 2, 3]
            .into_iter()
            .map(|channel| {
                let pending = conn
                    .expect_frame(&[MethodId::CHANNEL_OPEN_OK], channel)
                    .unwrap();
                thread::spawn(move || pending.wait(None))
            })
            .collect();

        broker.send(CONNECTION, Method::connection_close(320, "CONNECTION_FORCED"));

        let started = Instant::now();
        for waiter in waiters {
            match waiter.join().unwrap() {
                Err(ClientError::ConnectionClosed(CloseReason::Broker { code, .. })) => {
                    assert_eq!(code, 320)
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(broker.expect().method, Method::ConnectionCloseOk);
        assert!(matches!(
            conn.state(),
            ConnectionState::Closed(CloseReason::Broker { code: 320, .. })
        ));
        assert!(matches!(
            conn.write_frame(&Method::ChannelOpen, 1),
            Err(ClientError::ConnectionClosed(_))
        ));
        assert_eq!(conn.stats().failed_on_close, 3);
    }

    #[test]
    fn peer_disconnect_fails_waiters_with_transport_reason() {
        let (conn, broker) = connect_pair();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 1)
            .unwrap();

        drop(broker);

        match pending.wait(Some(Duration::from_secs(5))) {
            Err(ClientError::ConnectionClosed(CloseReason::Transport(_))) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        conn.join();
        assert!(!conn.is_open());
    }

    #[test]
    fn unsolicited_frames_reach_the_handler() {
        let (conn, mut broker) = connect_pair();
        let (tx, rx) = mpsc::channel();
        conn.set_unsolicited_handler(move |frame| {
            let _ = tx.send(frame);
        });

        broker.send(7, Method::other(MethodId::BASIC_DELIVER, &b"\x00"[..]));
        broker.send_raw(Frame::new(FrameKind::Body, 7, &b"payload"[..]));

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Unsolicited::Method(frame) => {
                assert_eq!(frame.channel, 7);
                assert_eq!(frame.id(), MethodId::BASIC_DELIVER);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Unsolicited::Content(frame) => assert_eq!(frame.payload.as_ref(), b"payload"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(conn.stats().unsolicited, 2);
    }

    #[test]
    fn panicking_handler_closes_the_connection() {
        let (conn, mut broker) = connect_pair();
        conn.set_unsolicited_handler(|_| panic!("handler failure"));
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 1)
            .unwrap();

        broker.send_raw(Frame::new(FrameKind::Body, 7, &b"payload"[..]));

        let started = Instant::now();
        assert!(matches!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(ClientError::ConnectionClosed(CloseReason::Transport(_)))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        conn.join();
        assert!(!conn.is_open());
        broker.expect_eof();
    }

    #[test]
    fn handler_can_replace_itself() {
        let (conn, mut broker) = connect_pair();
        let (tx, rx) = mpsc::channel();
        let handle = conn.clone();
        conn.set_unsolicited_handler(move |_| {
            let _ = tx.send("first");
            let tx = tx.clone();
            handle.set_unsolicited_handler(move |_| {
                let _ = tx.send("second");
            });
        });

        broker.send_raw(Frame::new(FrameKind::Body, 7, &b"one"[..]));
        broker.send_raw(Frame::new(FrameKind::Body, 7, &b"two"[..]));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        assert!(conn.is_open());
    }

    #[test]
    fn dropping_the_last_handle_ends_the_connection() {
        let (conn, mut broker) = connect_pair();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 1)
            .unwrap();
        let spare = conn.clone();

        drop(conn);
        assert!(spare.is_open());
        drop(spare);

        assert!(matches!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(ClientError::ConnectionClosed(CloseReason::Local { .. }))
        ));
        broker.expect_eof();
    }

    #[test]
    fn heartbeats_are_ignored() {
        let (conn, mut broker) = connect_pair();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_FLOW_OK], 1)
            .unwrap();

        broker.send_raw(Frame::heartbeat());
        broker.send(1, Method::ChannelFlowOk { active: true });

        assert!(pending.wait(Some(Duration::from_secs(5))).is_ok());
        assert_eq!(conn.stats().unsolicited, 0);
    }

    #[test]
    fn protocol_refusal_closes_the_connection() {
        let (conn, mut broker) = connect_pair();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 1)
            .unwrap();

        broker.send_bytes(b"AMQP\x00\x00\x09\x01");

        assert!(matches!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(ClientError::ConnectionClosed(CloseReason::Protocol(_)))
        ));
        conn.join();
        assert!(matches!(
            conn.state(),
            ConnectionState::Closed(CloseReason::Protocol(_))
        ));
    }

    #[test]
    fn malformed_channel_frame_fails_only_that_call() {
        let (conn, mut broker) = connect_pair();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 1)
            .unwrap();

        // channel.close with a truncated argument list
        broker.send_raw(Frame::new(FrameKind::Method, 1, &[0u8, 20, 0, 40, 0][..]));

        assert!(matches!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(ClientError::Frame(FrameError::Malformed(_)))
        ));
        assert!(conn.is_open());
    }

    #[test]
    fn local_close_handshake() {
        let (conn, mut broker) = connect_pair();
        let closer = {
            let conn = conn.clone();
            thread::spawn(move || conn.close())
        };

        let request = broker.expect();
        assert_eq!(request.channel, CONNECTION);
        assert!(matches!(
            request.method,
            Method::ConnectionClose {
                reply_code: 200,
                ..
            }
        ));
        broker.send(CONNECTION, Method::ConnectionCloseOk);

        closer.join().unwrap().unwrap();
        assert!(matches!(
            conn.state(),
            ConnectionState::Closed(CloseReason::Local { code: 200, .. })
        ));
        assert!(conn.close().is_ok());
    }

    #[test]
    fn local_close_gives_up_after_close_timeout() {
        let (conn, mut broker) = connect_pair_with(ConnectionConfig {
            close_timeout: Duration::from_millis(100),
            ..ConnectionConfig::default()
        });

        let err = conn.close().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(broker.expect().id(), MethodId::CONNECTION_CLOSE);
        assert!(!conn.is_open());
    }

    #[test]
    fn closing_connection_rejects_channel_writes() {
        let (conn, _broker) = connect_pair_with(ConnectionConfig {
            close_timeout: Duration::from_millis(500),
            ..ConnectionConfig::default()
        });
        let closer = {
            let conn = conn.clone();
            thread::spawn(move || conn.close())
        };

        while conn.is_open() {
            thread::yield_now();
        }
        assert!(matches!(
            conn.write_frame(&Method::ChannelOpen, 1),
            Err(ClientError::ConnectionClosed(CloseReason::Local { .. }))
        ));
        let _ = closer.join().unwrap();
    }

    #[test]
    fn write_failure_is_fatal() {
        let (reader, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let conn = Connection::start(reader, BrokenWriter, ConnectionConfig::default()).unwrap();
        let pending = conn
            .expect_frame(&[MethodId::CHANNEL_OPEN_OK], 2)
            .unwrap();

        let err = conn.write_frame(&Method::ChannelOpen, 1).unwrap_err();
        assert!(err.is_connection_error());
        assert!(matches!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(ClientError::ConnectionClosed(CloseReason::Transport(_)))
        ));
    }

    #[test]
    fn encode_failure_is_not_fatal() {
        let (conn, _broker) = connect_pair();
        let err = conn
            .write_frame(&Method::channel_close(200, "x".repeat(300)), 1)
            .unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
        assert!(err.is_usage_error());
        assert!(conn.is_open());
    }

    #[test]
    fn rejects_invalid_config() {
        let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let result = Connection::start(
            reader,
            writer,
            ConnectionConfig {
                channel_max: 0,
                ..ConnectionConfig::default()
            },
        );
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
