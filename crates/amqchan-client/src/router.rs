//! Pending-call registry shared by callers and the dispatch loop.
//!
//! A caller registers a [`PendingReply`] for its channel *before* writing the
//! request. The dispatch loop then settles it exactly once: with the reply
//! frame, with an unexpected-frame error, or with a connection-closed error
//! when the connection dies. Each slot is a one-shot `sync_channel(1)`, so
//! settling never blocks the dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use amqchan_frame::{MethodFrame, MethodId};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, CloseReason, Result};

type Delivery = std::result::Result<MethodFrame, ClientError>;

/// Counters for routed frames, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Replies handed to the waiting caller.
    pub delivered: u64,
    /// Pending calls failed because the reply did not match.
    pub unexpected: u64,
    /// Frames that arrived with nobody waiting on their channel.
    pub unsolicited: u64,
    /// Pending calls withdrawn after their caller timed out.
    pub withdrawn: u64,
    /// Pending calls failed by a connection close.
    pub failed_on_close: u64,
}

/// Outcome of routing one frame.
#[derive(Debug)]
pub(crate) enum Routed {
    Delivered,
    Unexpected,
    Unsolicited(MethodFrame),
}

struct PendingCall {
    token: u64,
    expected: Vec<MethodId>,
    slot: SyncSender<Delivery>,
}

#[derive(Default)]
struct RouterInner {
    pending: HashMap<u16, PendingCall>,
    closed: Option<CloseReason>,
    stats: RouterStats,
}

/// Channel number -> pending call table for one connection.
pub struct Router {
    inner: Mutex<RouterInner>,
    next_token: AtomicU64,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// An empty, open router.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
            next_token: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for one of `expected` on `channel`.
    ///
    /// Fails with `ChannelBusy` if the channel already has a call in flight
    /// and with `ConnectionClosed` once the router has been closed.
    pub fn register(self: &Arc<Self>, channel: u16, expected: &[MethodId]) -> Result<PendingReply> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(ClientError::ConnectionClosed(reason.clone()));
        }
        if inner.pending.contains_key(&channel) {
            return Err(ClientError::ChannelBusy(channel));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = mpsc::sync_channel(1);
        inner.pending.insert(
            channel,
            PendingCall {
                token,
                expected: expected.to_vec(),
                slot,
            },
        );
        trace!(
            channel,
            token,
            pending_len = inner.pending.len(),
            "registered pending call"
        );

        Ok(PendingReply {
            router: Arc::clone(self),
            channel,
            token,
            rx,
            settled: false,
        })
    }

    /// Settle the pending call on the frame's channel, if there is one.
    pub(crate) fn route(&self, frame: MethodFrame) -> Routed {
        let mut inner = self.lock();
        let channel = frame.channel;
        let received = frame.id();

        let Some(call) = inner.pending.remove(&channel) else {
            inner.stats.unsolicited += 1;
            return Routed::Unsolicited(frame);
        };

        if call.expected.contains(&received) {
            inner.stats.delivered += 1;
            trace!(channel, method = %received, "delivered reply");
            let _ = call.slot.try_send(Ok(frame));
            Routed::Delivered
        } else {
            inner.stats.unexpected += 1;
            warn!(
                channel,
                method = %received,
                expected = ?call.expected,
                "reply does not match pending call"
            );
            let _ = call.slot.try_send(Err(ClientError::UnexpectedFrame {
                channel,
                expected: call.expected,
                received,
            }));
            Routed::Unexpected
        }
    }

    /// Fail the pending call on `channel` with `err`. Returns false if none.
    ///
    /// The slot is filled before the lock is released, so a caller whose
    /// withdrawal loses to this always finds the error waiting.
    pub(crate) fn fail(&self, channel: u16, err: ClientError) -> bool {
        let mut inner = self.lock();
        match inner.pending.remove(&channel) {
            Some(call) => {
                debug!(channel, error = %err, "failing pending call");
                let _ = call.slot.try_send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Refuse new registrations and fail every pending call.
    ///
    /// The first reason sticks; later calls only drain. Returns the number of
    /// calls that were failed.
    pub(crate) fn close(&self, reason: CloseReason) -> usize {
        let mut inner = self.lock();
        let reason = inner.closed.get_or_insert(reason).clone();
        let drained: Vec<(u16, PendingCall)> = inner.pending.drain().collect();
        inner.stats.failed_on_close += drained.len() as u64;

        for (channel, call) in &drained {
            trace!(channel, "failing pending call on connection close");
            let _ = call
                .slot
                .try_send(Err(ClientError::ConnectionClosed(reason.clone())));
        }
        drained.len()
    }

    /// Remove the registration if it still belongs to `token`.
    fn withdraw(&self, channel: u16, token: u64) -> bool {
        let mut inner = self.lock();
        match inner.pending.get(&channel) {
            Some(call) if call.token == token => {
                inner.pending.remove(&channel);
                inner.stats.withdrawn += 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn count_unsolicited(&self) {
        self.lock().stats.unsolicited += 1;
    }

    /// Channel numbers with a call in flight, sorted.
    pub fn pending_channels(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.lock().pending.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// True while `channel` has a registered call.
    pub fn is_pending(&self, channel: u16) -> bool {
        self.lock().pending.contains_key(&channel)
    }

    /// The reason given to the first [`Router::close`], if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    /// Snapshot of the routing counters.
    pub fn stats(&self) -> RouterStats {
        self.lock().stats
    }
}

/// The caller's half of a pending call.
///
/// Dropping it without waiting withdraws the registration.
pub struct PendingReply {
    router: Arc<Router>,
    channel: u16,
    token: u64,
    rx: Receiver<Delivery>,
    settled: bool,
}

impl PendingReply {
    /// Channel the reply is expected on.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Block until the call is settled or `timeout` expires.
    ///
    /// On timeout the registration is withdrawn, so a reply arriving later
    /// is routed as unsolicited. If the reply won that race it is returned
    /// instead of the timeout.
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<MethodFrame> {
        let delivery = match timeout {
            None => self.rx.recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(delivery) => Some(delivery),
                Err(RecvTimeoutError::Timeout) => {
                    if self.router.withdraw(self.channel, self.token) {
                        self.settled = true;
                        debug!(channel = self.channel, ?timeout, "pending call timed out");
                        return Err(ClientError::Timeout(timeout));
                    }
                    // Whoever removed the registration has already filled the slot.
                    self.rx.recv().ok()
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        self.settled = true;

        match delivery {
            Some(delivery) => delivery,
            None => Err(ClientError::ConnectionClosed(
                self.router
                    .close_reason()
                    .unwrap_or_else(|| CloseReason::Transport("reply slot dropped".to_string())),
            )),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.router.withdraw(self.channel, self.token);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("channel", &self.channel)
            .field("token", &self.token)
            .finish()
    }
}
