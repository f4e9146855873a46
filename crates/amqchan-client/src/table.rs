use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use amqchan_frame::FIRST_CHANNEL;

use crate::error::{ClientError, Result};
use crate::state::ChannelState;

/// State shared between a `Channel` handle and the connection's table.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    number: u16,
    state: Mutex<ChannelState>,
    /// Held for the whole of a synchronous exchange; serializes callers.
    call: Mutex<()>,
}

impl ChannelShared {
    fn new(number: u16) -> Self {
        Self {
            number,
            state: Mutex::new(ChannelState::Opening),
            call: Mutex::new(()),
        }
    }

    pub(crate) fn number(&self) -> u16 {
        self.number
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_call(&self) -> MutexGuard<'_, ()> {
        self.call.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `from -> to`, or report the current state as a usage error.
    pub(crate) fn transition(
        &self,
        from: ChannelState,
        to: ChannelState,
        operation: &'static str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ClientError::InvalidState {
                channel: self.number,
                state: *state,
                operation,
            });
        }
        *state = to;
        Ok(())
    }

    /// Enter `Errored` unless already `Closed`.
    pub(crate) fn mark_errored(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ChannelState::Closed {
            *state = ChannelState::Errored;
        }
    }

    /// Enter `to` unless already terminal.
    pub(crate) fn finish(&self, to: ChannelState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            *state = to;
        }
    }
}

/// Channel-number allocator plus the live channel set.
///
/// Released numbers are reused lowest first. Retired numbers are never
/// handed out again on this connection.
#[derive(Debug)]
pub(crate) struct ChannelTable {
    channel_max: u16,
    next: u32,
    free: BTreeSet<u16>,
    live: HashMap<u16, Arc<ChannelShared>>,
}

impl ChannelTable {
    pub(crate) fn new(channel_max: u16) -> Self {
        Self {
            channel_max,
            next: u32::from(FIRST_CHANNEL),
            free: BTreeSet::new(),
            live: HashMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<Arc<ChannelShared>> {
        let number = match self.free.pop_first() {
            Some(number) => number,
            None if self.next <= u32::from(self.channel_max) => {
                let number = self.next as u16;
                self.next += 1;
                number
            }
            None => return Err(ClientError::ChannelsExhausted(self.channel_max)),
        };

        let shared = Arc::new(ChannelShared::new(number));
        self.live.insert(number, Arc::clone(&shared));
        Ok(shared)
    }

    /// Return a live number to the free pool.
    pub(crate) fn release(&mut self, number: u16) -> bool {
        if self.live.remove(&number).is_some() {
            self.free.insert(number);
            true
        } else {
            false
        }
    }

    /// Drop a live number without making it reusable.
    pub(crate) fn retire(&mut self, number: u16) {
        self.live.remove(&number);
    }

    pub(crate) fn get(&self, number: u16) -> Option<Arc<ChannelShared>> {
        self.live.get(&number).cloned()
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = &Arc<ChannelShared>> {
        self.live.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}
