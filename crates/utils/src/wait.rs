//! TEAM_432: Wait channels.
//!
//! A channel is a counter bumped on every wakeup. A sleeper samples the
//! counter with [`WaitChannel::ticket`] while it still holds the lock that
//! protects the condition it waits for, drops that lock, then calls
//! [`WaitChannel::wait`]. Any wakeup issued after the ticket was taken ends
//! the wait, so no wakeup is lost between the check and the sleep.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::relax;

pub struct WaitChannel {
    seq: AtomicU64,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Sample the channel. Take this while holding the condition's lock.
    pub fn ticket(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Sleep until a wakeup newer than `ticket` has been issued.
    pub fn wait(&self, ticket: u64) {
        while self.seq.load(Ordering::Acquire) == ticket {
            relax();
        }
    }

    /// Wake every sleeper on the channel.
    pub fn wakeup(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
