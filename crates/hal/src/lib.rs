#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! TEAM_434: Critical sections for the vnode layer.
//!
//! Every piece of shared vnode state sits behind one [`IrqSafeLock`]. Holding
//! it masks (emulated) interrupts, so buffer completion cannot run against a
//! half-updated vnode while the lock is held.
//!
//! Sleeping is only legal with the section dropped. [`IrqSafeLockGuard::sleep_on`]
//! samples a [`WaitChannel`] ticket under the lock, lets go, waits, and takes
//! the lock back, so a wakeup issued under the lock is never lost.

pub mod interrupts;

use core::mem::ManuallyDrop;
use vn_utils::{Mutex, MutexGuard, WaitChannel};

/// Spinlock that keeps interrupts masked for as long as it is held.
/// Behaviors: [L1]-[L4] interrupt-safe locking, [L5] sleep with the lock dropped
pub struct IrqSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    /// [L1] Masks before acquiring, [L4] data reachable through the guard
    pub fn lock(&self) -> IrqSafeLockGuard<'_, T> {
        let state = interrupts::disable();
        IrqSafeLockGuard {
            lock: self,
            guard: ManuallyDrop::new(self.inner.lock()),
            state,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct IrqSafeLockGuard<'a, T> {
    lock: &'a IrqSafeLock<T>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    state: u64,
}

impl<'a, T> IrqSafeLockGuard<'a, T> {
    /// [L5] Release the section, sleep on `chan` until its next wakeup, and
    /// reacquire.
    ///
    /// State read before the call is stale afterwards; callers re-check.
    pub fn sleep_on(self, chan: &WaitChannel) -> Self {
        let ticket = chan.ticket();
        let lock = self.lock;
        drop(self);
        chan.wait(ticket);
        lock.lock()
    }
}

impl<T> core::ops::Deref for IrqSafeLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for IrqSafeLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSafeLockGuard<'_, T> {
    /// [L2] Unmasks only after the spinlock is free
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::restore(self.state);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
