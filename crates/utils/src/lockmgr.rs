//! TEAM_433: Sleeping shared/exclusive lock.
//!
//! Backs both the per-vnode lock and the per-mount busy gate. The lock has no
//! owner: any context may release a hold, matching how a vnode lock taken by
//! one path is dropped by `inactive` on another.
//!
//! Exclusive requests that have started waiting hold off new shared
//! requests, so a pending drain or unmount is not starved by a stream of
//! readers.

use bitflags::bitflags;
use vn_error::define_kernel_error;

use crate::{Mutex, WaitChannel};

bitflags! {
    /// Lock request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        /// Shared hold
        const SHARED = 1 << 0;
        /// Exclusive hold
        const EXCLUSIVE = 1 << 1;
        /// Exclusive hold taken to tear the object down
        const DRAIN = 1 << 2;
        /// Fail with `Busy` instead of sleeping
        const NOWAIT = 1 << 3;
        /// Fail with `SleepFail` after any sleep
        const SLEEPFAIL = 1 << 4;
    }
}

define_kernel_error! {
    /// Lock manager errors.
    pub enum LockError(0x24) {
        /// Request would block and NOWAIT was given
        Busy = 0x01 => "Lock is held" [16],
        /// Request slept and SLEEPFAIL was given
        SleepFail = 0x02 => "Slept while acquiring lock" [77],
        /// Release without a hold
        NotHeld = 0x03 => "Lock is not held" [1],
        /// Neither SHARED, EXCLUSIVE nor DRAIN requested
        Invalid = 0x04 => "Invalid lock request" [22],
    }
}

/// Snapshot of a lock's holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Shared(u32),
    Exclusive,
}

#[derive(Default)]
struct LockState {
    shared: u32,
    exclusive: bool,
    exclusive_waiters: u32,
}

pub struct LockMgr {
    name: &'static str,
    state: Mutex<LockState>,
    chan: WaitChannel,
}

impl LockMgr {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LockState {
                shared: 0,
                exclusive: false,
                exclusive_waiters: 0,
            }),
            chan: WaitChannel::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// [K1] Acquire the lock in the mode named by `flags`.
    pub fn lock(&self, flags: LockFlags) -> Result<(), LockError> {
        let exclusive = flags.intersects(LockFlags::EXCLUSIVE | LockFlags::DRAIN);
        if !exclusive && !flags.contains(LockFlags::SHARED) {
            return Err(LockError::Invalid);
        }

        let mut queued = false;
        loop {
            let ticket;
            {
                let mut st = self.state.lock();
                let free = if exclusive {
                    !st.exclusive && st.shared == 0
                } else {
                    !st.exclusive && st.exclusive_waiters == 0
                };

                if free {
                    if exclusive {
                        st.exclusive = true;
                        if queued {
                            st.exclusive_waiters -= 1;
                        }
                    } else {
                        st.shared += 1;
                    }
                    return Ok(());
                }

                // [K2] NOWAIT never sleeps
                if flags.contains(LockFlags::NOWAIT) {
                    return Err(LockError::Busy);
                }
                if exclusive && !queued {
                    st.exclusive_waiters += 1;
                    queued = true;
                }
                ticket = self.chan.ticket();
            }

            self.chan.wait(ticket);

            // [K3] SLEEPFAIL gives up once it has slept
            if flags.contains(LockFlags::SLEEPFAIL) {
                if queued {
                    self.state.lock().exclusive_waiters -= 1;
                    self.chan.wakeup();
                }
                return Err(LockError::SleepFail);
            }
        }
    }

    /// [K4] Release one hold, exclusive first.
    pub fn unlock(&self) -> Result<(), LockError> {
        {
            let mut st = self.state.lock();
            if st.exclusive {
                st.exclusive = false;
            } else if st.shared > 0 {
                st.shared -= 1;
            } else {
                return Err(LockError::NotHeld);
            }
        }
        self.chan.wakeup();
        Ok(())
    }

    pub fn status(&self) -> LockStatus {
        let st = self.state.lock();
        if st.exclusive {
            LockStatus::Exclusive
        } else if st.shared > 0 {
            LockStatus::Shared(st.shared)
        } else {
            LockStatus::Unlocked
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status() != LockStatus::Unlocked
    }

    pub fn has_exclusive_waiters(&self) -> bool {
        self.state.lock().exclusive_waiters > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Tests: [K1] shared holds stack, exclusive excludes them
    #[test]
    fn test_shared_then_exclusive() {
        let lk = LockMgr::new("test");
        lk.lock(LockFlags::SHARED).unwrap();
        lk.lock(LockFlags::SHARED).unwrap();
        assert_eq!(lk.status(), LockStatus::Shared(2));

        // [K2] would block
        assert_eq!(
            lk.lock(LockFlags::EXCLUSIVE | LockFlags::NOWAIT),
            Err(LockError::Busy)
        );

        lk.unlock().unwrap();
        lk.unlock().unwrap();
        lk.lock(LockFlags::EXCLUSIVE | LockFlags::NOWAIT).unwrap();
        assert_eq!(lk.status(), LockStatus::Exclusive);
        assert_eq!(
            lk.lock(LockFlags::SHARED | LockFlags::NOWAIT),
            Err(LockError::Busy)
        );
        lk.unlock().unwrap();
        assert_eq!(lk.unlock(), Err(LockError::NotHeld)); // [K4]
    }

    #[test]
    fn test_invalid_request() {
        let lk = LockMgr::new("test");
        assert_eq!(lk.lock(LockFlags::NOWAIT), Err(LockError::Invalid));
    }

    /// Tests: [K3] a sleeper with SLEEPFAIL fails after the holder leaves
    #[test]
    fn test_sleepfail_after_wait() {
        let lk = Arc::new(LockMgr::new("gate"));
        lk.lock(LockFlags::EXCLUSIVE).unwrap();

        let l = lk.clone();
        let h = thread::spawn(move || l.lock(LockFlags::EXCLUSIVE | LockFlags::SLEEPFAIL));

        while !lk.has_exclusive_waiters() {
            thread::yield_now();
        }
        lk.unlock().unwrap();
        assert_eq!(h.join().unwrap(), Err(LockError::SleepFail));
        assert_eq!(lk.status(), LockStatus::Unlocked);
    }

    /// Tests: [K1] blocking exclusive request waits out readers
    #[test]
    fn test_drain_waits_for_readers() {
        let lk = Arc::new(LockMgr::new("vnode"));
        lk.lock(LockFlags::SHARED).unwrap();

        let l = lk.clone();
        let h = thread::spawn(move || {
            l.lock(LockFlags::DRAIN).unwrap();
            l.status()
        });

        while !lk.has_exclusive_waiters() {
            thread::yield_now();
        }
        // Pending drain holds off new readers
        assert_eq!(
            lk.lock(LockFlags::SHARED | LockFlags::NOWAIT),
            Err(LockError::Busy)
        );
        lk.unlock().unwrap();
        assert_eq!(h.join().unwrap(), LockStatus::Exclusive);
    }
}
