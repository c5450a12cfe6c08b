#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! TEAM_432: Synchronization utilities shared by the vnode layer.
//!
//! Re-exports the `spin` lock types and `hashbrown` collections so dependent
//! crates see a single lock API, and adds the two sleeping primitives the
//! vnode layer is built on:
//!
//! - [`WaitChannel`]: sleep/wakeup rendezvous keyed by a sequence number
//! - [`LockMgr`]: shared/exclusive/drain lock with `NOWAIT` and `SLEEPFAIL`

extern crate alloc;

pub mod lockmgr;
pub mod wait;

// TEAM_211: Re-export spin crate types as our lock API
pub use spin::{Barrier, Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// TEAM_212: Re-export hashbrown collections
pub use hashbrown::{HashMap, HashSet};

pub use lockmgr::{LockError, LockFlags, LockMgr, LockStatus};
pub use wait::WaitChannel;

/// Give up the CPU while waiting for another context to make progress.
///
/// Hosted builds yield the thread; bare builds issue a spin hint.
#[inline]
pub fn relax() {
    #[cfg(any(test, feature = "std"))]
    std::thread::yield_now();
    #[cfg(not(any(test, feature = "std")))]
    core::hint::spin_loop();
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests: [S1] exclusive access, [S3] release on drop
    #[test]
    fn test_spinlock_basic() {
        let lock = Mutex::new(42);
        {
            let mut guard = lock.lock(); // [S1] acquire
            *guard = 43;
        } // [S3] release on drop
        assert_eq!(*lock.lock(), 43);
    }

    /// Tests: HashSet dedup used for busy vnode accounting
    #[test]
    fn test_hashset_dedup() {
        let mut set = HashSet::new();
        assert!(set.insert(7u32));
        assert!(!set.insert(7u32));
        assert_eq!(set.len(), 1);
    }
}
