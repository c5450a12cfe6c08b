//! TEAM_434: Emulated interrupt mask.
//!
//! The vnode layer runs hosted, so "disabling interrupts" is modelled as a
//! nesting depth: zero means interrupts are enabled. Hosted builds keep the
//! depth per thread, standing in for per-CPU state. Bare builds keep a single
//! global depth, which is exact on a uniprocessor.

#[cfg(any(test, feature = "std"))]
mod depth {
    use core::cell::Cell;

    std::thread_local! {
        static DEPTH: Cell<u64> = const { Cell::new(0) };
    }

    pub fn enter() -> u64 {
        DEPTH.with(|d| {
            let prev = d.get();
            d.set(prev + 1);
            prev
        })
    }

    pub fn leave() {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }

    pub fn current() -> u64 {
        DEPTH.with(Cell::get)
    }
}

#[cfg(not(any(test, feature = "std")))]
mod depth {
    use core::sync::atomic::{AtomicU64, Ordering};

    static DEPTH: AtomicU64 = AtomicU64::new(0);

    pub fn enter() -> u64 {
        DEPTH.fetch_add(1, Ordering::AcqRel)
    }

    pub fn leave() {
        let _ = DEPTH.fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
            Some(d.saturating_sub(1))
        });
    }

    pub fn current() -> u64 {
        DEPTH.load(Ordering::Acquire)
    }
}

/// [I1] Disables interrupts, [I2] returns previous nesting depth
#[inline]
pub fn disable() -> u64 {
    depth::enter()
}

/// [I3] Undoes one `disable`
#[inline]
pub fn restore(state: u64) {
    let _ = state;
    depth::leave();
}

/// [I4] Returns true when enabled, [I5] returns false when disabled
#[inline]
pub fn is_enabled() -> bool {
    depth::current() == 0
}
