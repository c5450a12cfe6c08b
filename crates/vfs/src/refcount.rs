//! TEAM_446: Reference and hold counting.
//!
//! `usecount` counts active users; `holdcnt` counts cached buffers. A vnode
//! is on exactly one recycle list when, and only when, it has no active
//! users: the hold list while `holdcnt > 0`, the free list otherwise.
//!
//! ```text
//!            vget                      vhold (buffer bound)
//!   free ─────────────▶ active    free ─────────────────▶ hold
//!   hold ◀───────────── active    hold ◀───────────────── free
//!         vput / vrele                 vunhold (last buffer gone)
//! ```

use vn_utils::LockFlags;

use crate::diag::fault;
use crate::error::{VfsError, VfsResult};
use crate::types::{Vnode, VnodeFlags};
use crate::vfs::Vfs;

impl Vfs {
    /// TEAM_446: Take an active reference, optionally locking.
    ///
    /// Works on vnodes with no users, taking them off their recycle list.
    /// A vnode under teardown is waited out and reported as
    /// `RetryNotFound` (`Busy` with `NOWAIT`); the caller must look it up
    /// again. Lock flags in `flags` lock the vnode after the reference is
    /// taken; if locking fails the reference is dropped again.
    pub fn vget(&self, vp: Vnode, flags: LockFlags) -> VfsResult<()> {
        {
            let mut st = self.state.lock();
            let slot = st.slot_mut(vp).ok_or(VfsError::RetryNotFound)?;
            if slot.flags.contains(VnodeFlags::RECYCLE) {
                return Err(VfsError::RetryNotFound);
            }
            if slot.flags.contains(VnodeFlags::XLOCK) {
                if flags.contains(LockFlags::NOWAIT) {
                    return Err(VfsError::Busy);
                }
                slot.flags.insert(VnodeFlags::XWANT);
                self.wait_for_teardown(st, vp);
                return Err(VfsError::RetryNotFound);
            }
            let unused = slot.usecount == 0;
            slot.usecount += 1;
            if unused {
                st.take_off_freelist_locked(vp.index);
            }
        }
        crate::vtrace!("[VFS] vget {}", vp);

        if flags.intersects(LockFlags::SHARED | LockFlags::EXCLUSIVE)
            && let Err(e) = self.vn_lock(vp, flags)
        {
            let mut st = self.state.lock();
            if let Some(slot) = st.slot_mut(vp) {
                slot.usecount -= 1;
                if slot.usecount == 0 {
                    st.relist_if_unused_locked(vp.index);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// TEAM_446: Take another reference on an already active vnode.
    pub fn vref(&self, vp: Vnode) {
        let mut st = self.state.lock();
        if st.live(vp, "vref: stale vnode").usecount == 0 {
            fault("vref used where vget required", st.info(vp).as_ref());
        }
        st.live(vp, "vref: stale vnode").usecount += 1;
        crate::vtrace!("[VFS] vref {}", vp);
    }

    /// TEAM_446: Unlock and drop a reference.
    ///
    /// The caller holds the vnode's lock. Dropping the last reference hands
    /// the lock to `inactive` and queues the vnode for recycling.
    pub fn vput(&self, vp: Vnode) -> VfsResult<()> {
        let ops = {
            let mut st = self.state.lock();
            let slot = st.live(vp, "vput: stale vnode");
            if slot.usecount == 0 {
                fault("vput: ref cnt", st.info(vp).as_ref());
            }
            slot.usecount -= 1;
            let ops = slot.ops.clone();
            if slot.usecount > 0 {
                drop(st);
                return ops.unlock(self, vp);
            }
            if slot.writecount != 0 {
                fault("vput: bad writecount", st.info(vp).as_ref());
            }
            ops
        };
        crate::vtrace!("[VFS] vput {} inactive", vp);

        let res = ops.inactive(self, vp);
        if let Err(e) = res {
            log::warn!("[VFS] inactive of {} failed: {}", vp, e);
        }
        self.relist_if_unused(vp);
        res
    }

    /// TEAM_446: Drop a reference without holding the lock.
    ///
    /// Dropping the last reference locks the vnode for `inactive`. Returns
    /// whether taking that lock had to block.
    pub fn vrele(&self, vp: Vnode) -> VfsResult<bool> {
        {
            let mut st = self.state.lock();
            let slot = st.live(vp, "vrele: stale vnode");
            if slot.usecount == 0 {
                fault("vrele: ref cnt", st.info(vp).as_ref());
            }
            slot.usecount -= 1;
            if slot.usecount > 0 {
                return Ok(false);
            }
            if slot.writecount != 0 {
                fault("vrele: bad writecount", st.info(vp).as_ref());
            }
        }
        crate::vtrace!("[VFS] vrele {} inactive", vp);

        let blocked = match self.vn_lock(vp, LockFlags::EXCLUSIVE | LockFlags::NOWAIT) {
            Ok(()) => false,
            Err(VfsError::Busy) => match self.vn_lock(vp, LockFlags::EXCLUSIVE) {
                Ok(()) => true,
                Err(e) => return self.vrele_unlocked(vp, e, true),
            },
            Err(e) => return self.vrele_unlocked(vp, e, false),
        };

        // A concurrent vget may have revived the vnode while we waited
        let revived = self.state.lock().slot(vp).is_none_or(|s| s.usecount > 0);
        let Some(ops) = self.ops_of(vp) else {
            return Ok(blocked);
        };
        if revived {
            ops.unlock(self, vp)?;
            return Ok(blocked);
        }
        if let Err(e) = ops.inactive(self, vp) {
            log::warn!("[VFS] inactive of {} failed: {}", vp, e);
        }
        self.relist_if_unused(vp);
        Ok(blocked)
    }

    /// TEAM_446: Count a cached buffer against the vnode.
    pub fn vhold(&self, vp: Vnode) {
        let mut st = self.state.lock();
        let _ = st.live(vp, "vhold: stale vnode");
        st.vhold_locked(vp.index);
    }

    pub fn vunhold(&self, vp: Vnode) {
        let mut st = self.state.lock();
        let _ = st.live(vp, "vunhold: stale vnode");
        st.vunhold_locked(vp.index);
    }

    /// Finish a `vrele` whose lock attempt failed. Losing the race to a
    /// teardown is fine: the teardown already did the inactivation.
    fn vrele_unlocked(&self, vp: Vnode, err: VfsError, blocked: bool) -> VfsResult<bool> {
        self.relist_if_unused(vp);
        if err == VfsError::RetryNotFound {
            return Ok(blocked);
        }
        log::warn!("[VFS] vrele: cannot lock {}: {}", vp, err);
        Err(err)
    }

    pub(crate) fn relist_if_unused(&self, vp: Vnode) {
        let mut st = self.state.lock();
        if st.slot(vp).is_some() {
            st.relist_if_unused_locked(vp.index);
        }
    }
}
