//! TEAM_449: Vnode teardown.
//!
//! A vnode is torn down in two halves. `begin_clean` runs inside the
//! critical section and claims the vnode by setting XLOCK; only one context
//! can win that. `finish_clean` then runs the filesystem's close, inactive
//! and reclaim outside the section, rebinds the vnode to the dead
//! operations and clears XLOCK, waking anyone who found it set.
//!
//! ```text
//!   live ──begin_clean──▶ XLOCK ──finish_clean──▶ dead ops
//!                           │                        │
//!                   vget/vn_lock wait         vgone: off mount,
//!                   then RetryNotFound        off alias chain, VBAD
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use vn_utils::{HashSet, LockFlags};

use crate::diag::fault;
use crate::error::{VfsError, VfsResult};
use crate::mount::Mount;
use crate::ops::VnodeOps;
use crate::state::VfsState;
use crate::types::{
    CleanFlags, CloseFlags, FlushFlags, InvalFlags, MountId, VType, Vnode, VnodeEvent,
    VnodeFlags,
};
use crate::vfs::Vfs;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Only while nobody uses the vnode
    IfUnused,
    Always,
}

/// What a flush does with one vnode of the mount.
enum FlushAction {
    Skip,
    Recycle,
    Condemn,
    StripDevice,
    Busy,
}

impl Vfs {
    /// Claim `vp` for teardown. Returns whether it was in use, and its
    /// operations at the time of the claim.
    fn begin_clean(&self, st: &mut VfsState, vp: Vnode) -> (bool, Arc<dyn VnodeOps>) {
        if st.live(vp, "vclean: stale vnode").flags.contains(VnodeFlags::XLOCK) {
            fault("vclean: deadlock", st.info(vp).as_ref());
        }
        let slot = st.live(vp, "vclean: stale vnode");
        // The temporary reference keeps the vnode off the free list while
        // the filesystem runs
        let active = slot.usecount > 0;
        if active {
            slot.usecount += 1;
        }
        slot.flags.insert(VnodeFlags::XLOCK);
        let ops = slot.ops.clone();
        if active && st.config.print_active_reclaims {
            log::info!("[VFS] reclaiming active vnode {}", vp);
        }
        (active, ops)
    }

    fn finish_clean(&self, vp: Vnode, active: bool, ops: &Arc<dyn VnodeOps>, flags: CleanFlags) {
        if ops.lock(self, vp, LockFlags::DRAIN).is_err() {
            fault("vclean: cannot drain lock", self.info(vp).as_ref());
        }
        ops.discard_mappings(self, vp);

        if flags.contains(CleanFlags::DOCLOSE)
            && let Err(e) = self.vinvalbuf(vp, InvalFlags::SAVE)
        {
            log::warn!("[VFS] vclean: writeback of {} failed ({}), discarding", vp, e);
            if self.vinvalbuf(vp, InvalFlags::empty()).is_err() {
                fault("vclean: cannot discard buffers", self.info(vp).as_ref());
            }
        }

        if active {
            if flags.contains(CleanFlags::DOCLOSE)
                && let Err(e) = ops.close(self, vp, CloseFlags::NONBLOCK)
            {
                log::warn!("[VFS] vclean: close of {} failed: {}", vp, e);
            }
            if let Err(e) = ops.inactive(self, vp) {
                log::warn!("[VFS] vclean: inactive of {} failed: {}", vp, e);
            }
        } else if let Err(e) = ops.unlock(self, vp) {
            log::warn!("[VFS] vclean: unlock of {} failed: {}", vp, e);
        }

        if ops.reclaim(self, vp).is_err() {
            fault("vclean: cannot reclaim", self.info(vp).as_ref());
        }

        let (sinks, wake) = {
            let mut st = self.state.lock();
            if active {
                let slot = st.live(vp, "vclean: stale vnode");
                slot.usecount -= 1;
                if slot.usecount == 0 {
                    if slot.holdcnt > 0 {
                        fault("vclean: not clean", st.info(vp).as_ref());
                    }
                    st.relist_if_unused_locked(vp.index);
                }
            }
            let capability = st.next_capability();
            let dead = self.dead_ops.clone();
            let slot = st.live(vp, "vclean: stale vnode");
            slot.capability = capability;
            slot.ops = dead;
            slot.tag = crate::types::VTag::Non;
            let sinks = core::mem::take(&mut slot.sinks);
            let wake = slot.flags.contains(VnodeFlags::XWANT);
            slot.flags.remove(VnodeFlags::XLOCK | VnodeFlags::XWANT);
            (sinks, wake)
        };

        for sink in sinks {
            sink.notify(vp, VnodeEvent::Revoke);
        }
        if wake {
            self.xlock_chan.wakeup();
        }
        log::debug!("[VFS] cleaned {}", vp);
    }

    /// TEAM_449: Strip a vnode of its filesystem identity.
    ///
    /// The vnode keeps its references and stays on its mount; afterwards
    /// it answers with the dead operations. With `DOCLOSE` its buffers are
    /// written back and invalidated and open users are closed.
    pub fn vclean(&self, vp: Vnode, flags: CleanFlags) {
        let (active, ops) = {
            let mut st = self.state.lock();
            self.begin_clean(&mut st, vp)
        };
        self.finish_clean(vp, active, &ops, flags);
    }

    /// Claim and clean `vp` unless someone else is already tearing it down.
    /// `false` when the other teardown was waited out instead.
    fn clean_unless_claimed(&self, vp: Vnode, flags: CleanFlags, mode: Teardown) -> VfsResult<bool> {
        let (active, ops) = {
            let mut st = self.state.lock();
            let slot = st.slot_mut(vp).ok_or(VfsError::RetryNotFound)?;
            if slot.flags.contains(VnodeFlags::XLOCK) {
                slot.flags.insert(VnodeFlags::XWANT);
                self.wait_for_teardown(st, vp);
                return Ok(false);
            }
            if mode == Teardown::IfUnused
                && (slot.usecount > 0 || slot.flags.contains(VnodeFlags::RECYCLE))
            {
                return Ok(false);
            }
            self.begin_clean(&mut st, vp)
        };
        self.finish_clean(vp, active, &ops, flags);
        Ok(true)
    }

    fn vgone_inner(&self, vp: Vnode, mode: Teardown) -> VfsResult<bool> {
        if !self.clean_unless_claimed(vp, CleanFlags::DOCLOSE, mode)? {
            return Ok(false);
        }
        self.gone_tail(vp);
        Ok(true)
    }

    /// Detach a cleaned vnode from its mount and alias chain and mark it dead.
    fn gone_tail(&self, vp: Vnode) {
        let backed = {
            let mut st = self.state.lock();
            let idx = vp.index;
            st.insmntque_locked(idx, None);

            let mut backed = None;
            let (rdev, vtype) = {
                let slot = st.live(vp, "vgone: stale vnode");
                (slot.rdev(), slot.vtype)
            };
            if let Some(rdev) = rdev
                && vtype.is_device()
            {
                let bucket = st.spechash(rdev);
                let Some(pos) = st.spechash[bucket].iter().position(|&v| v == vp) else {
                    fault("missing bdev", st.info(vp).as_ref());
                };
                st.spechash[bucket].remove(pos);

                if st.slots[idx as usize].flags.contains(VnodeFlags::ALIASED) {
                    let rest: Vec<Vnode> = st.spechash[bucket]
                        .iter()
                        .copied()
                        .filter(|&v| st.slot(v).is_some_and(|s| s.rdev() == Some(rdev)))
                        .collect();
                    if let [last] = rest.as_slice()
                        && let Some(s) = st.slot_mut(*last)
                    {
                        s.flags.remove(VnodeFlags::ALIASED);
                    }
                    st.slots[idx as usize].flags.remove(VnodeFlags::ALIASED);
                }
                backed = st.slots[idx as usize]
                    .spec
                    .take()
                    .and_then(|spec| spec.mountpoint);
            }

            let slot = &mut st.slots[idx as usize];
            slot.vtype = VType::Bad;
            if slot.usecount == 0 && slot.recycle_list.is_some() {
                if slot.holdcnt > 0 {
                    fault("vgonel: not clean", st.info(vp).as_ref());
                }
                st.move_to_free_head_locked(idx);
            }
            backed
        };

        if let Some(mp) = backed {
            self.doom_mount(mp);
        }
    }

    /// TEAM_449: Tear a vnode down unconditionally.
    ///
    /// Open users keep their references to a dead vnode. If another context
    /// is already tearing `vp` down this waits for it to finish instead.
    pub fn vgone(&self, vp: Vnode) -> VfsResult<()> {
        self.vgone_inner(vp, Teardown::Always).map(|_| ())
    }

    /// Tear `vp` down if nobody is using it. Returns whether it was.
    pub fn vrecycle(&self, vp: Vnode) -> VfsResult<bool> {
        self.vgone_inner(vp, Teardown::IfUnused)
    }

    /// TEAM_449: Tear down the vnodes of a mount.
    ///
    /// Unused vnodes always go. With `FORCECLOSE` active ones go too, except
    /// devices, which are cleaned and handed to the generic device
    /// operations so their users keep working. Returns the number of
    /// vnodes left busy; `skip` is never touched.
    pub fn vflush(&self, mp: &Arc<Mount>, skip: Option<Vnode>, flags: FlushFlags) -> usize {
        let mut visited: HashSet<Vnode> = HashSet::new();
        let mut busy: HashSet<Vnode> = HashSet::new();

        loop {
            let Some((list, generation)) = self.state.lock().mount_vnodes(mp.id()) else {
                return 0;
            };
            let mut restart = false;

            for vp in list {
                if !visited.insert(vp) {
                    continue;
                }
                match self.flush_one(mp.id(), vp, skip, flags) {
                    FlushAction::Busy => {
                        if self.config.report_busy_vnodes {
                            self.vprint("vflush: busy vnode", vp);
                        }
                        busy.insert(vp);
                    }
                    FlushAction::Skip => continue,
                    _ => {}
                }
                let changed = self
                    .state
                    .lock()
                    .mounts
                    .get(&mp.id())
                    .is_none_or(|mv| mv.generation != generation);
                if changed {
                    restart = true;
                    break;
                }
            }
            if !restart {
                break;
            }
        }

        if !busy.is_empty() {
            log::debug!("[VFS] vflush of {}: {} busy", mp.name(), busy.len());
        }
        busy.len()
    }

    fn flush_one(&self, mp: MountId, vp: Vnode, skip: Option<Vnode>, flags: FlushFlags) -> FlushAction {
        loop {
            let action = self.classify_for_flush(mp, vp, skip, flags);
            let done = match action {
                FlushAction::Skip | FlushAction::Busy => return action,
                FlushAction::Recycle => self.vrecycle(vp).unwrap_or(true),
                FlushAction::Condemn => {
                    let _ = self.vgone(vp);
                    true
                }
                FlushAction::StripDevice => self.strip_device(vp).unwrap_or(true),
            };
            if done {
                return action;
            }
        }
    }

    fn classify_for_flush(
        &self,
        mp: MountId,
        vp: Vnode,
        skip: Option<Vnode>,
        flags: FlushFlags,
    ) -> FlushAction {
        if skip == Some(vp) {
            return FlushAction::Skip;
        }
        let st = self.state.lock();
        let Some(s) = st.slot(vp) else {
            return FlushAction::Skip;
        };
        // A vnode claimed for reuse leaves the mount on its own
        if s.mount != Some(mp) || s.flags.contains(VnodeFlags::RECYCLE) {
            return FlushAction::Skip;
        }
        if flags.contains(FlushFlags::SKIPSYSTEM) && s.flags.contains(VnodeFlags::SYSTEM) {
            return FlushAction::Skip;
        }
        if flags.contains(FlushFlags::WRITECLOSE) && (s.writecount == 0 || s.vtype != VType::Reg) {
            return FlushAction::Skip;
        }
        if s.usecount == 0 {
            return FlushAction::Recycle;
        }
        if flags.contains(FlushFlags::FORCECLOSE) {
            if s.vtype.is_device() {
                return FlushAction::StripDevice;
            }
            return FlushAction::Condemn;
        }
        FlushAction::Busy
    }

    /// Clean an open device vnode and move it off its mount, bound to the
    /// generic device operations.
    fn strip_device(&self, vp: Vnode) -> VfsResult<bool> {
        if !self.clean_unless_claimed(vp, CleanFlags::empty(), Teardown::Always)? {
            return Ok(false);
        }
        let mut st = self.state.lock();
        let spec_ops = self.spec_ops.clone();
        let slot = st.live(vp, "vflush: stale device vnode");
        slot.ops = spec_ops;
        st.insmntque_locked(vp.index, None);
        log::debug!("[VFS] {} detached from its mount", vp);
        Ok(true)
    }

    /// TEAM_449: Write back the dirty vnodes of a mount.
    ///
    /// Busy vnodes are skipped. Returns how many vnodes were flushed.
    pub fn sync_mount_vnodes(&self, mp: &Arc<Mount>, wait: bool) -> usize {
        let Some((list, _)) = self.state.lock().mount_vnodes(mp.id()) else {
            return 0;
        };
        let mut flushed = 0;
        for vp in list {
            let dirty = self
                .state
                .lock()
                .slot(vp)
                .is_some_and(|s| s.vtype != VType::Non && !s.dirty.is_empty());
            if !dirty || self.vget(vp, LockFlags::EXCLUSIVE | LockFlags::NOWAIT).is_err() {
                continue;
            }
            if let Some(ops) = self.ops_of(vp)
                && let Err(e) = ops.fsync(self, vp, wait)
            {
                log::warn!("[VFS] sync of {} failed: {}", vp, e);
            }
            let _ = self.vput(vp);
            flushed += 1;
        }
        flushed
    }
}
