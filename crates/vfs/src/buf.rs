//! TEAM_450: Buffer-vnode binding.
//!
//! A buffer caching a block of a vnode sits on exactly one of that vnode's
//! clean or dirty queues and counts one hold against it. Every queue change
//! happens inside the critical section, so no one ever sees a buffer owned
//! twice or, while bound, owned by nobody. The first dirty buffer puts a
//! vnode on the delayed-write wheel; the last one leaving takes it off.
//!
//! Buffer contents are not modelled. A buffer is its flags, its logical
//! block number and its owner.

use alloc::vec::Vec;

use vn_utils::LockFlags;

use crate::diag::fault;
use crate::error::{VfsError, VfsResult};
use crate::state::VfsState;
use crate::types::{BufFlags, BufId, BufQueue, Dev, InvalFlags, Vnode};
use crate::vfs::Vfs;

/// TEAM_450: Point-in-time copy of a buffer's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufInfo {
    pub id: BufId,
    pub flags: BufFlags,
    pub lblkno: i64,
    pub vnode: Option<Vnode>,
    pub queue: Option<BufQueue>,
    pub dev: Dev,
}

// ============================================================================
// Queue bookkeeping (critical section held)
// ============================================================================

impl VfsState {
    /// Bind an unowned buffer to `vp`, on the clean queue.
    pub fn bgetvp_locked(&mut self, vp: Vnode, bp: BufId) {
        debug_assert!(!vn_hal::interrupts::is_enabled());
        let b = self.live_buf(bp, "bgetvp: stale buffer");
        if b.vp.is_some() {
            fault("bgetvp: not free", None);
        }
        let lblkno = b.lblkno;
        let rdev = self.live(vp, "bgetvp: stale vnode").rdev();
        if self
            .incore
            .get(&(vp.index, lblkno))
            .is_some_and(|&other| other != bp)
        {
            fault("bgetvp: block already cached", self.info(vp).as_ref());
        }

        self.vhold_locked(vp.index);
        let b = &mut self.bufs[bp.slot()];
        b.vp = Some(vp);
        b.dev = rdev.unwrap_or(Dev::NODEV);
        b.queue = Some(BufQueue::Clean);
        self.slots[vp.slot()].clean.push_front(bp);
        self.incore.insert((vp.index, lblkno), bp);
    }

    /// Unbind a buffer from its vnode.
    pub fn brelvp_locked(&mut self, bp: BufId) {
        debug_assert!(!vn_hal::interrupts::is_enabled());
        let b = self.live_buf(bp, "brelvp: stale buffer");
        let Some(vp) = b.vp else {
            fault("brelvp: NULL", None);
        };
        let lblkno = b.lblkno;

        self.unqueue_buf_locked(bp);
        let b = &mut self.bufs[bp.slot()];
        b.vp = None;
        b.dev = Dev::NODEV;
        if self.incore.get(&(vp.index, lblkno)) == Some(&bp) {
            self.incore.remove(&(vp.index, lblkno));
        }
        if self.slots[vp.slot()].dirty.is_empty() {
            self.syncer_remove_locked(vp.index);
        }
        self.vunhold_locked(vp.index);
    }

    /// Move a buffer to the queue matching its DELWRI flag.
    pub fn reassignbuf_locked(&mut self, bp: BufId) {
        debug_assert!(!vn_hal::interrupts::is_enabled());
        let b = self.live_buf(bp, "reassignbuf: stale buffer");
        let Some(vp) = b.vp else {
            fault("reassignbuf: NULL", None);
        };
        let dirty = b.flags.contains(BufFlags::DELWRI);
        self.unqueue_buf_locked(bp);

        let idx = vp.index;
        if dirty {
            self.slots[idx as usize].dirty.push_front(bp);
            self.bufs[bp.slot()].queue = Some(BufQueue::Dirty);
            if self.slots[idx as usize].sync_bucket.is_none() {
                let delay = self.sync_delay(idx);
                self.syncer_add_locked(idx, delay);
            }
        } else {
            self.slots[idx as usize].clean.push_front(bp);
            self.bufs[bp.slot()].queue = Some(BufQueue::Clean);
            if self.slots[idx as usize].dirty.is_empty() {
                self.syncer_remove_locked(idx);
            }
        }
    }

    /// Count one finished write against `vp`. True when a drain waiter
    /// must be woken.
    pub fn vwakeup_locked(&mut self, vp: Vnode) -> bool {
        if self.live(vp, "vwakeup: stale vnode").numoutput == 0 {
            fault("vwakeup: neg numoutput", self.info(vp).as_ref());
        }
        let slot = self.live(vp, "vwakeup: stale vnode");
        slot.numoutput -= 1;
        if slot.numoutput == 0 && slot.io_wait {
            slot.io_wait = false;
            return true;
        }
        false
    }

    /// Release a busy buffer. Invalid and failed buffers are unbound and
    /// freed. True when someone waits for the buffer.
    pub fn brelse_locked(&mut self, bp: BufId) -> bool {
        let b = self.live_buf(bp, "brelse: stale buffer");
        b.flags.remove(BufFlags::BUSY | BufFlags::ASYNC);
        let wanted = b.flags.contains(BufFlags::WANTED);
        b.flags.remove(BufFlags::WANTED);
        if b.flags.intersects(BufFlags::INVAL | BufFlags::ERROR) {
            if b.vp.is_some() {
                self.brelvp_locked(bp);
            }
            self.free_buf_locked(bp);
        }
        wanted
    }

    fn count_pending_writes(&self) -> usize {
        self.bufs
            .iter()
            .filter(|b| {
                b.allocated && b.flags.intersects(BufFlags::DELWRI | BufFlags::WRITEINPROG)
            })
            .count()
    }
}

impl Vfs {
    // ========================================================================
    // Buffer table
    // ========================================================================

    /// Allocate an unowned, busy buffer.
    pub fn buf_alloc(&self, lblkno: i64) -> BufId {
        self.state.lock().alloc_buf_locked(lblkno)
    }

    /// Unbind and free a buffer.
    pub fn buf_free(&self, bp: BufId) {
        let wanted = {
            let mut st = self.state.lock();
            let b = st.live_buf(bp, "buf_free: stale buffer");
            if b.flags.contains(BufFlags::WRITEINPROG) {
                fault("buf_free: write in progress", None);
            }
            let wanted = b.flags.contains(BufFlags::WANTED);
            if b.vp.is_some() {
                st.brelvp_locked(bp);
            }
            st.free_buf_locked(bp);
            wanted
        };
        if wanted {
            self.buf_chan.wakeup();
        }
    }

    /// TEAM_450: Get the buffer for block `lblkno` of `vp`, busy.
    ///
    /// Sleeps while another context holds the buffer. A block not yet
    /// cached gets a new buffer bound to `vp`.
    pub fn getblk(&self, vp: Vnode, lblkno: i64) -> BufId {
        let mut st = self.state.lock();
        loop {
            let _ = st.live(vp, "getblk: stale vnode");
            let Some(bp) = st.incore.get(&(vp.index, lblkno)).copied() else {
                let bp = st.alloc_buf_locked(lblkno);
                st.bgetvp_locked(vp, bp);
                return bp;
            };
            let b = &mut st.bufs[bp.slot()];
            if b.flags.contains(BufFlags::BUSY) {
                b.flags.insert(BufFlags::WANTED);
                st = self.sleep(&self.buf_chan, st);
                continue;
            }
            b.flags.insert(BufFlags::BUSY);
            return bp;
        }
    }

    /// Cached buffer for block `lblkno` of `vp`, without taking it.
    pub fn incore(&self, vp: Vnode, lblkno: i64) -> Option<BufId> {
        let st = self.state.lock();
        st.slot(vp)?;
        st.incore.get(&(vp.index, lblkno)).copied()
    }

    pub fn buf_info(&self, bp: BufId) -> Option<BufInfo> {
        let st = self.state.lock();
        st.buf(bp).map(|b| BufInfo {
            id: bp,
            flags: b.flags,
            lblkno: b.lblkno,
            vnode: b.vp,
            queue: b.queue,
            dev: b.dev,
        })
    }

    /// Clean and dirty buffers of `vp`, newest first.
    pub fn vnode_buffers(&self, vp: Vnode) -> Option<(Vec<BufId>, Vec<BufId>)> {
        let st = self.state.lock();
        st.slot(vp).map(|s| {
            (
                s.clean.iter().copied().collect(),
                s.dirty.iter().copied().collect(),
            )
        })
    }

    // ========================================================================
    // Binding
    // ========================================================================

    /// TEAM_450: Bind a buffer to a vnode. The vnode gains a hold.
    pub fn bgetvp(&self, vp: Vnode, bp: BufId) {
        self.state.lock().bgetvp_locked(vp, bp);
    }

    /// TEAM_450: Unbind a buffer from its vnode, dropping the hold.
    pub fn brelvp(&self, bp: BufId) {
        self.state.lock().brelvp_locked(bp);
    }

    /// TEAM_450: Re-file a buffer after its DELWRI flag changed.
    ///
    /// A vnode gaining its first dirty buffer is queued on the
    /// delayed-write wheel; one that is already queued keeps its slot.
    pub fn reassignbuf(&self, bp: BufId) {
        self.state.lock().reassignbuf_locked(bp);
    }

    /// TEAM_450: Move a buffer to another vnode.
    ///
    /// A write in flight moves its pending-output count along with it.
    pub fn replace_vnode(&self, bp: BufId, newvp: Vnode) {
        let wake = {
            let mut st = self.state.lock();
            let b = st.live_buf(bp, "buf_replacevnode: stale buffer");
            let Some(old) = b.vp else {
                fault("buf_replacevnode: NULL", None);
            };
            let inflight = b.flags.contains(BufFlags::WRITEINPROG);
            let _ = st.live(newvp, "buf_replacevnode: stale vnode");

            let wake = if inflight {
                st.slots[newvp.slot()].numoutput += 1;
                st.vwakeup_locked(old)
            } else {
                false
            };
            st.brelvp_locked(bp);
            st.bgetvp_locked(newvp, bp);
            st.reassignbuf_locked(bp);
            wake
        };
        if wake {
            self.io_chan.wakeup();
        }
    }

    /// Mark a buffer dirty and file it accordingly.
    pub fn bdirty(&self, bp: BufId) {
        let mut st = self.state.lock();
        let b = st.live_buf(bp, "bdirty: stale buffer");
        if b.flags.contains(BufFlags::DELWRI) {
            return;
        }
        b.flags.insert(BufFlags::DELWRI);
        if b.vp.is_some() {
            st.reassignbuf_locked(bp);
        }
    }

    pub fn bundirty(&self, bp: BufId) {
        let mut st = self.state.lock();
        let b = st.live_buf(bp, "bundirty: stale buffer");
        if !b.flags.contains(BufFlags::DELWRI) {
            return;
        }
        b.flags.remove(BufFlags::DELWRI);
        if b.vp.is_some() {
            st.reassignbuf_locked(bp);
        }
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Delayed write: mark dirty and release. The syncer writes it later.
    pub fn bdwrite(&self, bp: BufId) {
        self.bdirty(bp);
        self.brelse(bp);
    }

    /// TEAM_450: Write a busy buffer and wait for it.
    ///
    /// The buffer is released afterwards, and freed if the write failed.
    pub fn bwrite(&self, bp: BufId) -> VfsResult<()> {
        let started = self.start_write(bp, false);
        let done = self.biowait(bp);
        self.brelse(bp);
        started.and(done)
    }

    /// Start writing a busy buffer. Completion releases it.
    pub fn bawrite(&self, bp: BufId) -> VfsResult<()> {
        self.start_write(bp, true)
    }

    fn start_write(&self, bp: BufId, async_write: bool) -> VfsResult<()> {
        let ops = {
            let mut st = self.state.lock();
            let b = st.live_buf(bp, "bwrite: stale buffer");
            if !b.flags.contains(BufFlags::BUSY) {
                fault("bwrite: buffer not busy", None);
            }
            b.flags.remove(
                BufFlags::DELWRI
                    | BufFlags::DONE
                    | BufFlags::ERROR
                    | BufFlags::READ
                    | BufFlags::ASYNC,
            );
            b.flags.insert(BufFlags::WRITEINPROG);
            if async_write {
                b.flags.insert(BufFlags::ASYNC);
            }
            let owner = b.vp;
            match owner {
                Some(vp) => {
                    st.live(vp, "bwrite: stale vnode").numoutput += 1;
                    st.reassignbuf_locked(bp);
                    Some(st.slots[vp.slot()].ops.clone())
                }
                None => None,
            }
        };

        let Some(ops) = ops else {
            self.biodone(bp);
            return Ok(());
        };
        crate::vtrace!("[BIO] write {}", bp);
        ops.strategy(self, bp).inspect_err(|e| {
            log::warn!("[BIO] write of {} failed: {}", bp, e);
        })
    }

    /// TEAM_450: Finish a transfer.
    ///
    /// Counts a write against its vnode's pending output, then releases an
    /// asynchronous buffer or wakes whoever waits in [`Vfs::biowait`].
    pub fn biodone(&self, bp: BufId) {
        let (io_wake, buf_wake) = {
            let mut st = self.state.lock();
            if st.live_buf(bp, "biodone: stale buffer").flags.contains(BufFlags::DONE) {
                fault("biodone already", None);
            }
            let b = st.live_buf(bp, "biodone: stale buffer");
            b.flags.insert(BufFlags::DONE);
            let wrote = b.flags.contains(BufFlags::WRITEINPROG);
            b.flags.remove(BufFlags::WRITEINPROG);
            let async_write = b.flags.contains(BufFlags::ASYNC);
            let vp = b.vp;

            let io_wake = match vp {
                Some(vp) if wrote => st.vwakeup_locked(vp),
                _ => false,
            };
            let buf_wake = if async_write { st.brelse_locked(bp) } else { true };
            (io_wake, buf_wake)
        };
        if io_wake {
            self.io_chan.wakeup();
        }
        if buf_wake {
            self.buf_chan.wakeup();
        }
    }

    /// Wait for a transfer to finish. `IoError` if it failed.
    pub fn biowait(&self, bp: BufId) -> VfsResult<()> {
        let mut st = self.state.lock();
        loop {
            let b = st.live_buf(bp, "biowait: stale buffer");
            if b.flags.contains(BufFlags::DONE) {
                if b.flags.contains(BufFlags::ERROR) {
                    return Err(VfsError::IoError);
                }
                return Ok(());
            }
            st = self.sleep(&self.buf_chan, st);
        }
    }

    /// Release a busy buffer back to the cache.
    pub fn brelse(&self, bp: BufId) {
        let wake = self.state.lock().brelse_locked(bp);
        if wake {
            self.buf_chan.wakeup();
        }
    }

    // ========================================================================
    // Pending output
    // ========================================================================

    /// TEAM_450: Wait until no writes of `vp` are in flight.
    pub fn vwaitforio(&self, vp: Vnode) {
        let mut st = self.state.lock();
        loop {
            let slot = st.live(vp, "vwaitforio: stale vnode");
            if slot.numoutput == 0 {
                return;
            }
            slot.io_wait = true;
            st = self.sleep(&self.io_chan, st);
        }
    }

    /// Count one finished write against `vp`.
    pub fn vwakeup(&self, vp: Vnode) {
        let wake = self.state.lock().vwakeup_locked(vp);
        if wake {
            self.io_chan.wakeup();
        }
    }

    /// TEAM_450: Start writing every dirty buffer of `vp`.
    ///
    /// With `sync`, waits until the writes finish and the dirty queue is
    /// empty. Buffers someone else holds are waited for, not skipped.
    pub fn vflushbuf(&self, vp: Vnode, sync: bool) {
        loop {
            let (pick, numoutput) = {
                let mut st = self.state.lock();
                let Some(slot) = st.slot(vp) else { return };
                let mut pick = None;
                let mut held = None;
                for &bp in &slot.dirty {
                    let flags = st.bufs[bp.slot()].flags;
                    if flags.contains(BufFlags::BUSY) {
                        held.get_or_insert(bp);
                        continue;
                    }
                    if !flags.contains(BufFlags::DELWRI) {
                        fault("vflushbuf: not dirty", st.info(vp).as_ref());
                    }
                    pick = Some(bp);
                    break;
                }
                let numoutput = slot.numoutput;

                match (pick, held) {
                    (Some(bp), _) => st.bufs[bp.slot()].flags.insert(BufFlags::BUSY),
                    (None, Some(bp)) if sync && numoutput == 0 => {
                        st.bufs[bp.slot()].flags.insert(BufFlags::WANTED);
                        drop(self.sleep(&self.buf_chan, st));
                        continue;
                    }
                    _ => {}
                }
                (pick, numoutput)
            };

            match pick {
                Some(bp) => {
                    let _ = self.bawrite(bp);
                }
                None if sync && numoutput > 0 => self.vwaitforio(vp),
                None => return,
            }
        }
    }

    /// TEAM_450: Throw away the buffers of `vp`.
    ///
    /// With `SAVE`, dirty data is written back through the filesystem's
    /// fsync first, and a failing fsync is returned. A buffer dirtied while
    /// the discard pass waited for it is written synchronously before it
    /// goes. With `SAVEMETA`, metadata buffers (negative block numbers) stay.
    pub fn vinvalbuf(&self, vp: Vnode, flags: InvalFlags) -> VfsResult<()> {
        if flags.contains(InvalFlags::SAVE) {
            self.vwaitforio(vp);
            let dirty = self.state.lock().slot(vp).is_some_and(|s| !s.dirty.is_empty());
            if dirty {
                let ops = self.ops_of(vp).ok_or(VfsError::RetryNotFound)?;
                ops.fsync(self, vp, true)?;
                self.vwaitforio(vp);
                let st = self.state.lock();
                if st
                    .slot(vp)
                    .is_some_and(|s| s.numoutput > 0 || !s.dirty.is_empty())
                {
                    fault("vinvalbuf: dirty bufs", st.info(vp).as_ref());
                }
            }
        }

        let save = flags.contains(InvalFlags::SAVE);
        let save_meta = flags.contains(InvalFlags::SAVEMETA);
        loop {
            let mut st = self.state.lock();
            let Some(slot) = st.slot(vp) else {
                return Ok(());
            };
            let pick = slot
                .clean
                .iter()
                .chain(slot.dirty.iter())
                .copied()
                .find(|bp| !(save_meta && st.bufs[bp.slot()].lblkno < 0));
            let Some(bp) = pick else { break };

            let b = &mut st.bufs[bp.slot()];
            if b.flags.contains(BufFlags::BUSY) {
                b.flags.insert(BufFlags::WANTED);
                drop(self.sleep(&self.buf_chan, st));
                continue;
            }
            if save && b.flags.contains(BufFlags::DELWRI) {
                b.flags.insert(BufFlags::BUSY);
                drop(st);
                if let Err(e) = self.bwrite(bp) {
                    log::warn!("[BIO] vinvalbuf: write-back of {} failed: {}", vp, e);
                }
                continue;
            }
            b.flags.insert(BufFlags::BUSY | BufFlags::INVAL);
            b.flags.remove(BufFlags::DELWRI);
            let wake = st.brelse_locked(bp);
            drop(st);
            if wake {
                self.buf_chan.wakeup();
            }
        }

        let st = self.state.lock();
        if !save_meta
            && st
                .slot(vp)
                .is_some_and(|s| !s.clean.is_empty() || !s.dirty.is_empty())
        {
            fault("vinvalbuf: flush failed", st.info(vp).as_ref());
        }
        Ok(())
    }

    /// TEAM_450: Push out delayed writes before shutdown.
    ///
    /// Makes up to `syncwait_iterations` passes over the delayed-write
    /// wheel. Returns how many buffers were still dirty or in flight.
    pub fn syncwait(&self) -> usize {
        let passes = self.config.syncwait_iterations.max(1);
        for pass in 0..passes {
            let queued = self.state.lock().syncer.queued();
            for vp in queued {
                if self.vget(vp, LockFlags::EXCLUSIVE | LockFlags::NOWAIT).is_err() {
                    continue;
                }
                if let Some(ops) = self.ops_of(vp)
                    && let Err(e) = ops.fsync(self, vp, false)
                {
                    log::warn!("[BIO] syncwait: fsync of {} failed: {}", vp, e);
                }
                let _ = self.vput(vp);
            }

            let pending = self.state.lock().count_pending_writes();
            if pending == 0 {
                log::info!("[BIO] syncing disks... done");
                return 0;
            }
            log::debug!("[BIO] syncwait pass {}: {} buffers pending", pass + 1, pending);
            vn_utils::relax();
        }

        let pending = self.state.lock().count_pending_writes();
        if pending > 0 {
            log::warn!("[BIO] giving up with {} buffers pending", pending);
        }
        pending
    }
}
