//! TEAM_440: Delayed-write scheduler.
//!
//! Vnodes with dirty buffers sit on a timing wheel of `syncer_maxdelay`
//! slots. A vnode is queued once, when its first buffer turns dirty, at a
//! delay chosen by its kind, and leaves the wheel when its last dirty buffer
//! goes. Each [`Vfs::syncer_tick`] flushes the vnodes in the current slot and
//! advances the wheel.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use vn_utils::LockFlags;

use crate::state::{VfsState, VnodeSlot};
use crate::types::{VType, Vnode};
use crate::vfs::Vfs;

pub(crate) struct SyncerWheel {
    buckets: Vec<VecDeque<Vnode>>,
    cursor: usize,
}

impl SyncerWheel {
    pub fn new(maxdelay: usize) -> Self {
        Self {
            buckets: (0..maxdelay.max(1)).map(|_| VecDeque::new()).collect(),
            cursor: 0,
        }
    }

    fn bucket_in(&self, delay: usize) -> usize {
        let n = self.buckets.len();
        (self.cursor + delay.min(n - 1)) % n
    }

    /// Ticks until a vnode's slot comes round, counting the current slot as 0.
    pub fn position(&self, slot: &VnodeSlot) -> Option<usize> {
        let n = self.buckets.len();
        slot.sync_bucket.map(|b| (b + n - self.cursor) % n)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Every queued vnode, soonest first.
    pub fn queued(&self) -> Vec<Vnode> {
        let n = self.buckets.len();
        (0..n)
            .flat_map(|i| self.buckets[(self.cursor + i) % n].iter().copied())
            .collect()
    }

    fn take_current(&mut self) -> (usize, Vec<Vnode>) {
        let bucket = self.cursor;
        let list = self.buckets[bucket].iter().copied().collect();
        self.cursor = (self.cursor + 1) % self.buckets.len();
        (bucket, list)
    }
}

impl VfsState {
    /// Flush delay for a vnode, by kind.
    pub fn sync_delay(&self, idx: u32) -> usize {
        let slot = &self.slots[idx as usize];
        match slot.vtype {
            VType::Dir => self.config.dirdelay,
            VType::Blk if slot.spec.as_ref().is_some_and(|s| s.mountpoint.is_some()) => {
                self.config.metadelay
            }
            _ => self.config.syncdelay,
        }
    }

    /// Queue a vnode `delay` ticks out, replacing any earlier position.
    pub fn syncer_add_locked(&mut self, idx: u32, delay: usize) {
        self.syncer_remove_locked(idx);
        let vp = self.handle(idx);
        let bucket = self.syncer.bucket_in(delay);
        self.syncer.buckets[bucket].push_back(vp);
        self.slots[idx as usize].sync_bucket = Some(bucket);
    }

    pub fn syncer_remove_locked(&mut self, idx: u32) {
        if let Some(bucket) = self.slots[idx as usize].sync_bucket.take() {
            let list = &mut self.syncer.buckets[bucket];
            if let Some(pos) = list.iter().position(|v| v.index == idx) {
                list.remove(pos);
            }
        }
    }
}

impl Vfs {
    /// TEAM_440: Run one slot of the delayed-write wheel.
    ///
    /// Returns how many vnodes were flushed. A vnode that is busy, or still
    /// dirty after its flush, is queued again a full `syncdelay` out.
    pub fn syncer_tick(&self) -> usize {
        let (bucket, due) = self.state.lock().syncer.take_current();
        let mut flushed = 0;

        for vp in due {
            match self.vget(vp, LockFlags::EXCLUSIVE | LockFlags::NOWAIT) {
                Ok(()) => {
                    let ops = self.ops_of(vp);
                    if let Some(ops) = ops
                        && let Err(e) = ops.fsync(self, vp, false)
                    {
                        log::warn!("[SYNCER] fsync of {} failed: {}", vp, e);
                    }
                    if let Err(e) = self.vput(vp) {
                        log::warn!("[SYNCER] release of {} failed: {}", vp, e);
                    }
                    flushed += 1;
                }
                Err(e) => {
                    crate::vtrace!("[SYNCER] skipping {}: {}", vp, e);
                }
            }

            let mut st = self.state.lock();
            let requeue = st
                .slot(vp)
                .is_some_and(|s| s.sync_bucket == Some(bucket));
            if requeue {
                let delay = st.config.syncdelay;
                st.syncer_add_locked(vp.index, delay);
            }
        }
        flushed
    }

    /// Ticks until `vp`'s scheduled flush, `None` when it is not queued.
    pub fn syncer_schedule(&self, vp: Vnode) -> Option<usize> {
        let st = self.state.lock();
        st.slot(vp).and_then(|s| st.syncer.position(s))
    }

    /// Number of vnodes queued on the wheel.
    pub fn syncer_queued(&self) -> usize {
        self.state.lock().syncer.len()
    }
}
