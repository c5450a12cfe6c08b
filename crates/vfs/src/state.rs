//! TEAM_439: State guarded by the vnode layer's critical section.
//!
//! Everything a vnode, buffer or list carries lives in [`VfsState`], behind
//! the single `IrqSafeLock` in [`crate::Vfs`]. The `*_locked` helpers here
//! keep list membership consistent with reference counts and must be called
//! with that lock held; they never call into filesystem code.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use vn_utils::{HashMap, LockMgr};

use crate::config::VfsConfig;
use crate::diag::{VnodeInfo, fault};
use crate::list::{ListHead, MountLinks, RecycleLinks, Link};
use crate::ops::{EventSink, VnodeOps};
use crate::syncer::SyncerWheel;
use crate::types::{
    BufFlags, BufId, BufQueue, Dev, MountId, RecycleList, VTag, VType, Vnode, VnodeFlags,
};

pub(crate) type PrivateData = Box<dyn Any + Send + Sync>;

pub(crate) struct SpecInfo {
    pub rdev: Dev,
    /// Mount this block device backs
    pub mountpoint: Option<MountId>,
}

pub(crate) struct VnodeSlot {
    pub generation: u32,
    pub vtype: VType,
    pub tag: VTag,
    pub ops: Arc<dyn VnodeOps>,
    pub private: Option<PrivateData>,
    pub usecount: u32,
    pub writecount: u32,
    pub holdcnt: u32,
    pub numoutput: u32,
    pub io_wait: bool,
    pub flags: VnodeFlags,
    pub recycle_list: Option<RecycleList>,
    pub recycle_link: Link,
    pub mount: Option<MountId>,
    pub mount_link: Link,
    /// Newest first
    pub clean: VecDeque<BufId>,
    /// Newest first
    pub dirty: VecDeque<BufId>,
    pub sync_bucket: Option<usize>,
    pub spec: Option<SpecInfo>,
    pub capability: u64,
    pub lock: Arc<LockMgr>,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

impl VnodeSlot {
    pub fn new(ops: Arc<dyn VnodeOps>) -> Self {
        Self {
            generation: 0,
            vtype: VType::Non,
            tag: VTag::Non,
            ops,
            private: None,
            usecount: 0,
            writecount: 0,
            holdcnt: 0,
            numoutput: 0,
            io_wait: false,
            flags: VnodeFlags::empty(),
            recycle_list: None,
            recycle_link: Link::default(),
            mount: None,
            mount_link: Link::default(),
            clean: VecDeque::new(),
            dirty: VecDeque::new(),
            sync_bucket: None,
            spec: None,
            capability: 0,
            lock: Arc::new(LockMgr::new("vnode")),
            sinks: Vec::new(),
        }
    }

    pub fn rdev(&self) -> Option<Dev> {
        self.spec.as_ref().map(|s| s.rdev)
    }

    pub fn is_device(&self) -> bool {
        self.vtype.is_device() && self.spec.is_some()
    }
}

pub(crate) struct BufSlot {
    pub generation: u32,
    pub allocated: bool,
    pub flags: BufFlags,
    pub lblkno: i64,
    pub vp: Option<Vnode>,
    pub dev: Dev,
    pub queue: Option<BufQueue>,
}

impl BufSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            allocated: false,
            flags: BufFlags::empty(),
            lblkno: 0,
            vp: None,
            dev: Dev::NODEV,
            queue: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct MountVnodes {
    pub list: ListHead<MountLinks>,
    /// Bumped on every insertion and removal
    pub generation: u64,
}

pub(crate) struct VfsState {
    pub slots: Vec<VnodeSlot>,
    pub free: ListHead<RecycleLinks>,
    pub hold: ListHead<RecycleLinks>,
    pub desired: usize,
    pub toggle: bool,
    pub next_capability: u64,
    pub mounts: HashMap<MountId, MountVnodes>,
    /// Device alias buckets, newest first
    pub spechash: Vec<VecDeque<Vnode>>,
    pub bufs: Vec<BufSlot>,
    pub free_bufs: Vec<u32>,
    /// (owner slot, logical block) to buffer
    pub incore: HashMap<(u32, i64), BufId>,
    pub syncer: SyncerWheel,
    pub config: VfsConfig,
}

impl VfsState {
    pub fn new(config: VfsConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: ListHead::default(),
            hold: ListHead::default(),
            desired: config.desired_vnodes,
            toggle: false,
            next_capability: 1,
            mounts: HashMap::new(),
            spechash: (0..config.spechash_size).map(|_| VecDeque::new()).collect(),
            bufs: Vec::new(),
            free_bufs: Vec::new(),
            incore: HashMap::new(),
            syncer: SyncerWheel::new(config.syncer_maxdelay),
            config,
        }
    }

    // ========================================================================
    // Slot lookup
    // ========================================================================

    pub fn slot(&self, vp: Vnode) -> Option<&VnodeSlot> {
        self.slots
            .get(vp.slot())
            .filter(|s| s.generation == vp.generation)
    }

    pub fn slot_mut(&mut self, vp: Vnode) -> Option<&mut VnodeSlot> {
        self.slots
            .get_mut(vp.slot())
            .filter(|s| s.generation == vp.generation)
    }

    /// Slot for a handle the caller must still own. A stale handle here is
    /// a use-after-release.
    #[track_caller]
    pub fn live(&mut self, vp: Vnode, who: &str) -> &mut VnodeSlot {
        if self.slot(vp).is_none() {
            fault(who, None);
        }
        &mut self.slots[vp.slot()]
    }

    pub fn handle(&self, idx: u32) -> Vnode {
        Vnode::new(idx, self.slots[idx as usize].generation)
    }

    pub fn info(&self, vp: Vnode) -> Option<VnodeInfo> {
        self.slot(vp).map(|s| VnodeInfo::capture(vp, s, self.syncer.position(s)))
    }

    pub fn next_capability(&mut self) -> u64 {
        let id = self.next_capability;
        self.next_capability += 1;
        id
    }

    pub fn spechash(&self, rdev: Dev) -> usize {
        let r = rdev.raw() as usize;
        ((r >> 5) + r) & (self.spechash.len() - 1)
    }

    // ========================================================================
    // Recycle lists
    // ========================================================================

    /// Queue an unreferenced vnode: hold list while it caches buffers,
    /// otherwise the free list. Torn-down vnodes go to the front.
    pub fn put_on_freelist_locked(&mut self, idx: u32) {
        let vp = self.handle(idx);
        let slot = &self.slots[idx as usize];
        if slot.usecount != 0 {
            fault("vputonfreelist: use count is not zero", self.info(vp).as_ref());
        }
        if slot.recycle_list.is_some() {
            fault("vnode already on free list", self.info(vp).as_ref());
        }
        let (kind, front) = (
            if slot.holdcnt > 0 {
                RecycleList::Hold
            } else {
                RecycleList::Free
            },
            slot.vtype == VType::Bad,
        );
        let list = match kind {
            RecycleList::Hold => &mut self.hold,
            RecycleList::Free => &mut self.free,
        };
        if front {
            list.insert_head(&mut self.slots, idx);
        } else {
            list.insert_tail(&mut self.slots, idx);
        }
        self.slots[idx as usize].recycle_list = Some(kind);
    }

    pub fn take_off_freelist_locked(&mut self, idx: u32) {
        match self.slots[idx as usize].recycle_list.take() {
            Some(RecycleList::Free) => self.free.remove(&mut self.slots, idx),
            Some(RecycleList::Hold) => self.hold.remove(&mut self.slots, idx),
            None => {}
        }
    }

    /// Move a queued vnode to the front of the free list.
    pub fn move_to_free_head_locked(&mut self, idx: u32) {
        self.take_off_freelist_locked(idx);
        self.free.insert_head(&mut self.slots, idx);
        self.slots[idx as usize].recycle_list = Some(RecycleList::Free);
    }

    /// Re-queue an unreferenced vnode that fell off the lists.
    pub fn relist_if_unused_locked(&mut self, idx: u32) {
        let slot = &self.slots[idx as usize];
        if slot.usecount == 0
            && slot.recycle_list.is_none()
            && !slot.flags.contains(VnodeFlags::RECYCLE)
        {
            self.put_on_freelist_locked(idx);
        }
    }

    pub fn vhold_locked(&mut self, idx: u32) {
        let slot = &self.slots[idx as usize];
        if slot.holdcnt == 0 && slot.usecount == 0 && slot.recycle_list == Some(RecycleList::Free)
        {
            self.free.remove(&mut self.slots, idx);
            self.hold.insert_tail(&mut self.slots, idx);
            self.slots[idx as usize].recycle_list = Some(RecycleList::Hold);
        }
        self.slots[idx as usize].holdcnt += 1;
    }

    pub fn vunhold_locked(&mut self, idx: u32) {
        let vp = self.handle(idx);
        if self.slots[idx as usize].holdcnt == 0 {
            fault("vunhold: holdcnt", self.info(vp).as_ref());
        }
        let slot = &mut self.slots[idx as usize];
        slot.holdcnt -= 1;
        if slot.holdcnt == 0 && slot.usecount == 0 && slot.recycle_list == Some(RecycleList::Hold)
        {
            self.hold.remove(&mut self.slots, idx);
            self.free.insert_tail(&mut self.slots, idx);
            self.slots[idx as usize].recycle_list = Some(RecycleList::Free);
        }
    }

    // ========================================================================
    // Mount membership
    // ========================================================================

    /// Move a vnode from its current mount's list to `mp`'s.
    pub fn insmntque_locked(&mut self, idx: u32, mp: Option<MountId>) {
        if let Some(old) = self.slots[idx as usize].mount.take()
            && let Some(mv) = self.mounts.get_mut(&old)
        {
            mv.list.remove(&mut self.slots, idx);
            mv.generation += 1;
        }
        if let Some(new) = mp {
            let Some(mv) = self.mounts.get_mut(&new) else {
                let vp = self.handle(idx);
                fault("insmntque: unknown mount", self.info(vp).as_ref());
            };
            mv.list.insert_head(&mut self.slots, idx);
            mv.generation += 1;
            self.slots[idx as usize].mount = Some(new);
        }
    }

    pub fn mount_vnodes(&self, mp: MountId) -> Option<(Vec<Vnode>, u64)> {
        self.mounts.get(&mp).map(|mv| {
            let list = mv
                .list
                .indices(&self.slots)
                .into_iter()
                .map(|idx| self.handle(idx))
                .collect();
            (list, mv.generation)
        })
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub fn buf(&self, bp: BufId) -> Option<&BufSlot> {
        self.bufs
            .get(bp.slot())
            .filter(|b| b.allocated && b.generation == bp.generation)
    }

    #[track_caller]
    pub fn live_buf(&mut self, bp: BufId, who: &str) -> &mut BufSlot {
        if self.buf(bp).is_none() {
            fault(who, None);
        }
        &mut self.bufs[bp.slot()]
    }

    pub fn alloc_buf_locked(&mut self, lblkno: i64) -> BufId {
        let index = if let Some(i) = self.free_bufs.pop() {
            i
        } else {
            self.bufs.push(BufSlot::new());
            (self.bufs.len() - 1) as u32
        };
        let b = &mut self.bufs[index as usize];
        b.allocated = true;
        b.flags = BufFlags::BUSY;
        b.lblkno = lblkno;
        b.vp = None;
        b.dev = Dev::NODEV;
        b.queue = None;
        let id = BufId::new(index, b.generation);

        let live = self.bufs.len() - self.free_bufs.len();
        if live > self.desired {
            self.desired = live;
        }
        id
    }

    pub fn free_buf_locked(&mut self, bp: BufId) {
        let b = &mut self.bufs[bp.slot()];
        b.allocated = false;
        b.generation = b.generation.wrapping_add(1);
        b.flags = BufFlags::empty();
        self.free_bufs.push(bp.index);
    }

    /// Pull a buffer off whichever owner list it is on.
    pub fn unqueue_buf_locked(&mut self, bp: BufId) {
        let b = &mut self.bufs[bp.slot()];
        let (Some(queue), Some(vp)) = (b.queue.take(), b.vp) else {
            return;
        };
        let slot = &mut self.slots[vp.slot()];
        let list = match queue {
            BufQueue::Clean => &mut slot.clean,
            BufQueue::Dirty => &mut slot.dirty,
        };
        if let Some(pos) = list.iter().position(|&x| x == bp) {
            list.remove(pos);
        }
    }
}
