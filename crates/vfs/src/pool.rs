//! TEAM_445: Vnode pool.
//!
//! Vnodes are never freed. Below the desired size the pool grows; past it,
//! allocation recycles the oldest unlocked vnode from the free list, or from
//! the hold list when the free list is empty. A toggle flipped on every call
//! alternates between growing and draining the hold list, so vnodes caching
//! buffers are not thrown away first. Past twice the desired size the pool
//! stops growing while anything is recyclable.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::diag::fault;
use crate::error::{VfsError, VfsResult};
use crate::ops::VnodeOps;
use crate::state::VnodeSlot;
use crate::types::{InvalFlags, MountId, RecycleList, VTag, VType, Vnode, VnodeFlags};
use crate::vfs::Vfs;

impl Vfs {
    /// TEAM_445: Get a vnode for a new identity.
    ///
    /// The returned vnode has one reference, type `Non`, the given tag and
    /// operations, and sits on `mp`'s vnode list.
    pub fn getnewvnode(
        &self,
        tag: VTag,
        mp: Option<MountId>,
        ops: Arc<dyn VnodeOps>,
    ) -> VfsResult<Vnode> {
        loop {
            let candidates: Vec<(Vnode, Arc<dyn VnodeOps>)> = {
                let mut st = self.state.lock();
                st.toggle = !st.toggle;
                let numvnodes = st.slots.len();
                if numvnodes > 2 * st.desired {
                    st.toggle = false;
                }

                let grow = numvnodes < st.desired
                    || (st.free.is_empty() && (st.hold.is_empty() || st.toggle));
                if grow {
                    let idx = numvnodes as u32;
                    let mut slot = VnodeSlot::new(ops.clone());
                    slot.capability = st.next_capability();
                    st.slots.push(slot);
                    return Ok(self.bind_identity(st, idx, tag, mp, ops));
                }

                let list = if st.free.is_empty() { &st.hold } else { &st.free };
                list.indices(&st.slots)
                    .into_iter()
                    .filter(|&idx| {
                        !st.slots[idx as usize]
                            .flags
                            .intersects(VnodeFlags::XLOCK | VnodeFlags::RECYCLE)
                    })
                    .map(|idx| (st.handle(idx), st.slots[idx as usize].ops.clone()))
                    .collect()
            };

            // Lock state is asked for outside the critical section
            let Some(vp) = candidates
                .into_iter()
                .find(|(vp, vops)| !vops.is_locked(self, *vp))
                .map(|(vp, _)| vp)
            else {
                log::warn!("[VFS] vnode table is full");
                return Err(VfsError::TableFull);
            };

            if self.claim(vp)? {
                return vp_after_claim(self, vp, tag, mp, ops);
            }
        }
    }

    /// Take `vp` off its recycle list for reuse. `false` when it changed
    /// underneath the scan and the allocation must start over.
    fn claim(&self, vp: Vnode) -> VfsResult<bool> {
        let mut st = self.state.lock();
        let Some(slot) = st.slot(vp) else {
            return Ok(false);
        };
        if slot.recycle_list.is_none()
            || slot
                .flags
                .intersects(VnodeFlags::XLOCK | VnodeFlags::RECYCLE)
        {
            return Ok(false);
        }
        if slot.usecount != 0 {
            fault("free vnode isn't", st.info(vp).as_ref());
        }
        st.take_off_freelist_locked(vp.index);
        st.slots[vp.slot()].flags.insert(VnodeFlags::RECYCLE);
        Ok(true)
    }

    fn bind_identity(
        &self,
        mut st: vn_hal::IrqSafeLockGuard<'_, crate::state::VfsState>,
        idx: u32,
        tag: VTag,
        mp: Option<MountId>,
        ops: Arc<dyn VnodeOps>,
    ) -> Vnode {
        {
            let slot = &mut st.slots[idx as usize];
            slot.flags = VnodeFlags::empty();
            slot.vtype = VType::Non;
            slot.tag = tag;
            slot.ops = ops;
            slot.usecount = 1;
            slot.writecount = 0;
            slot.sinks.clear();
        }
        st.insmntque_locked(idx, mp);
        let vp = st.handle(idx);
        crate::vtrace!("[VFS] getnewvnode {} tag {:?}", vp, tag);
        vp
    }
}

/// Strip the old identity from a claimed vnode and give it the new one.
fn vp_after_claim(
    vfs: &Vfs,
    vp: Vnode,
    tag: VTag,
    mp: Option<MountId>,
    ops: Arc<dyn VnodeOps>,
) -> VfsResult<Vnode> {
    let needs_teardown = vfs.state.lock().slot(vp).is_some_and(|s| s.vtype != VType::Bad);
    if needs_teardown {
        // Concurrent teardown of the same vnode is fine: we only need it dead
        let _ = vfs.vgone(vp);
    }
    // A vnode that died while referenced may have cached blocks since
    let cached = vfs
        .state
        .lock()
        .slot(vp)
        .is_some_and(|s| !s.clean.is_empty() || !s.dirty.is_empty());
    if cached {
        vfs.vinvalbuf(vp, InvalFlags::empty())?;
    }

    let mut st = vfs.state.lock();
    let idx = vp.index;
    {
        let slot = &st.slots[idx as usize];
        if slot.private.is_some() {
            fault("cleaned vnode isn't", st.info(vp).as_ref());
        }
        if slot.holdcnt != 0 || !slot.clean.is_empty() || !slot.dirty.is_empty() {
            fault("cleaned vnode still caches buffers", st.info(vp).as_ref());
        }
        if slot.sync_bucket.is_some() {
            fault("cleaned vnode on syncer worklist", st.info(vp).as_ref());
        }
        if slot.numoutput != 0 {
            fault("clean vnode has pending I/O's", st.info(vp).as_ref());
        }
        if slot.usecount != 0 || slot.recycle_list.is_some() {
            fault("recycled vnode was reused", st.info(vp).as_ref());
        }
    }

    let capability = st.next_capability();
    let slot = &mut st.slots[idx as usize];
    slot.generation = slot.generation.wrapping_add(1);
    slot.capability = capability;
    log::debug!("[VFS] recycled {} for {:?}", vp, tag);
    Ok(vfs.bind_identity(st, idx, tag, mp, ops))
}

impl Vfs {
    /// Raise the pool's target size. It never shrinks.
    pub fn set_desired_vnodes(&self, n: usize) {
        let mut st = self.state.lock();
        if n > st.desired {
            st.desired = n;
        }
    }

    pub fn desired_vnodes(&self) -> usize {
        self.state.lock().desired
    }

    pub fn numvnodes(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Length of a recycle list.
    pub fn recycle_len(&self, list: RecycleList) -> usize {
        let st = self.state.lock();
        match list {
            RecycleList::Free => st.free.len(),
            RecycleList::Hold => st.hold.len(),
        }
    }
}
