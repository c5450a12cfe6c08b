//! TEAM_444: The vnode layer instance.
//!
//! [`Vfs`] owns the vnode pool, the buffer table, the alias hash, the
//! delayed-write wheel and the mount list. Shared state sits behind one
//! interrupt-masking lock; sleeping happens on wait channels after that lock
//! is dropped, and filesystem callbacks always run outside it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use vn_hal::{IrqSafeLock, IrqSafeLockGuard};
use vn_utils::{LockFlags, RwLock, WaitChannel};

use crate::config::VfsConfig;
use crate::dead::DeadOps;
use crate::diag::{VnodeInfo, fault};
use crate::error::{VfsError, VfsResult};
use crate::mount::Mount;
use crate::ops::{EventSink, VnodeOps};
use crate::spec::SpecOps;
use crate::state::VfsState;
use crate::types::{BufFlags, BufId, Dev, MountId, VType, Vnode, VnodeFlags};

pub struct Vfs {
    pub(crate) config: VfsConfig,
    pub(crate) state: IrqSafeLock<VfsState>,
    pub(crate) mounts: RwLock<Vec<Arc<Mount>>>,
    /// XLOCK cleared
    pub(crate) xlock_chan: WaitChannel,
    /// Pending output drained
    pub(crate) io_chan: WaitChannel,
    /// Buffer released or completed
    pub(crate) buf_chan: WaitChannel,
    pub(crate) dead_ops: Arc<dyn VnodeOps>,
    pub(crate) spec_ops: Arc<dyn VnodeOps>,
}

impl Vfs {
    /// Create a layer with default tunables.
    pub fn new() -> Self {
        Self::build(VfsConfig::new())
    }

    pub fn with_config(config: VfsConfig) -> VfsResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    pub(crate) fn build(config: VfsConfig) -> Self {
        log::info!(
            "[VFS] vnode layer up: desired {} vnodes, {} alias buckets, wheel of {}",
            config.desired_vnodes,
            config.spechash_size,
            config.syncer_maxdelay
        );
        Self {
            config,
            state: IrqSafeLock::new(VfsState::new(config)),
            mounts: RwLock::new(Vec::new()),
            xlock_chan: WaitChannel::new(),
            io_chan: WaitChannel::new(),
            buf_chan: WaitChannel::new(),
            dead_ops: Arc::new(DeadOps),
            spec_ops: Arc::new(SpecOps),
        }
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// Drop the critical section, sleep on `chan`, and take it back.
    pub(crate) fn sleep<'a>(
        &'a self,
        chan: &WaitChannel,
        st: IrqSafeLockGuard<'a, VfsState>,
    ) -> IrqSafeLockGuard<'a, VfsState> {
        st.sleep_on(chan)
    }

    /// Sleep until teardown of `vp` finishes. Caller has set XWANT.
    pub(crate) fn wait_for_teardown<'a>(
        &'a self,
        mut st: IrqSafeLockGuard<'a, VfsState>,
        vp: Vnode,
    ) {
        loop {
            st = self.sleep(&self.xlock_chan, st);
            match st.slot_mut(vp) {
                Some(slot) if slot.flags.contains(VnodeFlags::XLOCK) => {
                    slot.flags.insert(VnodeFlags::XWANT);
                }
                _ => return,
            }
        }
    }

    pub(crate) fn ops_of(&self, vp: Vnode) -> Option<Arc<dyn VnodeOps>> {
        self.state.lock().slot(vp).map(|s| s.ops.clone())
    }

    // ========================================================================
    // Per-vnode lock
    // ========================================================================

    /// Lock a vnode through the layer's own lock manager.
    pub fn generic_lock(&self, vp: Vnode, flags: LockFlags) -> VfsResult<()> {
        let lk = self
            .state
            .lock()
            .slot(vp)
            .map(|s| s.lock.clone())
            .ok_or(VfsError::RetryNotFound)?;
        lk.lock(flags).map_err(VfsError::from)
    }

    pub fn generic_unlock(&self, vp: Vnode) -> VfsResult<()> {
        let lk = self
            .state
            .lock()
            .slot(vp)
            .map(|s| s.lock.clone())
            .ok_or(VfsError::RetryNotFound)?;
        lk.unlock().map_err(VfsError::from)
    }

    pub fn generic_is_locked(&self, vp: Vnode) -> bool {
        let lk = self.state.lock().slot(vp).map(|s| s.lock.clone());
        lk.is_some_and(|lk| lk.is_locked())
    }

    /// TEAM_444: Lock a vnode, refusing one that is being torn down.
    ///
    /// Waits out a teardown in progress and reports `RetryNotFound`, or
    /// `Busy` under `NOWAIT`.
    pub fn vn_lock(&self, vp: Vnode, flags: LockFlags) -> VfsResult<()> {
        let ops = {
            let mut st = self.state.lock();
            let slot = st.slot_mut(vp).ok_or(VfsError::RetryNotFound)?;
            if slot.flags.contains(VnodeFlags::XLOCK) {
                if flags.contains(LockFlags::NOWAIT) {
                    return Err(VfsError::Busy);
                }
                slot.flags.insert(VnodeFlags::XWANT);
                self.wait_for_teardown(st, vp);
                return Err(VfsError::RetryNotFound);
            }
            slot.ops.clone()
        };

        ops.lock(self, vp, flags)?;

        // Teardown may have started while we slept on the lock
        let torn = {
            let mut st = self.state.lock();
            match st.slot_mut(vp) {
                Some(slot) if slot.flags.contains(VnodeFlags::XLOCK) => {
                    slot.flags.insert(VnodeFlags::XWANT);
                    true
                }
                _ => false,
            }
        };
        if torn {
            let _ = ops.unlock(self, vp);
            let st = self.state.lock();
            if st.slot(vp).is_some_and(|s| s.flags.contains(VnodeFlags::XLOCK)) {
                self.wait_for_teardown(st, vp);
            }
            return Err(VfsError::RetryNotFound);
        }
        Ok(())
    }

    pub fn vn_unlock(&self, vp: Vnode) -> VfsResult<()> {
        let ops = self.ops_of(vp).ok_or(VfsError::RetryNotFound)?;
        ops.unlock(self, vp)
    }

    pub fn is_locked(&self, vp: Vnode) -> bool {
        self.ops_of(vp).is_some_and(|ops| ops.is_locked(self, vp))
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn vtype(&self, vp: Vnode) -> Option<VType> {
        self.state.lock().slot(vp).map(|s| s.vtype)
    }

    /// Set the type of a vnode the caller just created.
    pub fn set_type(&self, vp: Vnode, vtype: VType) {
        self.state.lock().live(vp, "set_type: stale vnode").vtype = vtype;
    }

    /// Set filesystem-owned flags (ROOT, TEXT, SYSTEM).
    pub fn set_flags(&self, vp: Vnode, flags: VnodeFlags) {
        let mut st = self.state.lock();
        st.live(vp, "set_flags: stale vnode")
            .flags
            .insert(flags & VnodeFlags::USER);
    }

    pub fn clear_flags(&self, vp: Vnode, flags: VnodeFlags) {
        let mut st = self.state.lock();
        st.live(vp, "clear_flags: stale vnode")
            .flags
            .remove(flags & VnodeFlags::USER);
    }

    pub fn flags(&self, vp: Vnode) -> Option<VnodeFlags> {
        self.state.lock().slot(vp).map(|s| s.flags)
    }

    pub fn usecount(&self, vp: Vnode) -> Option<u32> {
        self.state.lock().slot(vp).map(|s| s.usecount)
    }

    pub fn holdcnt(&self, vp: Vnode) -> Option<u32> {
        self.state.lock().slot(vp).map(|s| s.holdcnt)
    }

    pub fn mount_of(&self, vp: Vnode) -> Option<MountId> {
        self.state.lock().slot(vp).and_then(|s| s.mount)
    }

    pub fn rdev(&self, vp: Vnode) -> Option<Dev> {
        self.state.lock().slot(vp).and_then(|s| s.rdev())
    }

    /// Name cache capability. Changes whenever the vnode's identity does.
    pub fn capability_id(&self, vp: Vnode) -> Option<u64> {
        self.state.lock().slot(vp).map(|s| s.capability)
    }

    /// Full state snapshot, `None` for a stale handle.
    pub fn info(&self, vp: Vnode) -> Option<VnodeInfo> {
        self.state.lock().info(vp)
    }

    pub fn is_valid(&self, vp: Vnode) -> bool {
        self.state.lock().slot(vp).is_some()
    }

    /// Count an opener for writing.
    pub fn add_writer(&self, vp: Vnode) {
        self.state.lock().live(vp, "add_writer: stale vnode").writecount += 1;
    }

    pub fn drop_writer(&self, vp: Vnode) {
        let mut st = self.state.lock();
        if st.live(vp, "drop_writer: stale vnode").writecount == 0 {
            fault("drop_writer: writecount", st.info(vp).as_ref());
        }
        st.live(vp, "drop_writer: stale vnode").writecount -= 1;
    }

    // ========================================================================
    // Filesystem private data
    // ========================================================================

    /// Attach filesystem data. Reclaim must take it back.
    pub fn set_private(&self, vp: Vnode, data: Box<dyn Any + Send + Sync>) {
        self.state.lock().live(vp, "set_private: stale vnode").private = Some(data);
    }

    /// Run `f` on the private data if it is a `T`.
    ///
    /// `f` runs inside the critical section and must not call back into the
    /// layer.
    pub fn with_private<T: 'static, R>(&self, vp: Vnode, f: impl FnOnce(&T) -> R) -> Option<R> {
        let st = self.state.lock();
        st.slot(vp)
            .and_then(|s| s.private.as_ref())
            .and_then(|p| p.downcast_ref::<T>())
            .map(f)
    }

    pub fn take_private(&self, vp: Vnode) -> Option<Box<dyn Any + Send + Sync>> {
        self.state.lock().slot_mut(vp).and_then(|s| s.private.take())
    }

    // ========================================================================
    // Revocation subscribers
    // ========================================================================

    /// Deliver a [`crate::VnodeEvent::Revoke`] to `sink` when `vp` is torn down.
    pub fn subscribe(&self, vp: Vnode, sink: Arc<dyn EventSink>) -> VfsResult<()> {
        let mut st = self.state.lock();
        let slot = st.slot_mut(vp).ok_or(VfsError::RetryNotFound)?;
        if slot.flags.contains(VnodeFlags::XLOCK) || slot.vtype == VType::Bad {
            return Err(VfsError::RetryNotFound);
        }
        slot.sinks.push(sink);
        Ok(())
    }

    pub(crate) fn set_buf_flags(&self, bp: BufId, flags: BufFlags) {
        if let Some(b) = self.state.lock().bufs.get_mut(bp.slot()) {
            b.flags.insert(flags);
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
