//! TEAM_451: Mounts and the mount table.
//!
//! Each mount carries a busy gate: ordinary operations hold it shared,
//! unmount holds it exclusive. The gate's lock is created on first use.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use vn_utils::{LockError, LockFlags, LockMgr, LockStatus, Once};

use crate::diag::VnodeInfo;
use crate::error::{VfsError, VfsResult};
use crate::ops::MountOps;
use crate::state::MountVnodes;
use crate::types::{FlushFlags, GateMode, MountId, UnmountFlags, Vnode};
use crate::vfs::Vfs;

/// Vnodes described per critical section during a snapshot walk.
const SNAPSHOT_BATCH: usize = 32;

/// TEAM_451: A mounted filesystem.
pub struct Mount {
    id: MountId,
    name: String,
    /// Directory the mount sits on, referenced while mounted
    covered: Option<Vnode>,
    ops: Arc<dyn MountOps>,
    gate: Once<LockMgr>,
    unmounted: AtomicBool,
}

impl Mount {
    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn covered(&self) -> Option<Vnode> {
        self.covered
    }

    pub fn fs_type(&self) -> &'static str {
        self.ops.fs_type()
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    fn gate(&self) -> &LockMgr {
        self.gate.call_once(|| LockMgr::new("vfslock"))
    }

    /// TEAM_451: Enter the mount.
    ///
    /// `Read` admits any number of holders, `Write` one. Without
    /// `may_block` a request that would wait fails `Busy`. A blocking read
    /// that had to wait for an unmount fails `NotFound`, since the mount
    /// may be gone by the time it wakes.
    pub fn busy(&self, mode: GateMode, may_block: bool) -> VfsResult<()> {
        if self.is_unmounted() {
            return Err(VfsError::NotFound);
        }
        let mut flags = match mode {
            GateMode::Read => LockFlags::SHARED,
            GateMode::Write => LockFlags::EXCLUSIVE,
        };
        if !may_block {
            flags |= LockFlags::NOWAIT;
        } else if mode == GateMode::Read {
            flags |= LockFlags::SLEEPFAIL;
        }

        match self.gate().lock(flags) {
            Ok(()) => {}
            Err(LockError::SleepFail) => return Err(VfsError::NotFound),
            Err(e) => return Err(e.into()),
        }
        if self.is_unmounted() {
            let _ = self.gate().unlock();
            return Err(VfsError::NotFound);
        }
        Ok(())
    }

    pub fn unbusy(&self) -> VfsResult<()> {
        self.gate().unlock().map_err(VfsError::from)
    }

    /// Whether an unmount holds the gate or waits for it.
    pub fn is_busy(&self) -> bool {
        self.gate
            .get()
            .is_some_and(|g| g.status() == LockStatus::Exclusive || g.has_exclusive_waiters())
    }
}

impl core::fmt::Debug for Mount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fs_type", &self.fs_type())
            .field("unmounted", &self.is_unmounted())
            .finish_non_exhaustive()
    }
}

impl Vfs {
    /// TEAM_451: Register a new mount.
    ///
    /// `covered` must be held active by the caller; the mount keeps its own
    /// reference until it is unmounted.
    pub fn mount_alloc(
        &self,
        name: &str,
        covered: Option<Vnode>,
        ops: Arc<dyn MountOps>,
    ) -> Arc<Mount> {
        if let Some(vp) = covered {
            self.vref(vp);
        }
        let mp = Arc::new(Mount {
            id: MountId::next(),
            name: String::from(name),
            covered,
            ops,
            gate: Once::new(),
            unmounted: AtomicBool::new(false),
        });
        self.state.lock().mounts.insert(mp.id, MountVnodes::default());
        self.mounts.write().push(mp.clone());
        log::info!("[MOUNT] {} mounted as {} ({})", mp.name, mp.id, mp.fs_type());
        mp
    }

    pub fn mount_by_id(&self, id: MountId) -> Option<Arc<Mount>> {
        self.mounts.read().iter().find(|m| m.id == id).cloned()
    }

    /// Mounts in the order they were made.
    pub fn mount_list(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().clone()
    }

    /// TEAM_451: Unmount a filesystem.
    ///
    /// Waits for the busy gate. A non-forced unmount syncs first and fails
    /// `Busy` if the filesystem cannot release every vnode. Forced unmounts
    /// must be enabled in the configuration.
    pub fn dounmount(&self, mp: &Arc<Mount>, flags: UnmountFlags) -> VfsResult<()> {
        if flags.contains(UnmountFlags::FORCE) && !self.config.force_unmount {
            return Err(VfsError::NotPermitted);
        }
        mp.busy(GateMode::Write, true)?;
        self.unmount_busied(mp, flags)
    }

    /// Unmount with the gate held for write. The gate is released.
    fn unmount_busied(&self, mp: &Arc<Mount>, flags: UnmountFlags) -> VfsResult<()> {
        let force = flags.contains(UnmountFlags::FORCE);
        if !force && let Err(e) = mp.ops.sync(self, mp, true) {
            log::warn!("[MOUNT] sync of {} before unmount failed: {}", mp.name, e);
        }

        if let Err(e) = mp.ops.unmount(self, mp, flags) {
            if !force {
                let _ = mp.unbusy();
                return Err(e);
            }
            log::warn!("[MOUNT] {} refused forced unmount: {}", mp.name, e);
        }

        let left = self
            .state
            .lock()
            .mount_vnodes(mp.id)
            .map_or(0, |(list, _)| list.len());
        if left > 0 {
            if !force {
                let _ = mp.unbusy();
                return Err(VfsError::Busy);
            }
            let busy = self.vflush(mp, None, FlushFlags::FORCECLOSE);
            if busy > 0 {
                log::warn!("[MOUNT] {} still has {} vnodes", mp.name, busy);
            }
        }

        mp.unmounted.store(true, Ordering::Release);
        self.state.lock().mounts.remove(&mp.id);
        self.mounts.write().retain(|m| m.id != mp.id);
        let _ = mp.unbusy();
        if let Some(vp) = mp.covered
            && let Err(e) = self.vrele(vp)
        {
            log::warn!("[MOUNT] release of covered {} failed: {}", vp, e);
        }
        log::info!("[MOUNT] {} unmounted", mp.name);
        Ok(())
    }

    /// Force-unmount a mount whose backing device has been torn down.
    /// Skipped while an unmount of it is already under way.
    pub(crate) fn doom_mount(&self, id: MountId) {
        let Some(mp) = self.mount_by_id(id) else {
            return;
        };
        if mp.busy(GateMode::Write, false).is_err() {
            log::debug!("[MOUNT] {} already unmounting", mp.name);
            return;
        }
        log::warn!("[MOUNT] device backing {} revoked, unmounting", mp.name);
        if let Err(e) = self.unmount_busied(&mp, UnmountFlags::FORCE) {
            log::warn!("[MOUNT] forced unmount of {} failed: {}", mp.name, e);
        }
    }

    /// TEAM_451: Force-unmount every mount, newest first.
    ///
    /// Mounts busy elsewhere are skipped. Makes a second pass if anything
    /// failed, and reports `Busy` if mounts remain after it.
    pub fn unmount_all(&self) -> VfsResult<()> {
        for pass in 0..2 {
            let mut failed = false;
            for mp in self.mount_list().into_iter().rev() {
                if mp.busy(GateMode::Write, false).is_err() {
                    continue;
                }
                if let Err(e) = self.unmount_busied(&mp, UnmountFlags::FORCE) {
                    log::warn!("[MOUNT] unmount of {} failed: {}", mp.name, e);
                    failed = true;
                }
            }
            if !failed && self.mounts.read().is_empty() {
                return Ok(());
            }
            log::warn!("[MOUNT] some file systems would not unmount (pass {})", pass + 1);
        }
        Err(VfsError::Busy)
    }

    /// TEAM_451: Sync, drain delayed writes and unmount everything.
    pub fn shutdown(&self) -> VfsResult<()> {
        log::info!("[VFS] syncing disks...");
        for mp in self.mount_list() {
            if let Err(e) = mp.ops.sync(self, &mp, false) {
                log::warn!("[MOUNT] sync of {} failed: {}", mp.name, e);
            }
        }
        let pending = self.syncwait();
        self.unmount_all()?;
        if pending > 0 {
            return Err(VfsError::Busy);
        }
        Ok(())
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    /// TEAM_451: Describe every vnode on a mount.
    ///
    /// The walk copies a few vnodes per critical section and starts over
    /// if the mount's vnode list changes in between, so the result is one
    /// consistent view.
    pub fn snapshot(&self, id: MountId) -> VfsResult<Vec<VnodeInfo>> {
        'restart: loop {
            let (list, generation) = self
                .state
                .lock()
                .mount_vnodes(id)
                .ok_or(VfsError::NotFound)?;
            let mut out = Vec::with_capacity(list.len());
            for chunk in list.chunks(SNAPSHOT_BATCH) {
                let st = self.state.lock();
                if st.mounts.get(&id).is_none_or(|mv| mv.generation != generation) {
                    crate::vtrace!("[VFS] snapshot of {} restarting", id);
                    continue 'restart;
                }
                out.extend(chunk.iter().filter_map(|&vp| st.info(vp)));
            }
            return Ok(out);
        }
    }

    /// Snapshots of every mount.
    pub fn snapshot_all(&self) -> Vec<(MountId, Vec<VnodeInfo>)> {
        self.mount_list()
            .iter()
            .filter_map(|mp| self.snapshot(mp.id).ok().map(|list| (mp.id, list)))
            .collect()
    }
}
