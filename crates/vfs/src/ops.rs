//! TEAM_441: Filesystem capability traits.
//!
//! A filesystem binds a [`VnodeOps`] to each vnode it creates and a
//! [`MountOps`] to each mount. The layer calls these without holding its
//! critical section, so implementations may call back into [`Vfs`].

use alloc::string::String;
use alloc::sync::Arc;

use vn_utils::LockFlags;

use crate::error::{VfsError, VfsResult};
use crate::mount::Mount;
use crate::types::{BufId, CloseFlags, FlushFlags, UnmountFlags, Vnode, VnodeEvent};
use crate::vfs::Vfs;

/// TEAM_441: Vnode Operations Trait
///
/// Every method has a default, so a filesystem overrides only what it
/// handles. The defaults use the per-vnode lock kept by the layer.
pub trait VnodeOps: Send + Sync {
    /// Short name shown in diagnostics
    fn name(&self) -> &'static str {
        "generic"
    }

    /// Last reference dropped. Called with the vnode locked; must unlock it.
    fn inactive(&self, vfs: &Vfs, vp: Vnode) -> VfsResult<()> {
        vfs.generic_unlock(vp)
    }

    /// Release filesystem resources before the vnode changes identity.
    ///
    /// Must leave no private data behind.
    fn reclaim(&self, vfs: &Vfs, vp: Vnode) -> VfsResult<()> {
        let _ = vfs.take_private(vp);
        Ok(())
    }

    fn lock(&self, vfs: &Vfs, vp: Vnode, flags: LockFlags) -> VfsResult<()> {
        vfs.generic_lock(vp, flags)
    }

    fn unlock(&self, vfs: &Vfs, vp: Vnode) -> VfsResult<()> {
        vfs.generic_unlock(vp)
    }

    fn is_locked(&self, vfs: &Vfs, vp: Vnode) -> bool {
        vfs.generic_is_locked(vp)
    }

    /// Close an open vnode being torn down underneath its users
    fn close(&self, _vfs: &Vfs, _vp: Vnode, _flags: CloseFlags) -> VfsResult<()> {
        Ok(())
    }

    /// Write back dirty buffers, waiting for completion if `wait`
    fn fsync(&self, vfs: &Vfs, vp: Vnode, wait: bool) -> VfsResult<()> {
        vfs.vflushbuf(vp, wait);
        Ok(())
    }

    /// Start a transfer. The transfer must end in [`Vfs::biodone`], on
    /// failure too.
    fn strategy(&self, vfs: &Vfs, bp: BufId) -> VfsResult<()> {
        vfs.biodone(bp);
        Ok(())
    }

    /// Drop page mappings of the vnode before teardown
    fn discard_mappings(&self, _vfs: &Vfs, _vp: Vnode) {}

    /// Extra filesystem detail for diagnostics
    fn print(&self, _vfs: &Vfs, _vp: Vnode) -> Option<String> {
        None
    }
}

/// TEAM_441: Mount Operations Trait
pub trait MountOps: Send + Sync {
    fn fs_type(&self) -> &'static str;

    /// Write back everything dirty on the mount.
    fn sync(&self, vfs: &Vfs, mp: &Arc<Mount>, wait: bool) -> VfsResult<()> {
        vfs.sync_mount_vnodes(mp, wait);
        Ok(())
    }

    /// Release the mount's vnodes. Refusal fails a non-forced unmount.
    fn unmount(&self, vfs: &Vfs, mp: &Arc<Mount>, flags: UnmountFlags) -> VfsResult<()> {
        let flush = if flags.contains(UnmountFlags::FORCE) {
            FlushFlags::FORCECLOSE
        } else {
            FlushFlags::empty()
        };
        if vfs.vflush(mp, None, flush) > 0 {
            return Err(VfsError::Busy);
        }
        Ok(())
    }
}

/// Receives revocation notices for a vnode.
pub trait EventSink: Send + Sync {
    fn notify(&self, vp: Vnode, event: VnodeEvent);
}
