//! TEAM_452: Ownership guards for vnode references.
//!
//! [`ActiveVnode`] owns one use count and [`CacheHold`] one hold count;
//! dropping the guard gives it back, so a guard-only caller cannot release
//! a count it never took. [`LockedVnode`] additionally owns the vnode lock
//! and releases both with `vput`.

use core::mem::ManuallyDrop;

use vn_utils::LockFlags;

use crate::error::{VfsError, VfsResult};
use crate::types::Vnode;
use crate::vfs::Vfs;

/// TEAM_452: One active reference, dropped with `vrele`.
#[must_use]
pub struct ActiveVnode<'a> {
    vfs: &'a Vfs,
    vp: Vnode,
}

impl<'a> ActiveVnode<'a> {
    pub fn vnode(&self) -> Vnode {
        self.vp
    }

    /// Lock the vnode. On failure the reference is released.
    pub fn lock(self, flags: LockFlags) -> VfsResult<LockedVnode<'a>> {
        self.vfs.vn_lock(self.vp, flags)?;
        let this = ManuallyDrop::new(self);
        Ok(LockedVnode {
            vfs: this.vfs,
            vp: this.vp,
        })
    }

    /// Give up the guard without releasing the reference.
    pub fn into_raw(self) -> Vnode {
        ManuallyDrop::new(self).vp
    }
}

impl Clone for ActiveVnode<'_> {
    fn clone(&self) -> Self {
        self.vfs.vref(self.vp);
        Self {
            vfs: self.vfs,
            vp: self.vp,
        }
    }
}

impl Drop for ActiveVnode<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vfs.vrele(self.vp) {
            log::warn!("[VFS] release of {} failed: {}", self.vp, e);
        }
    }
}

/// TEAM_452: An active reference plus the vnode lock, dropped with `vput`.
#[must_use]
pub struct LockedVnode<'a> {
    vfs: &'a Vfs,
    vp: Vnode,
}

impl<'a> LockedVnode<'a> {
    pub fn vnode(&self) -> Vnode {
        self.vp
    }

    /// Drop the lock and keep the reference.
    pub fn unlock(self) -> ActiveVnode<'a> {
        let this = ManuallyDrop::new(self);
        if let Err(e) = this.vfs.vn_unlock(this.vp) {
            log::warn!("[VFS] unlock of {} failed: {}", this.vp, e);
        }
        ActiveVnode {
            vfs: this.vfs,
            vp: this.vp,
        }
    }
}

impl Drop for LockedVnode<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vfs.vput(self.vp) {
            log::warn!("[VFS] put of {} failed: {}", self.vp, e);
        }
    }
}

/// TEAM_452: One hold count, dropped with `vunhold`.
#[must_use]
pub struct CacheHold<'a> {
    vfs: &'a Vfs,
    vp: Vnode,
}

impl CacheHold<'_> {
    pub fn vnode(&self) -> Vnode {
        self.vp
    }
}

impl Drop for CacheHold<'_> {
    fn drop(&mut self) {
        self.vfs.vunhold(self.vp);
    }
}

impl Vfs {
    /// Take a reference as a guard. See [`Vfs::vget`].
    pub fn activate(&self, vp: Vnode) -> VfsResult<ActiveVnode<'_>> {
        self.vget(vp, LockFlags::empty())?;
        Ok(ActiveVnode { vfs: self, vp })
    }

    /// Take a reference and the lock as a guard.
    pub fn activate_locked(&self, vp: Vnode, flags: LockFlags) -> VfsResult<LockedVnode<'_>> {
        if !flags.intersects(LockFlags::SHARED | LockFlags::EXCLUSIVE) {
            return Err(VfsError::InvalidArgument);
        }
        self.vget(vp, flags)?;
        Ok(LockedVnode { vfs: self, vp })
    }

    /// Wrap a reference the caller already owns, such as the one
    /// [`Vfs::getnewvnode`] returns.
    pub fn adopt(&self, vp: Vnode) -> ActiveVnode<'_> {
        ActiveVnode { vfs: self, vp }
    }

    pub fn hold(&self, vp: Vnode) -> CacheHold<'_> {
        self.vhold(vp);
        CacheHold { vfs: self, vp }
    }
}
