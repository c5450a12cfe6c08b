//! TEAM_448: Device alias registry.
//!
//! Block and character vnodes are hashed by device number so that every
//! path to a device reaches one canonical vnode. Scans collect what they
//! need under the critical section and act on it afterwards, restarting
//! whenever the action may have changed the chain.

use alloc::vec::Vec;

use vn_utils::LockFlags;

use crate::diag::fault;
use crate::error::{VfsError, VfsResult};
use crate::state::SpecInfo;
use crate::types::{Dev, MountId, VTag, VType, Vnode, VnodeFlags};
use crate::vfs::Vfs;

/// Outcome of one pass over an alias chain.
enum Scan {
    /// Unused alias to tear down before looking further
    Stale(Vnode),
    /// Active alias to adopt
    Active(Vnode),
    Empty,
}

impl Vfs {
    /// TEAM_448: Resolve a new device vnode against the alias registry.
    ///
    /// Returns `None` when `nvp` becomes the canonical vnode for `rdev`; it
    /// is then in the registry. Returns `Some(vp)` when an active vnode
    /// already names the device: `vp` carries a new reference for the
    /// caller, unlocked, and the caller must release `nvp`.
    ///
    /// A placeholder made by [`Vfs::bdevvp`] or [`Vfs::cdevvp`] is converted
    /// instead, for block and character devices alike: it is cleaned, takes
    /// over `nvp`'s operations and tag, moves to `mp`, and is returned;
    /// `nvp` is left typeless for release.
    pub fn checkalias(&self, nvp: Vnode, rdev: Dev, mp: Option<MountId>) -> VfsResult<Option<Vnode>> {
        let vtype = self.vtype(nvp).ok_or(VfsError::RetryNotFound)?;
        if !vtype.is_device() {
            return Ok(None);
        }

        let vp = loop {
            match self.scan_chain(nvp, rdev, vtype) {
                Scan::Stale(vp) => {
                    let _ = self.vrecycle(vp);
                }
                Scan::Active(vp) => match self.vget(vp, LockFlags::EXCLUSIVE | LockFlags::NOWAIT) {
                    Ok(()) => break vp,
                    Err(VfsError::Busy) => {
                        // Blocking may let the chain change; only keep the
                        // vnode if it still names the device afterwards
                        if self.vget(vp, LockFlags::EXCLUSIVE).is_ok() {
                            if self.names_device(vp, rdev, vtype) {
                                break vp;
                            }
                            let _ = self.vput(vp);
                        }
                    }
                    Err(_) => {}
                },
                Scan::Empty => {
                    if self.insert_alias(nvp, rdev, vtype) {
                        return Ok(None);
                    }
                }
            }
        };

        let placeholder = {
            let st = self.state.lock();
            st.slot(vp)
                .is_some_and(|s| s.tag == VTag::Non && s.vtype.is_device())
        };
        if !placeholder {
            self.vn_unlock(vp)?;
            log::debug!("[VFS] {} resolved to existing alias {} for dev {}", nvp, vp, rdev);
            return Ok(Some(vp));
        }

        self.vn_unlock(vp)?;
        self.vclean(vp, crate::types::CleanFlags::empty());
        {
            let mut st = self.state.lock();
            let (ops, tag) = {
                let n = st.live(nvp, "checkalias: stale new vnode");
                n.vtype = VType::Non;
                (n.ops.clone(), n.tag)
            };
            let slot = st.live(vp, "checkalias: stale alias");
            slot.ops = ops;
            slot.tag = tag;
            st.insmntque_locked(vp.index, mp);
        }
        log::debug!("[VFS] converted placeholder {} for dev {}", vp, rdev);
        Ok(Some(vp))
    }

    fn scan_chain(&self, nvp: Vnode, rdev: Dev, vtype: VType) -> Scan {
        let st = self.state.lock();
        let bucket = st.spechash(rdev);
        for &vp in &st.spechash[bucket] {
            if vp == nvp {
                continue;
            }
            let Some(s) = st.slot(vp) else { continue };
            if s.rdev() != Some(rdev)
                || s.vtype != vtype
                || s.flags.contains(VnodeFlags::RECYCLE)
            {
                continue;
            }
            return if s.usecount == 0 {
                Scan::Stale(vp)
            } else {
                Scan::Active(vp)
            };
        }
        Scan::Empty
    }

    fn names_device(&self, vp: Vnode, rdev: Dev, vtype: VType) -> bool {
        let st = self.state.lock();
        st.slot(vp)
            .is_some_and(|s| s.vtype == vtype && s.rdev() == Some(rdev))
    }

    /// Register `nvp` as the canonical vnode for `rdev`. `false` when a
    /// vnode of the same type joined the chain since it was scanned.
    fn insert_alias(&self, nvp: Vnode, rdev: Dev, vtype: VType) -> bool {
        let mut st = self.state.lock();
        let bucket = st.spechash(rdev);
        let raced = st.spechash[bucket].iter().any(|&v| {
            v != nvp
                && st
                    .slot(v)
                    .is_some_and(|s| {
                        s.rdev() == Some(rdev)
                            && s.vtype == vtype
                            && !s.flags.contains(VnodeFlags::RECYCLE)
                    })
        });
        if raced {
            return false;
        }
        let others: Vec<Vnode> = st.spechash[bucket]
            .iter()
            .copied()
            .filter(|&v| v != nvp && st.slot(v).is_some_and(|s| s.rdev() == Some(rdev)))
            .collect();

        let slot = st.live(nvp, "checkalias: stale new vnode");
        if slot.spec.is_some() {
            fault("checkalias: vnode already registered", None);
        }
        slot.spec = Some(SpecInfo {
            rdev,
            mountpoint: None,
        });
        if !others.is_empty() {
            slot.flags.insert(VnodeFlags::ALIASED);
            for v in others {
                if let Some(s) = st.slot_mut(v) {
                    s.flags.insert(VnodeFlags::ALIASED);
                }
            }
            log::debug!("[VFS] dev {} now aliased ({})", rdev, vtype.name());
        }
        st.spechash[bucket].push_front(nvp);
        true
    }

    /// TEAM_448: Active references to the device behind `vp`.
    ///
    /// Sums use counts over every vnode of the same device and type,
    /// tearing down unused ones met on the way.
    pub fn vcount(&self, vp: Vnode) -> u32 {
        loop {
            let (stale, count) = {
                let st = self.state.lock();
                let Some(s) = st.slot(vp) else { return 0 };
                if !s.flags.contains(VnodeFlags::ALIASED) {
                    return s.usecount;
                }
                let Some(rdev) = s.rdev() else {
                    return s.usecount;
                };
                let vtype = s.vtype;
                let bucket = st.spechash(rdev);
                let mut count = 0;
                let mut stale = None;
                for &vq in &st.spechash[bucket] {
                    let Some(q) = st.slot(vq) else { continue };
                    if q.rdev() != Some(rdev) || q.vtype != vtype {
                        continue;
                    }
                    if q.usecount == 0 && vq != vp && !q.flags.contains(VnodeFlags::RECYCLE) {
                        stale = Some(vq);
                        break;
                    }
                    count += q.usecount;
                }
                (stale, count)
            };
            match stale {
                Some(vq) => {
                    let _ = self.vrecycle(vq);
                }
                None => return count,
            }
        }
    }

    /// Vnode registered for `dev` with the given type.
    pub fn vfinddev(&self, dev: Dev, vtype: VType) -> Option<Vnode> {
        let st = self.state.lock();
        let bucket = st.spechash(dev);
        st.spechash[bucket].iter().copied().find(|&vp| {
            st.slot(vp)
                .is_some_and(|s| s.rdev() == Some(dev) && s.vtype == vtype)
        })
    }

    /// `Busy` if the device behind `vp`, or any alias of it, backs a mount.
    pub fn vfs_mountedon(&self, vp: Vnode) -> VfsResult<()> {
        let st = self.state.lock();
        let s = st.slot(vp).ok_or(VfsError::RetryNotFound)?;
        let Some(spec) = s.spec.as_ref() else {
            return Ok(());
        };
        if spec.mountpoint.is_some() {
            return Err(VfsError::Busy);
        }
        if s.flags.contains(VnodeFlags::ALIASED) {
            let (rdev, vtype) = (spec.rdev, s.vtype);
            let bucket = st.spechash(rdev);
            let mounted = st.spechash[bucket].iter().any(|&vq| {
                st.slot(vq).is_some_and(|q| {
                    q.vtype == vtype
                        && q.spec
                            .as_ref()
                            .is_some_and(|p| p.rdev == rdev && p.mountpoint.is_some())
                })
            });
            if mounted {
                return Err(VfsError::Busy);
            }
        }
        Ok(())
    }

    /// Record that the block device behind `vp` backs `mp`.
    pub fn set_spec_mountpoint(&self, vp: Vnode, mp: Option<MountId>) -> VfsResult<()> {
        let mut st = self.state.lock();
        let s = st.slot_mut(vp).ok_or(VfsError::RetryNotFound)?;
        let spec = s.spec.as_mut().ok_or(VfsError::InvalidArgument)?;
        spec.mountpoint = mp;
        Ok(())
    }

    /// TEAM_448: Revoke a vnode, and with `all` every alias of its device.
    pub fn revoke(&self, vp: Vnode, all: bool) -> VfsResult<()> {
        if all {
            loop {
                let alias = {
                    let st = self.state.lock();
                    let s = st.slot(vp).ok_or(VfsError::RetryNotFound)?;
                    match (s.flags.contains(VnodeFlags::ALIASED), s.rdev()) {
                        (true, Some(rdev)) => {
                            let vtype = s.vtype;
                            let bucket = st.spechash(rdev);
                            st.spechash[bucket].iter().copied().find(|&vq| {
                                vq != vp
                                    && st
                                        .slot(vq)
                                        .is_some_and(|q| q.rdev() == Some(rdev) && q.vtype == vtype)
                            })
                        }
                        _ => None,
                    }
                };
                let Some(vq) = alias else { break };
                if let Err(e) = self.vgone(vq)
                    && e != VfsError::RetryNotFound
                {
                    return Err(e);
                }
            }
        }
        self.vgone(vp)
    }

    /// TEAM_448: Revoke every vnode for minors `[minor_lo, minor_hi)` of a
    /// device major.
    pub fn vdevgone(&self, major: u32, minor_lo: u32, minor_hi: u32, vtype: VType) {
        for minor in minor_lo..minor_hi {
            if let Some(vp) = self.vfinddev(Dev::new(major, minor), vtype)
                && let Err(e) = self.revoke(vp, true)
            {
                log::warn!("[VFS] vdevgone: revoke of {} failed: {}", vp, e);
            }
        }
    }
}
