//! TEAM_443: Device vnodes.
//!
//! [`SpecOps`] serves device vnodes that belong to no filesystem: the
//! placeholders made by [`Vfs::bdevvp`] and [`Vfs::cdevvp`], and device
//! vnodes stripped from a mount by a forced flush.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use crate::error::VfsResult;
use crate::ops::VnodeOps;
use crate::types::{Dev, VTag, VType, Vnode};
use crate::vfs::Vfs;

pub struct SpecOps;

impl VnodeOps for SpecOps {
    fn name(&self) -> &'static str {
        "spec"
    }

    fn print(&self, vfs: &Vfs, vp: Vnode) -> Option<String> {
        vfs.rdev(vp).map(|d| format!("dev {d}"))
    }
}

impl Vfs {
    /// TEAM_443: Placeholder vnode for a block device.
    ///
    /// Used before any filesystem has the device open, e.g. for the root
    /// device. A filesystem vnode for the same device later takes the
    /// placeholder over in [`Vfs::checkalias`].
    pub fn bdevvp(&self, dev: Dev) -> VfsResult<Vnode> {
        self.getdevvp(dev, VType::Blk)
    }

    /// Placeholder vnode for a character device.
    pub fn cdevvp(&self, dev: Dev) -> VfsResult<Vnode> {
        self.getdevvp(dev, VType::Chr)
    }

    fn getdevvp(&self, dev: Dev, vtype: VType) -> VfsResult<Vnode> {
        let ops: Arc<dyn VnodeOps> = self.spec_ops.clone();
        let nvp = self.getnewvnode(VTag::Non, None, ops)?;
        self.set_type(nvp, vtype);

        match self.checkalias(nvp, dev, None)? {
            Some(vp) => {
                // An existing vnode already names the device
                self.vrele(nvp)?;
                Ok(vp)
            }
            None => Ok(nvp),
        }
    }
}
