//! TEAM_442: Operations bound to torn-down vnodes.
//!
//! Anyone still holding a reference after teardown keeps a valid handle but
//! reaches these operations instead of the filesystem's. Transfers fail,
//! lifecycle calls succeed trivially.

use vn_utils::LockFlags;

use crate::error::{VfsError, VfsResult};
use crate::ops::VnodeOps;
use crate::types::{BufFlags, BufId, Vnode};
use crate::vfs::Vfs;

pub struct DeadOps;

impl VnodeOps for DeadOps {
    fn name(&self) -> &'static str {
        "dead"
    }

    fn lock(&self, vfs: &Vfs, vp: Vnode, flags: LockFlags) -> VfsResult<()> {
        vfs.generic_lock(vp, flags)
    }

    fn fsync(&self, _vfs: &Vfs, _vp: Vnode, _wait: bool) -> VfsResult<()> {
        Ok(())
    }

    fn strategy(&self, vfs: &Vfs, bp: BufId) -> VfsResult<()> {
        vfs.set_buf_flags(bp, BufFlags::ERROR);
        vfs.biodone(bp);
        Err(VfsError::IoError)
    }
}
