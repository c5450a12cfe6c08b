#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! TEAM_437: Vnode lifecycle and buffer binding.
//!
//! The layer between filesystems and the buffer cache: it hands out pooled
//! vnodes, counts their users and cached buffers, folds device aliases into
//! one vnode per device, tears vnodes down safely under concurrent use, and
//! schedules delayed writes.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |   Filesystems    |  VnodeOps / MountOps
//! +------------------+
//!          |
//!          v
//! +------------------+      +------------------+
//! |   Vnode pool     |----->|  Alias registry  |  device number -> vnode
//! | getnewvnode      |      +------------------+
//! +------------------+
//!          |
//!          v
//! +------------------+      +------------------+
//! | Reference counts |<---->|  Teardown        |  vclean / vgone / vflush
//! | free & hold list |      +------------------+
//! +------------------+
//!          |
//!          v
//! +------------------+      +------------------+
//! | Buffer binding   |----->|  Syncer wheel    |  delayed writes
//! +------------------+      +------------------+
//! ```
//!
//! All shared state sits behind one interrupt-masking lock inside [`Vfs`].
//! Broken invariants are fatal: they log the vnode and panic.

extern crate alloc;

/// Trace output for hot paths, compiled in with the `verbose` feature.
macro_rules! vtrace {
    ($($arg:tt)*) => {
        if cfg!(feature = "verbose") {
            log::trace!($($arg)*);
        }
    };
}
pub(crate) use vtrace;

mod alias;
pub mod buf;
pub mod config;
mod dead;
pub mod diag;
pub mod error;
pub mod guard;
mod list;
pub mod mount;
pub mod ops;
mod pool;
mod refcount;
mod spec;
mod state;
mod syncer;
mod teardown;
pub mod types;
mod vfs;

pub use buf::BufInfo;
pub use config::VfsConfig;
pub use dead::DeadOps;
pub use diag::{VnodeInfo, VnodeStats};
pub use error::{VfsError, VfsResult};
pub use guard::{ActiveVnode, CacheHold, LockedVnode};
pub use mount::Mount;
pub use ops::{EventSink, MountOps, VnodeOps};
pub use spec::SpecOps;
pub use types::{
    BufFlags, BufId, BufQueue, CleanFlags, CloseFlags, Dev, FlushFlags, GateMode, InvalFlags,
    MountId, RecycleList, UnmountFlags, VTag, VType, Vnode, VnodeEvent, VnodeFlags,
};
pub use vfs::Vfs;
pub use vn_utils::LockFlags;

use vn_utils::Once;

static VFS: Once<Vfs> = Once::new();

/// TEAM_437: Bring up the system-wide vnode layer.
///
/// Later calls return the instance made by the first; their configuration
/// is ignored.
pub fn init(config: VfsConfig) -> VfsResult<&'static Vfs> {
    if let Some(vfs) = VFS.get() {
        return Ok(vfs);
    }
    config.validate()?;
    Ok(VFS.call_once(|| Vfs::build(config)))
}

/// The system-wide vnode layer, once [`init`] has run.
pub fn vfs() -> Option<&'static Vfs> {
    VFS.get()
}
