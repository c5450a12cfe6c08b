//! TEAM_447: Diagnostics and fatal invariant violations.

use alloc::vec::Vec;
use core::fmt;

use crate::state::VnodeSlot;
use crate::types::{Dev, MountId, RecycleList, VTag, VType, Vnode, VnodeFlags};
use crate::vfs::Vfs;

/// TEAM_447: Point-in-time copy of a vnode's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VnodeInfo {
    pub vnode: Vnode,
    pub vtype: VType,
    pub tag: VTag,
    pub usecount: u32,
    pub writecount: u32,
    pub holdcnt: u32,
    pub numoutput: u32,
    pub flags: VnodeFlags,
    pub io_wait: bool,
    pub recycle_list: Option<RecycleList>,
    /// Ticks until the delayed-write wheel reaches the vnode
    pub sync_in: Option<usize>,
    pub mount: Option<MountId>,
    pub rdev: Option<Dev>,
    pub clean_buffers: usize,
    pub dirty_buffers: usize,
    pub ops: &'static str,
}

impl VnodeInfo {
    pub(crate) fn capture(vp: Vnode, s: &VnodeSlot, sync_in: Option<usize>) -> Self {
        Self {
            vnode: vp,
            vtype: s.vtype,
            tag: s.tag,
            usecount: s.usecount,
            writecount: s.writecount,
            holdcnt: s.holdcnt,
            numoutput: s.numoutput,
            flags: s.flags,
            io_wait: s.io_wait,
            recycle_list: s.recycle_list,
            sync_in,
            mount: s.mount,
            rdev: s.rdev(),
            clean_buffers: s.clean.len(),
            dirty_buffers: s.dirty.len(),
            ops: s.ops.name(),
        }
    }
}

impl fmt::Display for VnodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} type {}, usecount {}, writecount {}, holdcount {}, ops {}",
            self.vnode,
            self.vtype.name(),
            self.usecount,
            self.writecount,
            self.holdcnt,
            self.ops
        )?;

        let mut names: Vec<&str> = Vec::new();
        for (flag, name) in [
            (VnodeFlags::ROOT, "VROOT"),
            (VnodeFlags::TEXT, "VTEXT"),
            (VnodeFlags::SYSTEM, "VSYSTEM"),
            (VnodeFlags::XLOCK, "VXLOCK"),
            (VnodeFlags::XWANT, "VXWANT"),
            (VnodeFlags::ALIASED, "VALIASED"),
        ] {
            if self.flags.contains(flag) {
                names.push(name);
            }
        }
        if self.io_wait {
            names.push("VBIOWAIT");
        }
        if self.recycle_list.is_some() {
            names.push("VBIOONFREELIST");
        }
        if self.sync_in.is_some() {
            names.push("VBIOONSYNCLIST");
        }
        if !names.is_empty() {
            write!(f, "\n\tflags ({})", names.join("|"))?;
        }
        Ok(())
    }
}

/// TEAM_447: Counters across the whole pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VnodeStats {
    pub numvnodes: usize,
    pub desired: usize,
    pub active: usize,
    pub free: usize,
    pub hold: usize,
    pub dead: usize,
    pub buffers: usize,
    pub dirty_buffers: usize,
    pub sync_queued: usize,
}

/// Report a broken invariant and stop.
#[cold]
#[track_caller]
#[allow(clippy::panic)]
pub(crate) fn fault(label: &str, info: Option<&VnodeInfo>) -> ! {
    match info {
        Some(info) => {
            log::error!("[VFS] {}: {}", label, info);
            panic!("{label}: {info}");
        }
        None => {
            log::error!("[VFS] {}", label);
            panic!("{label}");
        }
    }
}

impl Vfs {
    /// Log a vnode's state under `label`.
    pub fn vprint(&self, label: &str, vp: Vnode) {
        let Some(info) = self.info(vp) else {
            log::info!("{}: stale {}", label, vp);
            return;
        };
        let extra = self.ops_of(vp).and_then(|ops| ops.print(self, vp));
        match extra {
            Some(extra) => log::info!("{}: {}\n\t{}", label, info, extra),
            None => log::info!("{}: {}", label, info),
        }
    }

    /// Log every vnode whose lock is held, grouped by mount.
    pub fn print_locked_vnodes(&self) -> usize {
        let mut found = 0;
        log::info!("Locked vnodes");
        for mp in self.mount_list() {
            let Some((list, _)) = self.state.lock().mount_vnodes(mp.id()) else {
                continue;
            };
            for vp in list {
                if self.is_locked(vp) {
                    self.vprint("", vp);
                    found += 1;
                }
            }
        }
        found
    }

    pub fn stats(&self) -> VnodeStats {
        let st = self.state.lock();
        let mut stats = VnodeStats {
            numvnodes: st.slots.len(),
            desired: st.desired,
            free: st.free.len(),
            hold: st.hold.len(),
            sync_queued: st.syncer.len(),
            ..VnodeStats::default()
        };
        for s in &st.slots {
            if s.usecount > 0 {
                stats.active += 1;
            }
            if s.vtype == VType::Bad {
                stats.dead += 1;
            }
            stats.dirty_buffers += s.dirty.len();
        }
        stats.buffers = st.bufs.len() - st.free_bufs.len();
        stats
    }
}
