//! TEAM_453: Mount busy gate, unmount and enumeration.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{MockFs, MockMount, count, logged, mount, new_vnode, small_config, small_vfs, vfs_with};
use vn_vfs::{GateMode, LockFlags, UnmountFlags, VType, VfsError};

// ============================================================================
// Busy gate
// ============================================================================

/// Tests: [MT1] readers share the gate, a writer excludes everyone
#[test]
fn test_gate_modes() {
    let vfs = small_vfs();
    let mp = mount(&vfs, "ufs");

    mp.busy(GateMode::Read, true).unwrap();
    mp.busy(GateMode::Read, true).unwrap();
    assert_eq!(mp.busy(GateMode::Write, false), Err(VfsError::Busy), "[MT1] readers hold it");
    assert!(!mp.is_busy(), "[MT1] no unmount pending");
    mp.unbusy().unwrap();
    mp.unbusy().unwrap();

    mp.busy(GateMode::Write, false).unwrap();
    assert!(mp.is_busy());
    assert_eq!(mp.busy(GateMode::Read, false), Err(VfsError::Busy), "[MT1] writer excludes");
    mp.unbusy().unwrap();
    assert!(!mp.is_busy());
}

/// Tests: [MT2] a reader that waited out an unmount is told the mount is gone
#[test]
fn test_blocked_reader_fails_after_wait() {
    let vfs = small_vfs();
    let mp = mount(&vfs, "ufs");
    mp.busy(GateMode::Write, true).unwrap();

    let reader = {
        let mp = mp.clone();
        thread::spawn(move || mp.busy(GateMode::Read, true))
    };
    thread::sleep(Duration::from_millis(50));
    mp.unbusy().unwrap();

    assert_eq!(reader.join().unwrap(), Err(VfsError::NotFound), "[MT2] must look up again");
    mp.busy(GateMode::Read, true).unwrap();
    mp.unbusy().unwrap();
}

// ============================================================================
// Unmount
// ============================================================================

/// Tests: [MT3] an unmount waits for the filesystem to let go
#[test]
fn test_dounmount_busy_then_done() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let vp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg);

    assert_eq!(vfs.dounmount(&mp, UnmountFlags::empty()), Err(VfsError::Busy));
    assert!(!mp.is_unmounted(), "[MT3] open vnode keeps it mounted");
    assert!(!mp.is_busy(), "[MT3] gate released on failure");
    assert!(vfs.mount_by_id(mp.id()).is_some());

    vfs.vrele(vp).unwrap();
    assert_eq!(vfs.dounmount(&mp, UnmountFlags::empty()), Ok(()));
    assert!(mp.is_unmounted());
    assert!(vfs.mount_by_id(mp.id()).is_none());
    assert_eq!(vfs.vtype(vp), Some(VType::Bad), "[MT3] unused vnode recycled");
    assert_eq!(mp.busy(GateMode::Read, true), Err(VfsError::NotFound));
    assert_eq!(vfs.snapshot(mp.id()), Err(VfsError::NotFound));
}

/// Tests: [MT4] a forced unmount takes open vnodes with it
#[test]
fn test_dounmount_force() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let vp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg);

    assert_eq!(vfs.dounmount(&mp, UnmountFlags::FORCE), Ok(()));
    assert_eq!(vfs.vtype(vp), Some(VType::Bad));
    assert_eq!(vfs.usecount(vp), Some(1), "[MT4] holder keeps a dead vnode");
    assert_eq!(count(&fs.close), 1);
}

/// Tests: [MT5] forced unmount can be switched off
#[test]
fn test_force_unmount_disabled() {
    let vfs = vfs_with(small_config().with_force_unmount(false));
    let mp = mount(&vfs, "ufs");
    assert_eq!(vfs.dounmount(&mp, UnmountFlags::FORCE), Err(VfsError::NotPermitted));
    assert!(!mp.is_unmounted());
}

/// Tests: [MT6] a refusing filesystem fails a plain unmount only
#[test]
fn test_refused_unmount() {
    let vfs = small_vfs();
    let ops = Arc::new(MockMount::default());
    ops.refuse.store(true, Ordering::SeqCst);
    let mp = vfs.mount_alloc("stubborn", None, ops);

    assert_eq!(vfs.dounmount(&mp, UnmountFlags::empty()), Err(VfsError::Busy));
    assert_eq!(vfs.dounmount(&mp, UnmountFlags::FORCE), Ok(()), "[MT6] force wins");
    assert!(logged("refused forced unmount"));
}

/// Tests: [MT7] the covered directory is referenced while mounted on
#[test]
fn test_covered_vnode_referenced() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let dir = new_vnode(&vfs, &fs, None, VType::Dir);
    let mp = vfs.mount_alloc("usr", Some(dir), Arc::new(MockMount::default()));
    assert_eq!(mp.covered(), Some(dir));
    assert_eq!(vfs.usecount(dir), Some(2), "[MT7] mount holds the covered vnode");

    vfs.dounmount(&mp, UnmountFlags::empty()).unwrap();
    assert_eq!(vfs.usecount(dir), Some(1), "[MT7] released at unmount");
}

/// Tests: [MT8] unmount_all goes newest first and empties the table
#[test]
fn test_unmount_all_newest_first() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut vps = Vec::new();
    for name in ["root", "usr", "home"] {
        let ops = Arc::new(MockMount {
            order: Some(order.clone()),
            ..MockMount::default()
        });
        let mp = vfs.mount_alloc(name, None, ops);
        vps.push(new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg));
    }

    assert_eq!(vfs.unmount_all(), Ok(()));
    assert_eq!(*order.lock().unwrap(), vec!["home", "usr", "root"], "[MT8] reverse order");
    assert!(vfs.mount_list().is_empty());
    for vp in vps {
        assert_eq!(vfs.vtype(vp), Some(VType::Bad), "[MT8] no active vnode survives");
    }
}

/// Tests: [MT9] a mount busy elsewhere survives unmount_all
#[test]
fn test_unmount_all_reports_busy() {
    let vfs = small_vfs();
    let keep = mount(&vfs, "busy");
    let _other = mount(&vfs, "idle");
    keep.busy(GateMode::Read, true).unwrap();

    assert_eq!(vfs.unmount_all(), Err(VfsError::Busy));
    let left = vfs.mount_list();
    assert_eq!(left.len(), 1, "[MT9] idle mount went");
    assert_eq!(left[0].id(), keep.id());

    keep.unbusy().unwrap();
    assert_eq!(vfs.unmount_all(), Ok(()));
}

/// Tests: [MT10] shutdown writes everything back before unmounting
#[test]
fn test_shutdown() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let vp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg);
    for blk in 0..3 {
        let bp = vfs.getblk(vp, blk);
        vfs.bdwrite(bp);
    }

    assert_eq!(vfs.shutdown(), Ok(()));
    assert_eq!(count(&fs.writes), 3, "[MT10] delayed writes pushed out");
    assert!(vfs.mount_list().is_empty());
    assert_eq!(vfs.vtype(vp), Some(VType::Bad));
}

// ============================================================================
// Enumeration
// ============================================================================

/// Tests: [MT11] snapshots describe every vnode of a mount
#[test]
fn test_snapshot() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let a = mount(&vfs, "a");
    let b = mount(&vfs, "b");
    let on_a: Vec<_> = (0..40)
        .map(|_| new_vnode(&vfs, &fs, Some(a.id()), VType::Reg))
        .collect();
    let _on_b = new_vnode(&vfs, &fs, Some(b.id()), VType::Dir);

    let snap = vfs.snapshot(a.id()).unwrap();
    assert_eq!(snap.len(), on_a.len(), "[MT11] walk spans several batches");
    assert!(snap.iter().all(|i| i.mount == Some(a.id()) && i.usecount == 1));
    for vp in &on_a {
        assert!(snap.iter().any(|i| i.vnode == *vp));
    }

    let all = vfs.snapshot_all();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].0, b.id());
    assert_eq!(all[1].1[0].vtype, VType::Dir);
}

/// Tests: [MT12] diagnostics list locked vnodes and pool counters
#[test]
fn test_locked_vnodes_and_stats() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let locked = new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg);
    let idle = new_vnode(&vfs, &fs, Some(mp.id()), VType::Reg);
    vfs.vn_lock(locked, LockFlags::EXCLUSIVE).unwrap();
    vfs.vrele(idle).unwrap();
    let bp = vfs.getblk(locked, 0);
    vfs.bdwrite(bp);

    assert_eq!(vfs.print_locked_vnodes(), 1, "[MT12] one locked vnode");

    let stats = vfs.stats();
    assert_eq!(stats.numvnodes, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.buffers, 1);
    assert_eq!(stats.dirty_buffers, 1);
    assert_eq!(stats.sync_queued, 1);
    assert_eq!(stats.dead, 0);

    vfs.vput(locked).unwrap();
}
