//! TEAM_453: Device alias registry.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;

use common::{MockFs, count, mount, new_vnode, small_vfs, vfs_with};
use vn_vfs::{Dev, EventSink, VTag, VType, VfsConfig, VfsError, Vnode, VnodeEvent, VnodeFlags};

#[derive(Default)]
struct Recorder(Mutex<Vec<(Vnode, VnodeEvent)>>);

impl EventSink for Recorder {
    fn notify(&self, vp: Vnode, event: VnodeEvent) {
        self.0.lock().unwrap().push((vp, event));
    }
}

/// Tests: [AL1] three vnodes for one device resolve to the first
#[test]
fn test_three_paths_one_device() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let dev = Dev::new(3, 1);

    let v1 = new_vnode(&vfs, &fs, Some(mp.id()), VType::Blk);
    assert_eq!(vfs.checkalias(v1, dev, Some(mp.id())), Ok(None), "[AL1] first is canonical");

    for _ in 0..2 {
        let nvp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Blk);
        assert_eq!(
            vfs.checkalias(nvp, dev, Some(mp.id())),
            Ok(Some(v1)),
            "[AL1] later paths reach the canonical vnode"
        );
        assert!(!vfs.is_locked(v1), "[AL1] returned unlocked");
        vfs.vrele(nvp).unwrap();
    }

    assert_eq!(vfs.vcount(v1), 3, "[AL1] every path's reference counted");
    assert_eq!(vfs.vfinddev(dev, VType::Blk), Some(v1));
    assert_eq!(vfs.rdev(v1), Some(dev));
}

/// Tests: [AL2] racing candidates agree on one canonical vnode
#[test]
fn test_concurrent_candidates_agree() {
    let vfs = Arc::new(vfs_with(VfsConfig::new()));
    let fs = MockFs::new();
    let dev = Dev::new(8, 0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let vfs = vfs.clone();
            let fs = fs.clone();
            thread::spawn(move || {
                let nvp = new_vnode(&vfs, &fs, None, VType::Chr);
                match vfs.checkalias(nvp, dev, None).unwrap() {
                    Some(vp) => {
                        vfs.vrele(nvp).unwrap();
                        vp
                    }
                    None => nvp,
                }
            })
        })
        .collect();
    let found: Vec<Vnode> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(found.iter().all(|&vp| vp == found[0]), "[AL2] one canonical vnode");
    assert_eq!(vfs.vfinddev(dev, VType::Chr), Some(found[0]));
    assert_eq!(vfs.vcount(found[0]), 8);
}

/// Tests: [AL3] a filesystem vnode takes over the placeholder
#[test]
fn test_placeholder_converted() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let dev = Dev::new(3, 0);

    let p = vfs.bdevvp(dev).unwrap();
    let info = vfs.info(p).unwrap();
    assert_eq!(info.tag, VTag::Non);
    assert_eq!(info.ops, "spec");
    assert_eq!(info.mount, None);

    let nvp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Blk);
    assert_eq!(vfs.checkalias(nvp, dev, Some(mp.id())), Ok(Some(p)));

    let info = vfs.info(p).unwrap();
    assert_eq!(info.tag, VTag::Ufs, "[AL3] tag adopted");
    assert_eq!(info.ops, "mockfs", "[AL3] operations adopted");
    assert_eq!(info.mount, Some(mp.id()), "[AL3] moved to the mount");
    assert_eq!(info.vtype, VType::Blk);
    assert_eq!(info.usecount, 2);
    assert_eq!(vfs.vtype(nvp), Some(VType::Non), "[AL3] candidate left typeless");

    vfs.vrele(nvp).unwrap();
    assert_eq!(vfs.vfinddev(dev, VType::Blk), Some(p));
}

/// Tests: [AL4] a second placeholder for a device returns the first
#[test]
fn test_placeholder_reused() {
    let vfs = small_vfs();
    let dev = Dev::new(4, 2);
    let p1 = vfs.cdevvp(dev).unwrap();
    let p2 = vfs.cdevvp(dev).unwrap();
    assert_eq!(p1, p2, "[AL4] one vnode per device");
    assert_eq!(vfs.usecount(p1), Some(2));
    assert_eq!(vfs.info(p1).unwrap().ops, "spec");
}

/// Tests: [AL11] character placeholders are converted like block ones
#[test]
fn test_char_placeholder_converted() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let mp = mount(&vfs, "ufs");
    let dev = Dev::new(6, 1);

    let p = vfs.cdevvp(dev).unwrap();
    let nvp = new_vnode(&vfs, &fs, Some(mp.id()), VType::Chr);
    assert_eq!(vfs.checkalias(nvp, dev, Some(mp.id())), Ok(Some(p)));

    let info = vfs.info(p).unwrap();
    assert_eq!(info.ops, "mockfs", "[AL11] operations adopted");
    assert_eq!(info.tag, VTag::Ufs);
    assert_eq!(info.vtype, VType::Chr);
    assert_eq!(vfs.vtype(nvp), Some(VType::Non));
    vfs.vrele(nvp).unwrap();
    assert_eq!(vfs.vfinddev(dev, VType::Chr), Some(p));
}

/// Tests: [AL5] an unused alias is torn down and replaced
#[test]
fn test_stale_alias_replaced() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let dev = Dev::new(3, 5);

    let v1 = new_vnode(&vfs, &fs, None, VType::Blk);
    assert_eq!(vfs.checkalias(v1, dev, None), Ok(None));
    vfs.vrele(v1).unwrap();

    let v2 = new_vnode(&vfs, &fs, None, VType::Blk);
    assert_eq!(vfs.checkalias(v2, dev, None), Ok(None), "[AL5] new vnode is canonical");
    assert_eq!(count(&fs.reclaim), 1, "[AL5] stale alias reclaimed");
    assert_eq!(vfs.vtype(v1), Some(VType::Bad));
    assert_eq!(vfs.vfinddev(dev, VType::Blk), Some(v2));
}

/// Tests: [AL6] block and character vnodes of one device mark each other
#[test]
fn test_aliased_across_types() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let dev = Dev::new(3, 2);

    let b = new_vnode(&vfs, &fs, None, VType::Blk);
    let c = new_vnode(&vfs, &fs, None, VType::Chr);
    assert_eq!(vfs.checkalias(b, dev, None), Ok(None));
    assert_eq!(vfs.checkalias(c, dev, None), Ok(None), "[AL6] different type, own vnode");

    assert!(vfs.flags(b).unwrap().contains(VnodeFlags::ALIASED));
    assert!(vfs.flags(c).unwrap().contains(VnodeFlags::ALIASED));
    assert_eq!(vfs.vcount(b), 1, "[AL6] only same-type references counted");

    vfs.vgone(b).unwrap();
    assert!(
        !vfs.flags(c).unwrap().contains(VnodeFlags::ALIASED),
        "[AL6] last alias unmarked"
    );
    assert_eq!(vfs.vfinddev(dev, VType::Blk), None);
    assert_eq!(vfs.vfinddev(dev, VType::Chr), Some(c));
}

/// Tests: [AL7] non-device vnodes are never registered
#[test]
fn test_regular_file_not_registered() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let vp = new_vnode(&vfs, &fs, None, VType::Reg);
    assert_eq!(vfs.checkalias(vp, Dev::new(1, 1), None), Ok(None));
    assert_eq!(vfs.rdev(vp), None);
    assert_eq!(vfs.vfinddev(Dev::new(1, 1), VType::Reg), None);
    assert_eq!(vfs.vfs_mountedon(vp), Ok(()));
    assert_eq!(
        vfs.set_spec_mountpoint(vp, None),
        Err(VfsError::InvalidArgument)
    );
}

/// Tests: [AL8] vdevgone covers minors [lo, hi)
#[test]
fn test_vdevgone_half_open_range() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let vps: Vec<Vnode> = (0..4)
        .map(|minor| {
            let vp = new_vnode(&vfs, &fs, None, VType::Chr);
            assert_eq!(vfs.checkalias(vp, Dev::new(9, minor), None), Ok(None));
            vp
        })
        .collect();

    vfs.vdevgone(9, 1, 3, VType::Chr);

    assert_eq!(vfs.vtype(vps[0]), Some(VType::Chr));
    assert_eq!(vfs.vtype(vps[1]), Some(VType::Bad), "[AL8] lower bound included");
    assert_eq!(vfs.vtype(vps[2]), Some(VType::Bad));
    assert_eq!(vfs.vtype(vps[3]), Some(VType::Chr), "[AL8] upper bound excluded");
    assert_eq!(vfs.vfinddev(Dev::new(9, 1), VType::Chr), None);
    assert_eq!(vfs.vfinddev(Dev::new(9, 3), VType::Chr), Some(vps[3]));
}

/// Tests: [AL9] a device backing a mount reports busy
#[test]
fn test_mountedon() {
    let vfs = small_vfs();
    let mp = mount(&vfs, "ufs");
    let dv = vfs.bdevvp(Dev::new(3, 7)).unwrap();

    assert_eq!(vfs.vfs_mountedon(dv), Ok(()));
    vfs.set_spec_mountpoint(dv, Some(mp.id())).unwrap();
    assert_eq!(vfs.vfs_mountedon(dv), Err(VfsError::Busy), "[AL9] mounted device busy");
    vfs.set_spec_mountpoint(dv, None).unwrap();
    assert_eq!(vfs.vfs_mountedon(dv), Ok(()));
}

/// Tests: [AL10] revoke tears the vnode down and tells subscribers
#[test]
fn test_revoke_notifies() {
    let vfs = small_vfs();
    let fs = MockFs::new();
    let dev = Dev::new(5, 0);
    let vp = new_vnode(&vfs, &fs, None, VType::Chr);
    assert_eq!(vfs.checkalias(vp, dev, None), Ok(None));
    let rec = Arc::new(Recorder::default());
    vfs.subscribe(vp, rec.clone()).unwrap();

    vfs.revoke(vp, true).unwrap();

    assert_eq!(vfs.vtype(vp), Some(VType::Bad));
    assert_eq!(vfs.usecount(vp), Some(1), "[AL10] holder keeps its reference");
    assert_eq!(count(&fs.close), 1, "[AL10] open vnode closed");
    assert_eq!(*rec.0.lock().unwrap(), vec![(vp, VnodeEvent::Revoke)]);
    assert_eq!(vfs.subscribe(vp, rec.clone()), Err(VfsError::RetryNotFound));
    assert_eq!(vfs.vfinddev(dev, VType::Chr), None);
}
