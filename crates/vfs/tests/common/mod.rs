//! TEAM_453: Shared fixtures for the vnode layer integration tests.
//!
//! `MockFs` counts every callback the layer makes and can hold writes back
//! until the test completes them. The capture logger is adapted from the
//! kernel's `SimpleLogger`, keeping lines in memory instead of printing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{Level, LevelFilter, Metadata, Record};
use vn_vfs::{
    BufId, CloseFlags, FlushFlags, Mount, MountId, MountOps, UnmountFlags, VTag, VType, Vfs,
    VfsConfig, VfsError, VfsResult, Vnode, VnodeOps,
};

// ============================================================================
// Capture logger
// ============================================================================

static LOGGER: CaptureLogger = CaptureLogger;
static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            LINES.lock().unwrap().push(format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install the capture logger. Later calls are no-ops.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Whether any captured line contains `needle`.
pub fn logged(needle: &str) -> bool {
    LINES.lock().unwrap().iter().any(|l| l.contains(needle))
}

// ============================================================================
// Mock filesystem
// ============================================================================

#[derive(Default)]
pub struct MockFs {
    pub inactive: AtomicUsize,
    pub reclaim: AtomicUsize,
    pub close: AtomicUsize,
    pub fsync: AtomicUsize,
    pub writes: AtomicUsize,
    /// Hold writes until `complete_all`
    pub defer_io: AtomicBool,
    pub fail_fsync: AtomicBool,
    pub reclaim_delay_ms: AtomicU64,
    pending: Mutex<Vec<BufId>>,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deferred() -> Arc<Self> {
        let fs = Self::default();
        fs.defer_io.store(true, Ordering::SeqCst);
        Arc::new(fs)
    }

    /// Finish every held-back write. Returns how many there were.
    pub fn complete_all(&self, vfs: &Vfs) -> usize {
        let pending: Vec<BufId> = self.pending.lock().unwrap().drain(..).collect();
        for &bp in &pending {
            vfs.biodone(bp);
        }
        pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

pub fn count(c: &AtomicUsize) -> usize {
    c.load(Ordering::SeqCst)
}

impl VnodeOps for MockFs {
    fn name(&self) -> &'static str {
        "mockfs"
    }

    fn inactive(&self, vfs: &Vfs, vp: Vnode) -> VfsResult<()> {
        self.inactive.fetch_add(1, Ordering::SeqCst);
        vfs.generic_unlock(vp)
    }

    fn reclaim(&self, vfs: &Vfs, vp: Vnode) -> VfsResult<()> {
        self.reclaim.fetch_add(1, Ordering::SeqCst);
        let delay = self.reclaim_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let _ = vfs.take_private(vp);
        Ok(())
    }

    fn close(&self, _vfs: &Vfs, _vp: Vnode, _flags: CloseFlags) -> VfsResult<()> {
        self.close.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fsync(&self, vfs: &Vfs, vp: Vnode, wait: bool) -> VfsResult<()> {
        self.fsync.fetch_add(1, Ordering::SeqCst);
        if self.fail_fsync.load(Ordering::SeqCst) {
            return Err(VfsError::IoError);
        }
        vfs.vflushbuf(vp, wait);
        Ok(())
    }

    fn strategy(&self, vfs: &Vfs, bp: BufId) -> VfsResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.defer_io.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push(bp);
        } else {
            vfs.biodone(bp);
        }
        Ok(())
    }
}

/// Filesystem whose reclaim forgets to release its private data.
pub struct LeakyFs;

impl VnodeOps for LeakyFs {
    fn name(&self) -> &'static str {
        "leakyfs"
    }

    fn reclaim(&self, _vfs: &Vfs, _vp: Vnode) -> VfsResult<()> {
        Ok(())
    }
}

// ============================================================================
// Mock mount
// ============================================================================

#[derive(Default)]
pub struct MockMount {
    /// Refuse every unmount
    pub refuse: AtomicBool,
    /// Names of mounts in the order they were unmounted
    pub order: Option<Arc<Mutex<Vec<String>>>>,
}

impl MountOps for MockMount {
    fn fs_type(&self) -> &'static str {
        "mockfs"
    }

    fn unmount(&self, vfs: &Vfs, mp: &Arc<Mount>, flags: UnmountFlags) -> VfsResult<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(VfsError::Busy);
        }
        if let Some(order) = &self.order {
            order.lock().unwrap().push(mp.name().to_string());
        }
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

// ============================================================================
// Builders
// ============================================================================

/// Small pool and an eight-slot wheel: files flush after 4 ticks,
/// directories after 2, mounted devices after 1.
pub fn small_config() -> VfsConfig {
    VfsConfig::new()
        .with_desired_vnodes(8)
        .with_sync_delays(8, 4, 2, 1)
}

pub fn vfs_with(config: VfsConfig) -> Vfs {
    init_logger();
    Vfs::with_config(config).expect("valid config")
}

pub fn small_vfs() -> Vfs {
    vfs_with(small_config())
}

/// A fresh vnode of `fs`, active with one reference.
pub fn new_vnode(vfs: &Vfs, fs: &Arc<MockFs>, mp: Option<MountId>, vtype: VType) -> Vnode {
    let ops: Arc<dyn VnodeOps> = fs.clone();
    let vp = vfs.getnewvnode(VTag::Ufs, mp, ops).expect("vnode");
    vfs.set_type(vp, vtype);
    vp
}

pub fn mount(vfs: &Vfs, name: &str) -> Arc<Mount> {
    vfs.mount_alloc(name, None, Arc::new(MockMount::default()))
}
