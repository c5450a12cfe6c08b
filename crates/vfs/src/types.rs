//! TEAM_435: Vnode layer vocabulary types.
//!
//! Handles, device numbers and the flag sets carried by vnodes and buffers.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

/// TEAM_435: Vnode handle.
///
/// A handle names one identity of a pooled vnode. When the slot is recycled
/// for a new identity its generation moves on and the old handle goes stale;
/// operations on a stale handle fail with `RetryNotFound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vnode {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Vnode {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) const fn slot(self) -> usize {
        self.index as usize
    }

    /// Pool slot the vnode lives in.
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vnode#{}.{}", self.index, self.generation)
    }
}

/// TEAM_435: Buffer handle, generation checked like [`Vnode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl BufId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) const fn slot(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}.{}", self.index, self.generation)
    }
}

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique mount identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(u64);

impl MountId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount#{}", self.0)
    }
}

/// TEAM_435: Device number.
///
/// Major in bits 8..16, minor split across bits 0..8 and 16..32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dev(u32);

impl Dev {
    /// No device.
    pub const NODEV: Dev = Dev(u32::MAX);

    pub const fn new(major: u32, minor: u32) -> Self {
        Dev(((major & 0xff) << 8) | (minor & 0xff) | ((minor & 0x00ff_ff00) << 8))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Dev(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        (self.0 >> 8) & 0xff
    }

    pub const fn minor(self) -> u32 {
        (self.0 & 0xff) | ((self.0 & 0xffff_0000) >> 8)
    }
}

impl fmt::Display for Dev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Dev::NODEV {
            write!(f, "NODEV")
        } else {
            write!(f, "{},{}", self.major(), self.minor())
        }
    }
}

/// Vnode types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VType {
    /// No type yet
    Non,
    Reg,
    Dir,
    /// Block device
    Blk,
    /// Character device
    Chr,
    Lnk,
    Sock,
    Fifo,
    /// Torn down
    Bad,
}

impl VType {
    pub const fn name(self) -> &'static str {
        match self {
            VType::Non => "VNON",
            VType::Reg => "VREG",
            VType::Dir => "VDIR",
            VType::Blk => "VBLK",
            VType::Chr => "VCHR",
            VType::Lnk => "VLNK",
            VType::Sock => "VSOCK",
            VType::Fifo => "VFIFO",
            VType::Bad => "VBAD",
        }
    }

    pub const fn is_device(self) -> bool {
        matches!(self, VType::Blk | VType::Chr)
    }

    /// Map the `S_IFMT` bits of a file mode to a vnode type.
    pub const fn from_mode(mode: u32) -> Self {
        match mode & 0o170_000 {
            0o010_000 => VType::Fifo,
            0o020_000 => VType::Chr,
            0o040_000 => VType::Dir,
            0o060_000 => VType::Blk,
            0o100_000 => VType::Reg,
            0o120_000 => VType::Lnk,
            0o140_000 => VType::Sock,
            _ => VType::Non,
        }
    }

    /// `S_IFMT` bits for this type, zero when there are none.
    pub const fn to_mode(self) -> u32 {
        match self {
            VType::Fifo => 0o010_000,
            VType::Chr => 0o020_000,
            VType::Dir => 0o040_000,
            VType::Blk => 0o060_000,
            VType::Reg => 0o100_000,
            VType::Lnk => 0o120_000,
            VType::Sock => 0o140_000,
            VType::Non | VType::Bad => 0,
        }
    }
}

/// Filesystem tag carried by a vnode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VTag {
    /// Untagged: placeholder device vnodes and reclaimed vnodes
    Non,
    Ufs,
    Nfs,
    Mfs,
    Msdosfs,
    Ext2fs,
    Tmpfs,
    Other(u16),
}

/// Recycle list a vnode is queued on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleList {
    /// Unreferenced, no cached buffers
    Free,
    /// Unreferenced, still caching buffers
    Hold,
}

/// Which per-vnode buffer list a buffer sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufQueue {
    Clean,
    Dirty,
}

bitflags! {
    /// Vnode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// Root of its filesystem
        const ROOT = 1 << 0;
        /// Backs a running program
        const TEXT = 1 << 1;
        /// Used by the system itself, skipped by SKIPSYSTEM flushes
        const SYSTEM = 1 << 2;
        /// Teardown in progress
        const XLOCK = 1 << 8;
        /// Someone waits for XLOCK to clear
        const XWANT = 1 << 9;
        /// Device vnode shares its device with another vnode
        const ALIASED = 1 << 10;
        /// Being reclaimed for a new identity
        const RECYCLE = 1 << 11;
    }
}

impl VnodeFlags {
    /// Flags a filesystem may set or clear directly.
    pub const USER: VnodeFlags = VnodeFlags::ROOT
        .union(VnodeFlags::TEXT)
        .union(VnodeFlags::SYSTEM);
}

bitflags! {
    /// Buffer state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        /// Owned by a context doing I/O or modifying it
        const BUSY = 1 << 0;
        /// Someone sleeps until BUSY clears
        const WANTED = 1 << 1;
        /// Dirty, written back later
        const DELWRI = 1 << 2;
        /// I/O completed
        const DONE = 1 << 3;
        /// Read transfer
        const READ = 1 << 4;
        /// Released by biodone
        const ASYNC = 1 << 5;
        /// Contents discarded on release
        const INVAL = 1 << 6;
        /// Transfer failed
        const ERROR = 1 << 7;
        /// Write counted in the owner's pending output
        const WRITEINPROG = 1 << 8;
    }
}

bitflags! {
    /// Mount flush behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        /// Leave SYSTEM vnodes alone
        const SKIPSYSTEM = 1 << 0;
        /// Only regular files open for writing
        const WRITECLOSE = 1 << 1;
        /// Tear down active vnodes too
        const FORCECLOSE = 1 << 2;
    }
}

bitflags! {
    /// Buffer invalidation behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InvalFlags: u32 {
        /// Write dirty buffers before discarding
        const SAVE = 1 << 0;
        /// Keep metadata buffers (negative block numbers)
        const SAVEMETA = 1 << 1;
    }
}

bitflags! {
    /// Teardown options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CleanFlags: u32 {
        /// Flush buffers and close an active vnode
        const DOCLOSE = 1 << 0;
    }
}

bitflags! {
    /// Open-file flags passed to close.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Do not sleep in the device close routine
        const NONBLOCK = 1 << 2;
    }
}

bitflags! {
    /// Unmount behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnmountFlags: u32 {
        /// Tear down active vnodes and ignore filesystem refusal
        const FORCE = 1 << 0;
    }
}

/// Busy gate acquisition mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateMode {
    /// Ordinary use, any number of holders
    Read,
    /// Unmount, sole holder
    Write,
}

/// Events delivered to revocation subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VnodeEvent {
    /// The vnode was torn down underneath its users
    Revoke,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_split() {
        let d = Dev::new(4, 0x12_3456);
        assert_eq!(d.major(), 4);
        assert_eq!(d.minor(), 0x12_3456);
        assert_eq!(Dev::new(3, 7).raw(), 0x307);
    }

    #[test]
    fn test_mode_mapping() {
        assert_eq!(VType::from_mode(0o060_644), VType::Blk);
        assert_eq!(VType::from_mode(VType::Dir.to_mode() | 0o755), VType::Dir);
        assert_eq!(VType::Bad.to_mode(), 0);
    }
}
