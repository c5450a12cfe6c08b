//! TEAM_437: Tunables for the vnode layer.

use crate::error::{VfsError, VfsResult};

/// TEAM_437: Vnode layer configuration.
///
/// Built with `const` setters so a kernel can keep its configuration in a
/// `static`:
///
/// ```ignore
/// static CONFIG: VfsConfig = VfsConfig::new().with_desired_vnodes(1024);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfsConfig {
    /// Pool size below which allocation never recycles
    pub desired_vnodes: usize,
    /// Device alias buckets, power of two
    pub spechash_size: usize,
    /// Slots on the delayed-write wheel
    pub syncer_maxdelay: usize,
    /// Ticks before a dirty file vnode is flushed
    pub syncdelay: usize,
    /// Ticks before a dirty directory is flushed
    pub dirdelay: usize,
    /// Ticks before a dirty device that backs a mount is flushed
    pub metadelay: usize,
    /// Passes `syncwait` makes over the buffer table
    pub syncwait_iterations: usize,
    /// Allow FORCE unmounts
    pub force_unmount: bool,
    /// Log when an active vnode is reclaimed
    pub print_active_reclaims: bool,
    /// Log each busy vnode found by a mount flush
    pub report_busy_vnodes: bool,
}

impl VfsConfig {
    pub const fn new() -> Self {
        Self {
            desired_vnodes: 256,
            spechash_size: 64,
            syncer_maxdelay: 32,
            syncdelay: 30,
            dirdelay: 15,
            metadelay: 10,
            syncwait_iterations: 20,
            force_unmount: true,
            print_active_reclaims: false,
            report_busy_vnodes: false,
        }
    }

    pub const fn with_desired_vnodes(mut self, n: usize) -> Self {
        self.desired_vnodes = n;
        self
    }

    pub const fn with_spechash_size(mut self, n: usize) -> Self {
        self.spechash_size = n;
        self
    }

    /// Set the wheel size and the three flush delays together.
    pub const fn with_sync_delays(
        mut self,
        maxdelay: usize,
        syncdelay: usize,
        dirdelay: usize,
        metadelay: usize,
    ) -> Self {
        self.syncer_maxdelay = maxdelay;
        self.syncdelay = syncdelay;
        self.dirdelay = dirdelay;
        self.metadelay = metadelay;
        self
    }

    pub const fn with_syncwait_iterations(mut self, n: usize) -> Self {
        self.syncwait_iterations = n;
        self
    }

    pub const fn with_force_unmount(mut self, on: bool) -> Self {
        self.force_unmount = on;
        self
    }

    pub const fn with_print_active_reclaims(mut self, on: bool) -> Self {
        self.print_active_reclaims = on;
        self
    }

    pub const fn with_report_busy_vnodes(mut self, on: bool) -> Self {
        self.report_busy_vnodes = on;
        self
    }

    /// Reject configurations the layer cannot run with.
    pub fn validate(&self) -> VfsResult<()> {
        if self.desired_vnodes == 0 {
            log::error!("[VFS] desired_vnodes must be non-zero");
            return Err(VfsError::InvalidArgument);
        }
        if !self.spechash_size.is_power_of_two() {
            log::error!("[VFS] spechash_size {} is not a power of two", self.spechash_size);
            return Err(VfsError::InvalidArgument);
        }
        let longest = self.syncdelay.max(self.dirdelay).max(self.metadelay);
        if self.syncer_maxdelay == 0 || longest >= self.syncer_maxdelay {
            log::error!(
                "[VFS] sync delay {} does not fit a wheel of {}",
                longest,
                self.syncer_maxdelay
            );
            return Err(VfsError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self::new()
    }
}
