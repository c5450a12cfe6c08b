//! TEAM_436: Vnode layer error types.
//!
//! Recoverable conditions come back as [`VfsError`]. Broken invariants
//! (reference underflow, a buffer bound twice, a teardown that cannot
//! complete) are not errors: they go through `diag::fault` and stop the
//! system.

use vn_error::define_kernel_error;
use vn_utils::LockError;

define_kernel_error! {
    /// TEAM_436: Vnode layer error codes.
    ///
    /// Errno values follow the BSD numbering used at the syscall boundary.
    pub enum VfsError(0x23) {
        /// Pool at its limit and every recycle candidate is locked (ENFILE)
        TableFull = 0x01 => "Vnode table is full" [23],
        /// Resource in use or would have to wait (EBUSY)
        Busy = 0x02 => "Device or resource busy" [16],
        /// Vnode changed identity while waiting, look it up again (ENOENT)
        RetryNotFound = 0x03 => "Vnode changed identity" [2],
        /// Mount went away while waiting for it (ENOENT)
        NotFound = 0x04 => "No such mount or device" [2],
        /// Transfer failed (EIO)
        IoError = 0x05 => "I/O error" [5],
        /// Operation not supported (EOPNOTSUPP)
        NotSupported = 0x06 => "Operation not supported" [45],
        /// Invalid argument (EINVAL)
        InvalidArgument = 0x07 => "Invalid argument" [22],
        /// Forced unmounts disabled (EPERM)
        NotPermitted = 0x08 => "Operation not permitted" [1],
        /// Vnode lock failed for a reason other than contention
        Lock(LockError) = 0x09 => "Vnode lock failed",
    }
}

impl From<LockError> for VfsError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy => VfsError::Busy,
            other => VfsError::Lock(other),
        }
    }
}

impl VfsError {
    /// Convert to a negative errno for the syscall boundary.
    pub const fn to_errno(self) -> i64 {
        -(self.errno() as i64)
    }
}

/// TEAM_436: Result type for vnode layer operations
pub type VfsResult<T> = Result<T, VfsError>;
