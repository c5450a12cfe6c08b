//! TEAM_431: Error handling infrastructure for the vnode layer.
//!
//! Provides the `define_kernel_error!` macro used by every crate in the
//! workspace. Each generated type carries a subsystem byte, a per-variant code,
//! a human readable description and the errno the variant maps to at the
//! syscall boundary.
//!
//! ## Usage
//!
//! ### Simple errors
//! ```ignore
//! define_kernel_error! {
//!     pub enum LockError(0x24) {
//!         Busy = 0x01 => "Lock is held" [16],
//!         SleepFail = 0x02 => "Slept while acquiring" [77],
//!     }
//! }
//! ```
//!
//! ### Nested errors
//! The errno of a nested variant without an explicit `[errno]` is taken from
//! the inner error, so inner types must also come from this macro.
//! ```ignore
//! define_kernel_error! {
//!     pub enum VfsError(0x23) {
//!         TableFull = 0x01 => "Vnode table is full" [23],
//!         Lock(LockError) = 0x09 => "Vnode lock failed",
//!     }
//! }
//! ```
//!
//! Variants without any errno report `EIO`.

#![no_std]

/// Errno reported by variants that do not name one.
pub const DEFAULT_ERRNO: i32 = 5;

/// Macro to define an error type with subsystem codes and errno mapping.
///
/// Supports both simple variants and nested variants containing inner errors.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal $([$errno:literal])?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric error code, subsystem in the high byte.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Error description for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// Errno reported to callers outside the kernel.
            pub const fn errno(&self) -> i32 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _inner) => {
                            $crate::define_kernel_error!(@errno _inner $(($inner))? $([$errno])?)
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@errno $bind:ident ($inner:ty) [$errno:literal]) => { $errno };
    (@errno $bind:ident ($inner:ty)) => { $bind.errno() };
    (@errno $bind:ident [$errno:literal]) => { $errno };
    (@errno $bind:ident) => { $crate::DEFAULT_ERRNO };

    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
