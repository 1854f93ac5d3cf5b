//! Faults reported by the allocators.
//!
//! Every fallible operation in this crate returns a [`Result`] carrying exactly
//! one [`Fault`]. Allocators never try to recover from a fault themselves, they
//! hand it back to the caller.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Fault> = core::result::Result<T, E>;

/// The kind of failure an allocator ran into.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The requested capacity is not available: a region is exhausted, the
    /// operating system refused more address space, or no size class is large
    /// enough.
    #[error("out of memory")]
    OutOfMemory,

    /// The caller asked for something the allocator was not configured for,
    /// e.g. a block larger than its object size.
    #[error("invalid argument")]
    InvalidArgument,

    /// The caller misused the allocator state, e.g. claimed a region that is
    /// already fully committed.
    #[error("invalid operation")]
    InvalidOperation,

    /// An operating system call failed. The code is only meant for diagnostics.
    #[error("platform error (os code {0})")]
    Platform(i64),
}

impl Fault {
    /// Builds a [`Fault::Platform`] from the last error reported by the OS.
    pub(crate) fn last_platform_error() -> Self {
        #[cfg(unix)]
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as i64;

        #[cfg(windows)]
        let code = unsafe { windows::Win32::Foundation::GetLastError().0 as i64 };

        #[cfg(not(any(unix, windows)))]
        let code = 0;

        tracing::warn!(code, "platform memory call failed");

        Fault::Platform(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_display() {
        assert_eq!("out of memory", Fault::OutOfMemory.to_string());
        assert_eq!("invalid argument", Fault::InvalidArgument.to_string());
        assert_eq!("platform error (os code 12)", Fault::Platform(12).to_string());
    }
}
