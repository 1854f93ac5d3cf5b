use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::Result;

/// Virtual memory page size of the computer. This is usually 4096.
/// This value should be a constant, but we can't do that since we
/// don't know the value at compile time, so it's cached on first use.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Boundary of every address range handed out by the operating system.
static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocators, our top level view of this, have nothing
/// to do with the concrete implementations / APIs offered by each kernel.
///
/// Memory is handled in two steps. A range of address space is first
/// *reserved*, which makes it unavailable to anybody else but doesn't back it
/// with physical memory. Pages inside that range are then *committed* before
/// they can be touched, and can be *decommitted* again to give the physical
/// memory back while keeping the range reserved.
///
/// All offsets and lengths given to these functions are multiples of
/// [`PlatformMemory::page_size`].
///
/// Implementors are marker types: every function is static.
pub trait PlatformMemory: 'static {
    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;

    /// Returns the boundary, in bytes, of every reservation made by the
    /// operating system.
    fn allocation_granularity() -> usize;

    /// Reserves `len` bytes of address space without committing them.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    unsafe fn reserve_pages(len: usize) -> Result<NonNull<u8>>;

    /// Returns the reserved range of `len` bytes starting at `base` to the kernel.
    ///
    /// # Safety
    ///
    /// `base` and `len` must describe exactly one range previously returned by
    /// [`PlatformMemory::reserve_pages`]. Nothing inside it may be used afterwards.
    unsafe fn release_pages(base: NonNull<u8>, len: usize) -> Result<()>;

    /// Commits `len` bytes at `offset` bytes from `base`, making them readable
    /// and writable.
    ///
    /// # Safety
    ///
    /// The range must lie inside one reservation.
    unsafe fn commit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()>;

    /// Decommits `len` bytes at `offset` bytes from `base`. The range stays reserved.
    ///
    /// # Safety
    ///
    /// The range must lie inside one reservation and must not be used afterwards
    /// until committed again.
    unsafe fn decommit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()>;
}

/// The memory primitives of the operating system the crate is compiled for.
///
/// This is the default [`PlatformMemory`] for every allocator of the crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kernel;

/// Wrapper to get the computer's page size.
#[inline]
pub fn page_size() -> usize {
    Kernel::page_size()
}

/// Wrapper to get the computer's allocation granularity.
#[inline]
pub fn allocation_granularity() -> usize {
    Kernel::allocation_granularity()
}

#[inline]
fn cached(cell: &AtomicUsize, query: impl FnOnce() -> usize) -> usize {
    match cell.load(Ordering::Relaxed) {
        0 => {
            let value = query();
            cell.store(value, Ordering::Relaxed);
            value
        }
        value => value,
    }
}

#[cfg(unix)]
mod unix {
    use super::{GRANULARITY, Kernel, PAGE_SIZE, PlatformMemory, cached};
    use crate::error::{Fault, Result};

    use libc::{c_int, off_t, size_t};

    use std::{os::raw::c_void, ptr::NonNull};

    impl PlatformMemory for Kernel {
        fn page_size() -> usize {
            cached(&PAGE_SIZE, || unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize })
        }

        fn allocation_granularity() -> usize {
            // mmap hands out ranges on page boundaries.
            cached(&GRANULARITY, Self::page_size)
        }

        unsafe fn reserve_pages(len: usize) -> Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Inaccessible until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => Err(Fault::last_platform_error()),
                    addr => Ok(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn release_pages(base: NonNull<u8>, len: usize) -> Result<()> {
            unsafe {
                if libc::munmap(base.as_ptr().cast(), len as size_t) != 0 {
                    return Err(Fault::last_platform_error());
                }
            }

            Ok(())
        }

        unsafe fn commit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe {
                let addr = base.as_ptr().add(offset).cast::<c_void>();

                if libc::mprotect(addr, len as size_t, PROT) != 0 {
                    return Err(Fault::last_platform_error());
                }
            }

            Ok(())
        }

        unsafe fn decommit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            unsafe {
                let addr = base.as_ptr().add(offset).cast::<c_void>();

                // Drop the physical pages first, then make the range inaccessible
                // again so a stale pointer faults instead of reading zeroes.
                if libc::madvise(addr, len as size_t, libc::MADV_DONTNEED) != 0 {
                    return Err(Fault::last_platform_error());
                }

                if libc::mprotect(addr, len as size_t, libc::PROT_NONE) != 0 {
                    return Err(Fault::last_platform_error());
                }
            }

            Ok(())
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{GRANULARITY, Kernel, PAGE_SIZE, PlatformMemory, cached};
    use crate::error::{Fault, Result};

    use windows::Win32::System::{Memory, SystemInformation};

    fn system_info() -> SystemInformation::SYSTEM_INFO {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init()
        }
    }

    impl PlatformMemory for Kernel {
        fn page_size() -> usize {
            cached(&PAGE_SIZE, || system_info().dwPageSize as usize)
        }

        fn allocation_granularity() -> usize {
            cached(&GRANULARITY, || system_info().dwAllocationGranularity as usize)
        }

        unsafe fn reserve_pages(len: usize) -> Result<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_NOACCESS,
                );

                NonNull::new(addr.cast()).ok_or_else(Fault::last_platform_error)
            }
        }

        unsafe fn release_pages(base: NonNull<u8>, _len: usize) -> Result<()> {
            unsafe {
                Memory::VirtualFree(base.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE)
                    .map_err(|_| Fault::last_platform_error())
            }
        }

        unsafe fn commit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            unsafe {
                let addr = base.as_ptr().add(offset) as *const c_void;
                let committed = Memory::VirtualAlloc(
                    Some(addr),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                if committed.is_null() {
                    return Err(Fault::last_platform_error());
                }
            }

            Ok(())
        }

        unsafe fn decommit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            unsafe {
                let addr = base.as_ptr().add(offset) as *mut c_void;

                Memory::VirtualFree(addr, len, Memory::MEM_DECOMMIT)
                    .map_err(|_| Fault::last_platform_error())
            }
        }
    }
}

/// Platforms that misbehave on purpose, used to exercise the failure paths.
#[cfg(test)]
pub(crate) mod testing {
    use std::{
        ptr::NonNull,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::{Kernel, PlatformMemory};
    use crate::error::{Fault, Result};

    /// Reserves address space normally but refuses to commit any page.
    pub(crate) struct NoCommit;

    impl PlatformMemory for NoCommit {
        fn page_size() -> usize {
            Kernel::page_size()
        }

        fn allocation_granularity() -> usize {
            Kernel::allocation_granularity()
        }

        unsafe fn reserve_pages(len: usize) -> Result<NonNull<u8>> {
            unsafe { Kernel::reserve_pages(len) }
        }

        unsafe fn release_pages(base: NonNull<u8>, len: usize) -> Result<()> {
            unsafe { Kernel::release_pages(base, len) }
        }

        unsafe fn commit_pages(_base: NonNull<u8>, _offset: usize, _len: usize) -> Result<()> {
            Err(Fault::Platform(-1))
        }

        unsafe fn decommit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            unsafe { Kernel::decommit_pages(base, offset, len) }
        }
    }

    /// Commits normally but refuses to decommit. Counts the ranges it releases.
    pub(crate) struct NoDecommit;

    pub(crate) static NO_DECOMMIT_RELEASES: AtomicUsize = AtomicUsize::new(0);

    impl PlatformMemory for NoDecommit {
        fn page_size() -> usize {
            Kernel::page_size()
        }

        fn allocation_granularity() -> usize {
            Kernel::allocation_granularity()
        }

        unsafe fn reserve_pages(len: usize) -> Result<NonNull<u8>> {
            unsafe { Kernel::reserve_pages(len) }
        }

        unsafe fn release_pages(base: NonNull<u8>, len: usize) -> Result<()> {
            NO_DECOMMIT_RELEASES.fetch_add(1, Ordering::Relaxed);

            unsafe { Kernel::release_pages(base, len) }
        }

        unsafe fn commit_pages(base: NonNull<u8>, offset: usize, len: usize) -> Result<()> {
            unsafe { Kernel::commit_pages(base, offset, len) }
        }

        unsafe fn decommit_pages(_base: NonNull<u8>, _offset: usize, _len: usize) -> Result<()> {
            Err(Fault::Platform(-2))
        }
    }
}
