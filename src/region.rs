use std::{fmt, marker::PhantomData, ptr::NonNull};

use crate::{
    error::{Fault, Result},
    kernel::{Kernel, PlatformMemory},
    utils::align,
};

/// A contiguous range of virtual memory reserved from the operating system and
/// committed page by page as it is needed.
///
/// Not to be confused with an [`Allocator`](crate::Allocator). A region only
/// knows how many bytes have been asked for so far. Allocators are built on top
/// of it and decide what goes where.
///
/// ```text
///  base                    current_size         reserved_size
///   |                           |                     |
///   v                           v                     v
///   +------+------+------+------+------+------+------+
///   | page | page | page | page |      |      |      |
///   +------+------+------+------+------+------+------+
///   <------- committed --------> <--- reserved ------>
/// ```
///
/// Nothing is reserved until the region is first grown. Pages are committed
/// strictly forward, starting at `base`. Individual pages can't be given back;
/// in order to decommit anything, the whole region has to be [`reset`](Self::reset).
pub struct VirtualRegion<P: PlatformMemory = Kernel> {
    /// The size the region was created with, in bytes.
    max_size: usize,
    /// Bytes requested through [`VirtualRegion::grow`] so far. The number of
    /// committed pages is this value rounded up to the page size.
    current_size: usize,
    /// Start of the reserved range. `None` until the range is reserved.
    base: Option<NonNull<u8>>,
    platform: PhantomData<P>,
}

// A region exclusively owns the range it reserved.
unsafe impl<P: PlatformMemory> Send for VirtualRegion<P> {}

impl<P: PlatformMemory> VirtualRegion<P> {
    /// Creates a region able to hold `max_size` bytes.
    ///
    /// No memory is reserved yet. Due to page granularity the final size may be
    /// larger than requested, see [`VirtualRegion::reserved_size`].
    #[inline]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            base: None,
            platform: PhantomData,
        }
    }

    /// Creates an empty region. It can never be grown.
    #[inline]
    pub const fn empty() -> Self {
        Self::new(0)
    }

    /// Commits the whole region at once and returns its base.
    ///
    /// Calling this after [`VirtualRegion::grow`] finishes committing the region.
    /// Fails with [`Fault::InvalidOperation`] if everything is already committed.
    pub fn claim(&mut self) -> Result<NonNull<u8>> {
        let remaining = self.reserved_size() - self.current_size;

        if remaining == 0 {
            return Err(Fault::InvalidOperation);
        }

        self.grow(remaining)
    }

    /// Commits as many pages as needed to make room for `size` more bytes and
    /// returns the base of the region.
    ///
    /// The returned pointer never changes until the region is released, so
    /// callers find their new bytes at `base + previous size`. Growing by `0`
    /// just returns the base (reserving the range if that hasn't happened yet).
    pub fn grow(&mut self, size: usize) -> Result<NonNull<u8>> {
        let base = self.reserve()?;
        let reserved_size = self.reserved_size();

        let new_size = self
            .current_size
            .checked_add(size)
            .filter(|new_size| *new_size <= reserved_size)
            .ok_or(Fault::OutOfMemory)?;

        let current_committed = self.current_size();
        let new_committed = align(new_size, P::page_size());

        if new_committed > current_committed {
            unsafe {
                P::commit_pages(base, current_committed, new_committed - current_committed)?;
            }

            tracing::trace!(
                base = ?base,
                committed = new_committed,
                reserved = reserved_size,
                "committed region pages"
            );
        }

        self.current_size = new_size;

        Ok(base)
    }

    /// Decommits every committed page. If `release` is true the address range
    /// is given back to the kernel as well, and the next [`VirtualRegion::grow`]
    /// reserves a new one.
    ///
    /// All pointers into the region are invalid afterwards.
    pub fn reset(&mut self, release: bool) -> Result<()> {
        let Some(base) = self.base else {
            return Ok(());
        };

        let committed = self.current_size();
        self.current_size = 0;

        let decommitted = match committed {
            0 => Ok(()),
            committed => unsafe { P::decommit_pages(base, 0, committed) },
        };

        if !release {
            return decommitted;
        }

        // The range is released even if decommitting failed, the first fault wins.
        self.base = None;
        let released = unsafe { P::release_pages(base, self.reserved_size()) };

        if released.is_ok() {
            tracing::debug!(base = ?base, size = self.reserved_size(), "released region");
        }

        decommitted.and(released)
    }

    /// Maximum size of the region: the requested size rounded up to the page size.
    ///
    /// For example, if 4000 bytes were requested and the page size is 4096
    /// bytes, the region is 4096 bytes large.
    #[inline]
    pub fn reserved_size(&self) -> usize {
        align(self.max_size, P::page_size())
    }

    /// Bytes currently committed, always a multiple of the page size.
    #[inline]
    pub fn current_size(&self) -> usize {
        align(self.current_size, P::page_size())
    }

    /// Start of the region, if it has been reserved.
    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Reserves the address range on first use.
    fn reserve(&mut self) -> Result<NonNull<u8>> {
        if let Some(base) = self.base {
            return Ok(base);
        }

        // An empty region has nothing to reserve and can't grow at all.
        if self.max_size == 0 {
            return Err(Fault::OutOfMemory);
        }

        let size = self.reserved_size();
        let base = unsafe { P::reserve_pages(size)? };
        self.base = Some(base);

        tracing::debug!(base = ?base, size, "reserved region");

        Ok(base)
    }
}

impl<P: PlatformMemory> Default for VirtualRegion<P> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<P: PlatformMemory> Drop for VirtualRegion<P> {
    fn drop(&mut self) {
        if let Err(fault) = self.reset(true) {
            tracing::warn!(%fault, "failed to release region");
        }
    }
}

impl<P: PlatformMemory> fmt::Debug for VirtualRegion<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("base", &self.base)
            .field("current_size", &self.current_size())
            .field("reserved_size", &self.reserved_size())
            .finish()
    }
}
