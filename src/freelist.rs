use std::{cell::Cell, fmt, mem, ptr::NonNull};

use crate::{
    allocator::DEFAULT_ALIGNMENT,
    error::Result,
    kernel::{Kernel, PlatformMemory},
    list::Link,
    region::VirtualRegion,
    utils::align,
};

/// Bytes taken at the start of every region by its [`RegionHeader`]. The part
/// handed out by [`RegionFreeList::pop`] starts right after it.
pub const REGION_HEADER_SIZE: usize =
    align(mem::size_of::<RegionHeader<Kernel>>(), DEFAULT_ALIGNMENT);

/// Header stored at the base of every region managed by a [`RegionFreeList`].
///
/// The region describes itself: the [`VirtualRegion`] that owns the memory is
/// moved into that very memory once it has been committed.
///
/// ```text
/// +-----------------------+ <--------+
/// |     VirtualRegion     |          |
/// +-----------------------+          |-------> Region header
/// |  next (only if idle)  |          |
/// +-----------------------+ <--------+ <- pointer returned by `pop`
/// |                       |
/// |   Available to the    |
/// |        owner          |
/// |         ...           |
/// +-----------------------+
/// ```
struct RegionHeader<P: PlatformMemory> {
    region: VirtualRegion<P>,
    /// Next idle region. Only meaningful while the region is in the list.
    next: Link<RegionHeader<P>>,
}

/// Pool of committed regions of one fixed size, shared between allocators.
///
/// Allocators have different behaviours, but they all need memory committed
/// from the operating system. When an allocator no longer needs a region (it
/// holds no live allocations any more), the region goes back to this list and
/// the next allocator that needs one takes it from here instead of asking the
/// kernel again. Regions keep their pages committed while they are idle.
///
/// The list is shared by reference between its users (e.g. all the pools of a
/// [`HeapAllocator`](crate::HeapAllocator)), which is why every method takes
/// `&self`. It is not thread safe.
pub struct RegionFreeList<P: PlatformMemory = Kernel> {
    /// First idle region, or `None` if the list is empty.
    head: Cell<Link<RegionHeader<P>>>,
    /// Number of idle regions.
    len: Cell<usize>,
    /// Size of every region as requested from the kernel, header included.
    size: usize,
    /// Size of every region available to the users of the list.
    user_size: usize,
}

impl<P: PlatformMemory> RegionFreeList<P> {
    /// Creates an empty list for regions of `size` usable bytes.
    ///
    /// No region is created until [`RegionFreeList::pop`] or
    /// [`RegionFreeList::reserve`] is called.
    pub const fn new(size: usize) -> Self {
        Self {
            head: Cell::new(None),
            len: Cell::new(0),
            size: size + REGION_HEADER_SIZE,
            user_size: size,
        }
    }

    /// Creates `count` regions up front and returns how many could actually be
    /// created. If that's less than `count`, the kernel ran out of memory.
    pub fn reserve(&self, count: usize) -> usize {
        let mut reserved = 0;

        while reserved < count {
            if let Err(fault) = self.allocate_new_region() {
                tracing::warn!(%fault, reserved, requested = count, "could not reserve every region");
                break;
            }

            reserved += 1;
        }

        reserved
    }

    /// Takes an idle region out of the list, creating one if the list is empty.
    ///
    /// The returned pointer is [`DEFAULT_ALIGNMENT`] aligned and at least
    /// [`RegionFreeList::region_size`] bytes are committed behind it.
    pub fn pop(&self) -> Result<NonNull<u8>> {
        if self.head.get().is_none() {
            self.allocate_new_region()?;
        }

        let Some(header) = self.head.get() else {
            unreachable!("a region was just pushed to the list");
        };

        unsafe {
            self.head.set(header.as_ref().next);
            self.len.set(self.len.get() - 1);

            Ok(header.cast::<u8>().add(REGION_HEADER_SIZE))
        }
    }

    /// Gives a region back to the list. Its pages stay committed.
    ///
    /// # Safety
    ///
    /// `region` must come from [`RegionFreeList::pop`] on this same list and
    /// must not be used by anybody after this call. Nothing is checked.
    pub unsafe fn push(&self, region: NonNull<u8>) {
        unsafe {
            let mut header = region.sub(REGION_HEADER_SIZE).cast::<RegionHeader<P>>();

            // This will be the next region returned by `pop`.
            header.as_mut().next = self.head.get();
            self.head.set(Some(header));
        }

        self.len.set(self.len.get() + 1);
    }

    /// Gives every idle region back to the kernel.
    ///
    /// Regions that are currently popped are left alone.
    pub fn reset(&self) {
        let mut current = self.head.take();

        while let Some(header) = current {
            unsafe {
                // The region descriptor lives inside the memory it is about to
                // release, so move it out first and read the link before
                // dropping it.
                current = header.as_ref().next;
                let region = (&raw const (*header.as_ptr()).region).read();

                drop(region);
            }
        }

        self.len.set(0);
    }

    /// Usable size of every region, in bytes.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.user_size
    }

    /// Number of idle regions in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a region, commits it completely and pushes it to the list.
    fn allocate_new_region(&self) -> Result<()> {
        let mut region = VirtualRegion::<P>::new(self.size);
        let base = region.claim()?;

        tracing::debug!(base = ?base, size = region.current_size(), "new pooled region");

        unsafe {
            // Move the region into its own memory. From now on its lifetime is
            // managed by the list.
            base.cast::<RegionHeader<P>>().write(RegionHeader { region, next: None });

            self.push(base.add(REGION_HEADER_SIZE));
        }

        Ok(())
    }
}

impl<P: PlatformMemory> Drop for RegionFreeList<P> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<P: PlatformMemory> fmt::Debug for RegionFreeList<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionFreeList")
            .field("region_size", &self.user_size)
            .field("idle", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Fault, kernel::testing::NoCommit};

    #[test]
    fn header_fits_alignment() {
        assert_eq!(0, REGION_HEADER_SIZE % DEFAULT_ALIGNMENT);
        assert!(REGION_HEADER_SIZE >= mem::size_of::<RegionHeader<Kernel>>());
    }

    #[test]
    fn pop_creates_regions() {
        let list: RegionFreeList = RegionFreeList::new(0x4000);

        assert!(list.is_empty());
        let region = list.pop().unwrap();
        assert!(list.is_empty());
        assert_eq!(0, region.as_ptr() as usize % DEFAULT_ALIGNMENT);

        // The whole usable span is committed.
        unsafe {
            region.as_ptr().write_bytes(0xAB, list.region_size());
            assert_eq!(0xAB, *region.as_ptr().add(list.region_size() - 1));
        }

        unsafe { list.push(region) };
        assert_eq!(1, list.len());
    }

    #[test]
    fn pushed_regions_are_reused() {
        let list: RegionFreeList = RegionFreeList::new(0x1000);

        let first = list.pop().unwrap();
        let second = list.pop().unwrap();
        assert_ne!(first, second);

        unsafe {
            first.as_ptr().write(42);
            list.push(first);
        }

        // Last in, first out, and the contents survive the round trip.
        let again = list.pop().unwrap();
        assert_eq!(first, again);
        assert_eq!(42, unsafe { *again.as_ptr() });

        unsafe {
            list.push(again);
            list.push(second);
        }
        assert_eq!(2, list.len());
    }

    #[test]
    fn reserve_and_reset() {
        let list: RegionFreeList = RegionFreeList::new(0x1000);

        assert_eq!(3, list.reserve(3));
        assert_eq!(3, list.len());

        let region = list.pop().unwrap();
        assert_eq!(2, list.len());

        list.reset();
        assert!(list.is_empty());

        // Popped regions are not affected by a reset.
        unsafe {
            region.as_ptr().write(1);
            list.push(region);
        }
        assert_eq!(1, list.len());
    }

    #[test]
    fn failures_propagate() {
        let list: RegionFreeList<NoCommit> = RegionFreeList::new(0x1000);

        assert_eq!(0, list.reserve(2));
        assert_eq!(Err(Fault::Platform(-1)), list.pop().map(|_| ()));
        assert!(list.is_empty());
    }
}
