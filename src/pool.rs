use std::{fmt, mem, ptr::NonNull};

use crate::{
    allocator::{Allocator, DEFAULT_ALIGNMENT},
    block::{AllocationHeader, FreeNode, HEADER_SIZE, RegionRecord, region_capacity},
    error::{Fault, Result},
    freelist::RegionFreeList,
    kernel::{Kernel, PlatformMemory},
    list::List,
    utils::align,
};

/// Allocates blocks of one uniform size out of regions shared through a
/// [`RegionFreeList`].
///
/// Each region the pool takes is carved into slots of `object_size` bytes plus
/// a small [`HEADER_SIZE`] header, and free slots are tracked as runs that are
/// split on allocation and merged back on deallocation.
///
/// ```text
///                     regions (oldest first)
///
/// +-------------------------+      +-------------------------+
/// | Record | used | free... | ---> | Record | free | used   | ---> ...
/// +-------------------------+      +-------------------------+
/// ```
///
/// When a region becomes completely free it goes back to the free list, unless
/// it's the only region of the pool: one region is always kept so that a pool
/// hovering around one allocation doesn't take and give back a region every
/// time.
///
/// The free list must outlive the pool: when the pool is dropped, all its
/// regions are given back, along with any block still allocated from them.
pub struct PoolAllocator<'a, P: PlatformMemory = Kernel> {
    /// Where regions come from and go back to.
    free_list: &'a RegionFreeList<P>,
    /// Regions currently owned, in the order they were taken.
    regions: List<RegionRecord>,
    /// The maximum size of an object stored in this pool.
    object_size: usize,
    /// The number of objects stored in one region.
    object_count: usize,
}

impl<'a, P: PlatformMemory> PoolAllocator<'a, P> {
    /// Creates a pool of objects no larger than `object_size` bytes.
    ///
    /// `object_size` is rounded up to a multiple of [`DEFAULT_ALIGNMENT`], so
    /// [`PoolAllocator::object_size`] may be larger than requested. Fails with
    /// [`Fault::InvalidArgument`] if not even one object fits in a region of
    /// the free list.
    ///
    /// No region is taken until the first allocation.
    pub fn new(free_list: &'a RegionFreeList<P>, object_size: usize) -> Result<Self> {
        let object_size = align(object_size.max(mem::size_of::<FreeNode>()), DEFAULT_ALIGNMENT);
        let object_count = region_capacity(free_list.region_size(), HEADER_SIZE + object_size);

        if object_count == 0 {
            return Err(Fault::InvalidArgument);
        }

        Ok(Self {
            free_list,
            regions: List::new(),
            object_size,
            object_count,
        })
    }

    /// Maximum size of an object, in bytes.
    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of objects that fit in one region.
    #[inline]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Number of regions currently owned by the pool.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Number of free objects left in the regions the pool owns.
    pub fn free_object_count(&self) -> usize {
        self.regions
            .iter()
            .map(|record| unsafe { record.as_ref().free_count() })
            .sum()
    }

    /// Finds the first owned region that still has a free slot, oldest first.
    ///
    /// O(n) in the number of full regions, O(1) if the oldest one has room.
    fn first_free_region(&self) -> Option<NonNull<RegionRecord>> {
        self.regions
            .iter()
            .find(|record| unsafe { record.as_ref().has_free_slot() })
    }

    /// Takes a region from the free list and appends it to the pool.
    fn request_empty_region(&mut self) -> Result<NonNull<RegionRecord>> {
        let base = self.free_list.pop()?;

        unsafe {
            let record = RegionRecord::format(
                base,
                self.object_count,
                self.object_size,
                HEADER_SIZE + self.object_size,
            );
            self.regions.push_back(record);

            tracing::debug!(
                object_size = self.object_size,
                regions = self.regions.len(),
                "pool took a region"
            );

            Ok(record)
        }
    }

    /// Unlinks a free region and gives it back to the free list.
    ///
    /// # Safety
    ///
    /// `record` must be owned by this pool and hold no live allocation.
    unsafe fn return_region(&mut self, record: NonNull<RegionRecord>) {
        unsafe {
            self.regions.remove(record);
            self.free_list.push(record.cast());
        }

        tracing::debug!(
            object_size = self.object_size,
            regions = self.regions.len(),
            "pool returned a region"
        );
    }
}

impl<P: PlatformMemory> Allocator for PoolAllocator<'_, P> {
    /// Allocates a single object.
    ///
    /// Fails with [`Fault::InvalidArgument`] if `size` is larger than the
    /// object size, or if `alignment` is larger than [`DEFAULT_ALIGNMENT`]:
    /// every object is aligned to that boundary and nothing more.
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if size > self.object_size || !alignment.is_power_of_two() || alignment > DEFAULT_ALIGNMENT {
            return Err(Fault::InvalidArgument);
        }

        let record = match self.first_free_region() {
            Some(record) => record,
            None => self.request_empty_region()?,
        };

        unsafe {
            let record_ref = &mut *record.as_ptr();
            let Some(index) = record_ref.take_slot() else {
                unreachable!("region was chosen for having a free slot");
            };

            let slot = record_ref.slot(index);
            slot.cast::<AllocationHeader>().write(AllocationHeader {
                record,
                node: record_ref.node(index),
            });

            tracing::trace!(index, object_size = self.object_size, "pool allocation");

            Ok(slot.add(HEADER_SIZE))
        }
    }

    unsafe fn deallocate(&mut self, pointer: NonNull<u8>) {
        unsafe {
            let header = pointer.sub(HEADER_SIZE).cast::<AllocationHeader>().read();
            let record = header.record;
            let record_ref = &mut *record.as_ptr();

            assert_eq!(
                record_ref.object_size(),
                self.object_size,
                "pointer was not allocated by this pool"
            );

            let index = record_ref.node_index(header.node);
            debug_assert_eq!(record_ref.slot(index), pointer.sub(HEADER_SIZE));

            record_ref.release_slot(index);

            if record_ref.is_empty() && self.regions.len() > 1 {
                self.return_region(record);
            }
        }
    }
}

impl<P: PlatformMemory> Drop for PoolAllocator<'_, P> {
    fn drop(&mut self) {
        while let Some(record) = self.regions.first() {
            unsafe {
                self.regions.remove(record);
                self.free_list.push(record.cast());
            }
        }
    }
}

impl<P: PlatformMemory> fmt::Debug for PoolAllocator<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("object_size", &self.object_size)
            .field("object_count", &self.object_count)
            .field("regions", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::NoCommit;
    use std::collections::HashSet;

    fn free_list() -> RegionFreeList {
        RegionFreeList::new(0x8000)
    }

    #[test]
    fn object_size_valid() {
        let free_list = free_list();
        let pool = PoolAllocator::new(&free_list, 0x200).unwrap();

        assert!(pool.object_size() >= 0x200);
        assert_eq!(0, pool.region_count());
        assert!(pool.object_count() > 0);

        // Rounded up to the default alignment and to hold a free node.
        let small = PoolAllocator::new(&free_list, 1).unwrap();
        assert_eq!(DEFAULT_ALIGNMENT, small.object_size());
    }

    #[test]
    fn objects_larger_than_a_region_are_rejected() {
        let free_list = free_list();

        assert_eq!(Err(Fault::InvalidArgument), PoolAllocator::new(&free_list, 0x8000).map(|_| ()));
    }

    #[test]
    fn single_allocation_deallocation() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 0x200).unwrap();

        let pointer = pool.allocate_default(0x100).unwrap();
        assert_eq!(0, pointer.as_ptr() as usize % DEFAULT_ALIGNMENT);

        unsafe {
            pointer.as_ptr().write_bytes(0xCD, 0x200);
            pool.deallocate(pointer);
        }

        // The only region is kept.
        assert_eq!(1, pool.region_count());
        assert_eq!(pool.object_count(), pool.free_object_count());
    }

    #[test]
    fn invalid_requests() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 0x200).unwrap();

        assert_eq!(Err(Fault::InvalidArgument), pool.allocate_default(0x201).map(|_| ()));
        assert_eq!(Err(Fault::InvalidArgument), pool.allocate(8, 32).map(|_| ()));
        assert_eq!(0, pool.region_count());
    }

    #[test]
    fn requesting_new_memory_region() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 0x200).unwrap();
        let max = pool.object_count();

        for _ in 0..max {
            pool.allocate_default(1).unwrap();
        }
        assert_eq!(1, pool.region_count());

        pool.allocate_default(1).unwrap();
        assert_eq!(2, pool.region_count());
    }

    #[test]
    fn freeing_old_memory_region() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 0x200).unwrap();
        let max = pool.object_count();

        let pointers: Vec<_> = (0..=max).map(|_| pool.allocate_default(1).unwrap()).collect();
        assert_eq!(2, pool.region_count());
        assert!(free_list.is_empty());

        for pointer in &pointers[..max] {
            unsafe { pool.deallocate(*pointer) };
        }

        // The first region was emptied and given back.
        assert_eq!(1, pool.region_count());
        assert_eq!(1, free_list.len());

        unsafe { pool.deallocate(pointers[max]) };
        assert_eq!(1, pool.region_count());
    }

    #[test]
    fn allocations_do_not_overlap() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 48).unwrap();
        let size = pool.object_size();

        let pointers: Vec<_> = (0..pool.object_count() * 2 + 3)
            .map(|index| {
                let pointer = pool.allocate_default(size).unwrap();
                unsafe { pointer.as_ptr().write_bytes(index as u8, size) };
                pointer
            })
            .collect();

        let distinct: HashSet<_> = pointers.iter().map(|pointer| pointer.as_ptr() as usize).collect();
        assert_eq!(pointers.len(), distinct.len());

        for (index, pointer) in pointers.iter().enumerate() {
            let bytes = unsafe { std::slice::from_raw_parts(pointer.as_ptr(), size) };
            assert!(bytes.iter().all(|byte| *byte == index as u8));
        }
    }

    #[test]
    fn freed_blocks_are_reused() {
        let free_list = free_list();
        let mut pool = PoolAllocator::new(&free_list, 64).unwrap();

        let a = pool.allocate_default(64).unwrap();
        let b = pool.allocate_default(64).unwrap();
        let c = pool.allocate_default(64).unwrap();

        unsafe {
            pool.deallocate(b);
            pool.deallocate(a);
        }

        // Lowest address first.
        assert_eq!(a, pool.allocate_default(64).unwrap());
        assert_eq!(b, pool.allocate_default(64).unwrap());
        assert!(pool.allocate_default(64).unwrap() > c);
    }

    #[test]
    fn pools_share_regions() {
        let free_list = free_list();

        {
            let mut small = PoolAllocator::new(&free_list, 32).unwrap();
            small.allocate_default(32).unwrap();
        }
        assert_eq!(1, free_list.len());

        // The region given back by the first pool is reformatted by the second.
        let mut large = PoolAllocator::new(&free_list, 0x400).unwrap();
        let pointer = large.allocate_default(0x400).unwrap();
        assert!(free_list.is_empty());

        unsafe { large.deallocate(pointer) };
        assert_eq!(1, large.region_count());
    }

    #[test]
    #[should_panic(expected = "not allocated by this pool")]
    fn foreign_pointer_panics() {
        let free_list = free_list();
        let mut small = PoolAllocator::new(&free_list, 32).unwrap();
        let mut large = PoolAllocator::new(&free_list, 64).unwrap();

        let pointer = small.allocate_default(8).unwrap();
        unsafe { large.deallocate(pointer) };
    }

    #[test]
    fn free_list_failures_propagate() {
        let free_list: RegionFreeList<NoCommit> = RegionFreeList::new(0x8000);
        let mut pool = PoolAllocator::new(&free_list, 0x200).unwrap();

        assert_eq!(Err(Fault::Platform(-1)), pool.allocate_default(8).map(|_| ()));
        assert_eq!(0, pool.region_count());
        assert!(free_list.is_empty());
    }
}
