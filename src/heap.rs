use std::{fmt, mem, ptr::NonNull};

use crate::{
    allocator::{Allocator, DEFAULT_ALIGNMENT},
    block::{HEADER_SIZE, region_capacity},
    error::{Fault, Result},
    freelist::RegionFreeList,
    kernel::{Kernel, PlatformMemory},
    pool::PoolAllocator,
    utils::{align, align_ptr, ceil_log2},
};

/// Maximum number of size classes a heap can be configured with.
pub const MAX_SIZE_CLASSES: usize = 32;

/// Parameters of a [`HeapAllocator`].
///
/// Every field except `region_count` must be a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HeapConfig {
    /// Usable size of every region shared by the pools.
    pub region_size: usize,
    /// Regions created up front. Best effort, the heap works without them.
    pub region_count: usize,
    /// Block size of the smallest size class.
    pub pool_start: usize,
    /// Block size of the largest size class.
    pub pool_end: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size: 0x40000,
            region_count: 0x10,
            pool_start: 0x20,
            pool_end: 0x10000,
        }
    }
}

impl HeapConfig {
    /// Checks that a heap can be built out of this configuration.
    pub fn validate(&self) -> Result<()> {
        let powers_of_two = [self.region_size, self.pool_start, self.pool_end]
            .iter()
            .all(|value| value.is_power_of_two());

        if !powers_of_two || self.pool_start > self.pool_end {
            return Err(Fault::InvalidArgument);
        }

        if self.size_classes() > MAX_SIZE_CLASSES {
            return Err(Fault::InvalidArgument);
        }

        // The largest class must fit at least once in a region.
        let largest = align(self.pool_end, DEFAULT_ALIGNMENT);
        if region_capacity(self.region_size, HEADER_SIZE + largest) == 0 {
            return Err(Fault::InvalidArgument);
        }

        Ok(())
    }

    /// Number of power of two size classes between `pool_start` and `pool_end`.
    pub fn size_classes(&self) -> usize {
        (self.pool_end.trailing_zeros() - self.pool_start.trailing_zeros()) as usize + 1
    }
}

/// Header written right before every pointer handed out by the heap.
///
/// `raw` is what the pool returned. The pointer given to the user may be
/// further ahead when the requested alignment is larger than
/// [`DEFAULT_ALIGNMENT`].
///
/// ```text
///   raw                               aligned
///    |                                   |
///    v                                   v
///    +-------------+--------------------+-------------------+
///    | padding ... | AllocationHeader   |  user data ...    |
///    +-------------+--------------------+-------------------+
///                   <--- HEADER_SIZE --->
/// ```
struct AllocationHeader<P: PlatformMemory> {
    allocator: NonNull<PoolAllocator<'static, P>>,
    raw: NonNull<u8>,
}

const _: () = assert!(mem::size_of::<AllocationHeader<Kernel>>() <= HEADER_SIZE);

/// General purpose allocator made of one [`PoolAllocator`] per power of two
/// size class, all sharing the same [`RegionFreeList`].
///
/// Requests are served by the smallest class that fits the block plus its
/// header and alignment slack. Deallocation reads the header in front of the
/// pointer and goes straight to the pool that served it.
///
/// ```text
///  HeapAllocator
///   |
///   +--> PoolAllocator (32 B)  ---+
///   +--> PoolAllocator (64 B)  ---+
///   +--> PoolAllocator (128 B) ---+---> RegionFreeList ---> kernel
///   |    ...                      |
///   +--> PoolAllocator (64 KiB) --+
/// ```
pub struct HeapAllocator<P: PlatformMemory = Kernel> {
    /// One pool per size class, smallest first. Never resized after `new`.
    pools: Vec<PoolAllocator<'static, P>>,
    /// Owned. Freed in `drop` after every pool has given its regions back.
    free_list: NonNull<RegionFreeList<P>>,
    /// `log2` of the smallest class.
    min_class: u32,
    /// `log2` of the largest class.
    max_class: u32,
}

// The heap exclusively owns its pools and their free list. None of them is
// reachable from outside without going through `&self` or `&mut self`.
unsafe impl<P: PlatformMemory> Send for HeapAllocator<P> {}

impl HeapAllocator {
    /// Creates a heap with the default [`HeapConfig`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(HeapConfig::default())
    }
}

impl<P: PlatformMemory> HeapAllocator<P> {
    pub fn new(config: HeapConfig) -> Result<Self> {
        config.validate()?;

        let free_list = Box::new(RegionFreeList::<P>::new(config.region_size));
        let reserved = free_list.reserve(config.region_count);

        let free_list = NonNull::from(Box::leak(free_list));

        // SAFETY: the free list is only freed in `drop`, once the pools that
        // borrow it are gone, so it lives as long as any of them.
        let shared: &'static RegionFreeList<P> = unsafe { free_list.as_ref() };

        let min_class = config.pool_start.trailing_zeros();
        let max_class = config.pool_end.trailing_zeros();

        let pools = (min_class..=max_class)
            .map(|class| PoolAllocator::new(shared, 1 << class))
            .collect::<Result<Vec<_>>>();

        let pools = match pools {
            Ok(pools) => pools,
            Err(fault) => {
                unsafe { drop(Box::from_raw(free_list.as_ptr())) };
                return Err(fault);
            }
        };

        tracing::debug!(
            classes = pools.len(),
            pool_start = config.pool_start,
            pool_end = config.pool_end,
            reserved,
            "heap allocator ready"
        );

        Ok(Self {
            pools,
            free_list,
            min_class,
            max_class,
        })
    }

    /// Every pool of the heap, smallest size class first.
    #[inline]
    pub fn pool_allocators(&self) -> &[PoolAllocator<'_, P>] {
        &self.pools
    }

    /// The pool that would serve `allocate(size, alignment)`, or `None` if no
    /// size class is large enough.
    pub fn pool_for_size(&self, size: usize, alignment: usize) -> Option<&PoolAllocator<'_, P>> {
        let (index, _) = self.pool_index(size, alignment).ok()?;

        Some(&self.pools[index])
    }

    /// Free list shared by every pool.
    #[inline]
    pub fn free_list(&self) -> &RegionFreeList<P> {
        unsafe { self.free_list.as_ref() }
    }

    /// Index in `pools` of the class that fits `size` bytes aligned to
    /// `alignment`, header included, along with the bytes to ask that pool for.
    fn pool_index(&self, size: usize, alignment: usize) -> Result<(usize, usize)> {
        let final_size = final_size(size, alignment).ok_or(Fault::OutOfMemory)?;
        let class = ceil_log2(final_size).max(self.min_class);

        if class > self.max_class {
            return Err(Fault::OutOfMemory);
        }

        Ok(((class - self.min_class) as usize, final_size))
    }

    /// Index in `pools` of the pool `allocator` points to.
    fn index_of(&self, allocator: NonNull<PoolAllocator<'static, P>>) -> usize {
        let offset = (allocator.as_ptr() as usize).wrapping_sub(self.pools.as_ptr() as usize);
        let index = offset / mem::size_of::<PoolAllocator<'static, P>>();

        assert!(
            index < self.pools.len() && offset % mem::size_of::<PoolAllocator<'static, P>>() == 0,
            "pointer was not allocated by this heap"
        );

        index
    }
}

/// Bytes asked to a pool for `size` user bytes aligned to `alignment`.
#[inline]
fn final_size(size: usize, alignment: usize) -> Option<usize> {
    let slack = alignment.max(DEFAULT_ALIGNMENT) - DEFAULT_ALIGNMENT;

    size.checked_add(HEADER_SIZE)?.checked_add(slack)
}

impl<P: PlatformMemory> Allocator for HeapAllocator<P> {
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(Fault::InvalidArgument);
        }

        let (index, final_size) = self.pool_index(size, alignment)?;

        let pool = &mut self.pools[index];
        let raw = pool.allocate(final_size, DEFAULT_ALIGNMENT)?;

        unsafe {
            let aligned = align_ptr(raw.add(HEADER_SIZE), alignment);

            aligned.sub(HEADER_SIZE).cast::<AllocationHeader<P>>().write(AllocationHeader {
                allocator: NonNull::from(&mut *pool),
                raw,
            });

            tracing::trace!(size, alignment, class = pool.object_size(), "heap allocation");

            Ok(aligned)
        }
    }

    unsafe fn deallocate(&mut self, pointer: NonNull<u8>) {
        unsafe {
            let header = pointer.sub(HEADER_SIZE).cast::<AllocationHeader<P>>().read();
            let index = self.index_of(header.allocator);

            self.pools[index].deallocate(header.raw);
        }
    }
}

impl<P: PlatformMemory> Drop for HeapAllocator<P> {
    fn drop(&mut self) {
        // Pools give their regions back to the free list, which then releases
        // them all.
        self.pools.clear();

        unsafe { drop(Box::from_raw(self.free_list.as_ptr())) };
    }
}

impl<P: PlatformMemory> fmt::Debug for HeapAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("pool_start", &(1usize << self.min_class))
            .field("pool_end", &(1usize << self.max_class))
            .field("free_list", self.free_list())
            .finish()
    }
}
