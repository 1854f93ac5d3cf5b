use std::{fmt, mem, ptr::NonNull};

use crate::{
    allocator::Allocator,
    error::{Fault, Result},
    kernel::{Kernel, PlatformMemory},
    list::Link,
    region::VirtualRegion,
    utils::{align, align_ptr, distance},
};

/// Link stored inside every free node.
struct FreeBlock {
    next: Link<FreeBlock>,
}

/// Hands out blocks of one fixed size from a single region.
///
/// The whole region is committed and cut into nodes when the allocator is
/// created, so it never grows. Free nodes are linked through their own memory:
///
/// ```text
///          free
///           |
///           v
/// +------+------+------+------+------+------+
/// | used | free | used | free | free | used |
/// +------+------+------+------+------+------+
///           |             ^  |    ^
///           +-------------+  +----+
/// ```
///
/// Both operations are O(1). Deallocation doesn't check that the pointer
/// belongs to this allocator.
pub struct FixedAllocator<P: PlatformMemory = Kernel> {
    region: VirtualRegion<P>,
    /// First free node, or `None` if every node is allocated.
    free: Link<FreeBlock>,
    /// Size requested at construction.
    object_size: usize,
    /// Distance between two nodes.
    node_size: usize,
    /// Alignment of every node.
    alignment: usize,
    /// Total number of nodes.
    capacity: usize,
    /// Nodes currently in the free list.
    available: usize,
}

// The allocator exclusively owns its region and the nodes inside it.
unsafe impl<P: PlatformMemory> Send for FixedAllocator<P> {}

impl<P: PlatformMemory> FixedAllocator<P> {
    /// Creates an allocator of `object_size` byte blocks aligned to `alignment`
    /// inside a region of `size` bytes.
    ///
    /// Fails with [`Fault::InvalidArgument`] if `alignment` is not a power of
    /// two or if not even one block fits, and with whatever the region reports
    /// if it can't be committed.
    pub fn new(size: usize, object_size: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() || object_size == 0 {
            return Err(Fault::InvalidArgument);
        }

        // Free nodes have to hold a link.
        let alignment = alignment.max(mem::align_of::<FreeBlock>());
        let node_size = align(object_size.max(mem::size_of::<FreeBlock>()), alignment);

        let mut region = VirtualRegion::new(size);
        let base = region.claim()?;

        let start = align_ptr(base, alignment);
        let span = region.current_size().saturating_sub(distance(start, base));
        let capacity = span / node_size;

        if capacity == 0 {
            return Err(Fault::InvalidArgument);
        }

        let mut free = None;

        // Last node first, so the lowest address ends up at the head.
        for index in (0..capacity).rev() {
            unsafe {
                let node = start.add(index * node_size).cast::<FreeBlock>();
                node.write(FreeBlock { next: free });
                free = Some(node);
            }
        }

        tracing::debug!(object_size, node_size, capacity, "fixed allocator ready");

        Ok(Self {
            region,
            free,
            object_size,
            node_size,
            alignment,
            capacity,
            available: capacity,
        })
    }

    /// Size of the blocks as requested at construction.
    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Actual distance between two blocks, alignment included.
    #[inline]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Number of blocks the allocator was created with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks that can still be allocated.
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }
}

impl<P: PlatformMemory> Allocator for FixedAllocator<P> {
    /// Pops a free block.
    ///
    /// `size` can be anything up to the object size, and `alignment` anything
    /// up to the alignment the allocator was created with.
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if size > self.object_size || !alignment.is_power_of_two() || alignment > self.alignment {
            return Err(Fault::InvalidArgument);
        }

        let node = self.free.ok_or(Fault::OutOfMemory)?;

        unsafe {
            self.free = node.as_ref().next;
        }
        self.available -= 1;

        Ok(node.cast())
    }

    unsafe fn deallocate(&mut self, pointer: NonNull<u8>) {
        let node = pointer.cast::<FreeBlock>();

        unsafe { node.write(FreeBlock { next: self.free }) };

        self.free = Some(node);
        self.available += 1;
    }
}

impl<P: PlatformMemory> fmt::Debug for FixedAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedAllocator")
            .field("object_size", &self.object_size)
            .field("node_size", &self.node_size)
            .field("available", &self.available)
            .field("capacity", &self.capacity)
            .field("region", &self.region)
            .finish()
    }
}
