use std::{fmt, mem, ptr::NonNull};

use crate::{
    allocator::Allocator,
    error::{Fault, Result},
    kernel::{Kernel, PlatformMemory},
    region::VirtualRegion,
    utils::align,
};

/// Stored in memory in place of a missing previous marker.
const NO_MARKER: usize = usize::MAX;

/// Bump allocator over one region, with a stack of markers to free everything
/// allocated after a given point at once.
///
/// Individual blocks are never freed: [`Allocator::deallocate`] does nothing.
/// Memory comes back either through [`LinearAllocator::pop_marker`] or
/// [`LinearAllocator::reset`]. Every pointer handed out after the point being
/// rewound to is invalid afterwards.
///
/// Markers are stored inside the region itself. Pushing one allocates a word
/// holding the previous marker, so the stack costs no extra memory:
///
/// ```text
///                    marker                        offset
///                      |                             |
///                      v                             v
/// +-------------------+----------+------------------+-----------+
/// | allocations ...   | previous |  allocations ... |   free    |
/// +-------------------+----------+------------------+-----------+
/// ```
pub struct LinearAllocator<P: PlatformMemory = Kernel> {
    region: VirtualRegion<P>,
    base: NonNull<u8>,
    /// Committed bytes.
    size: usize,
    /// Start of the free part of the region.
    offset: usize,
    /// Offset the last pushed marker rewinds to.
    marker: Option<usize>,
    /// Number of markers pushed.
    depth: usize,
}

// The allocator exclusively owns its region.
unsafe impl<P: PlatformMemory> Send for LinearAllocator<P> {}

impl<P: PlatformMemory> LinearAllocator<P> {
    /// Creates an allocator over a region of `size` bytes, committed right away.
    pub fn new(size: usize) -> Result<Self> {
        let mut region = VirtualRegion::new(size);
        let base = region.claim()?;
        let size = region.current_size();

        tracing::debug!(base = ?base, size, "linear allocator ready");

        Ok(Self {
            region,
            base,
            size,
            offset: 0,
            marker: None,
            depth: 0,
        })
    }

    /// Remembers the current offset. The next [`LinearAllocator::pop_marker`]
    /// frees everything allocated after this call.
    ///
    /// Fails with [`Fault::OutOfMemory`], leaving everything untouched, if
    /// there's no room left for the marker itself.
    pub fn push_marker(&mut self) -> Result<()> {
        let offset = self.offset;
        let slot = self.allocate(mem::size_of::<usize>(), mem::align_of::<usize>())?;

        unsafe { slot.cast::<usize>().write(self.marker.unwrap_or(NO_MARKER)) };

        self.marker = Some(offset);
        self.depth += 1;

        Ok(())
    }

    /// Frees everything allocated since the last [`LinearAllocator::push_marker`]
    /// and makes the marker before it the current one.
    ///
    /// Without any marker this is the same as [`LinearAllocator::reset`].
    pub fn pop_marker(&mut self) {
        let Some(marker) = self.marker else {
            self.reset();
            return;
        };

        // The base is page aligned, so the word sits at the next aligned offset.
        let slot = align(marker, mem::align_of::<usize>());
        let previous = unsafe { self.base.add(slot).cast::<usize>().read() };

        self.offset = marker;
        self.marker = (previous != NO_MARKER).then_some(previous);
        self.depth -= 1;
    }

    /// Frees everything and drops every marker.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.marker = None;
        self.depth = 0;
    }

    /// Committed size of the region.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes in use, markers included.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of markers currently pushed.
    #[inline]
    pub fn marker_depth(&self) -> usize {
        self.depth
    }
}

impl<P: PlatformMemory> Allocator for LinearAllocator<P> {
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(Fault::InvalidArgument);
        }

        let base = self.base.as_ptr() as usize;
        let aligned = align(base + self.offset, alignment) - base;

        let end = aligned
            .checked_add(size)
            .filter(|end| *end <= self.size)
            .ok_or(Fault::OutOfMemory)?;

        self.offset = end;

        Ok(unsafe { self.base.add(aligned) })
    }

    /// Does nothing. See [`LinearAllocator::pop_marker`].
    #[inline]
    unsafe fn deallocate(&mut self, _pointer: NonNull<u8>) {}
}

impl<P: PlatformMemory> fmt::Debug for LinearAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("markers", &self.depth)
            .field("region", &self.region)
            .finish()
    }
}
