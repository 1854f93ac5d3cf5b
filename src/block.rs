use std::{mem, ptr::NonNull};

use crate::{
    allocator::DEFAULT_ALIGNMENT,
    list::{Link, Linked},
    utils::align,
};

/// Bytes reserved in front of every pointer handed out by a
/// [`PoolAllocator`](crate::PoolAllocator) or a [`HeapAllocator`](crate::HeapAllocator).
///
/// Headers are at most this large, so the pointer that follows them keeps the
/// [`DEFAULT_ALIGNMENT`] of the slot.
pub const HEADER_SIZE: usize = DEFAULT_ALIGNMENT;

const _: () = assert!(mem::size_of::<AllocationHeader>() <= HEADER_SIZE);
const _: () = assert!(mem::size_of::<FreeNode>() <= HEADER_SIZE);

/// Marks the absence of a neighbouring [`PoolNode`].
const NO_NODE: u32 = u32::MAX;

/// Every region a pool allocator takes from the free list is laid out like
/// this. The record and the node array are written in place when the region is
/// taken; nothing about the region lives outside of it.
///
/// ```text
/// +----------------+ <- region base
/// |  RegionRecord  |
/// +----------------+
/// |   PoolNode 0   |
/// |   PoolNode 1   |
/// |      ...       |
/// | PoolNode N - 1 |
/// +----------------+ <- slots (DEFAULT_ALIGNMENT aligned)
/// |     Slot 0     |  header + object
/// |     Slot 1     |
/// |      ...       |
/// |   Slot N - 1   |
/// +----------------+
/// ```
///
/// A slot starts with an [`AllocationHeader`] while it is allocated, or with
/// a [`FreeNode`] while it's the first slot of a free run. Whatever the user
/// stored there is overwritten once the slot is freed.
pub(crate) struct RegionRecord {
    /// Next region owned by the same pool.
    next: Link<RegionRecord>,
    /// Previous region owned by the same pool.
    previous: Link<RegionRecord>,
    /// First free run, lowest address first.
    free_nodes: Link<FreeNode>,
    /// Number of free slots.
    free_count: usize,
    /// Number of slots in the region.
    capacity: usize,
    /// Object size of the owning pool, used to catch pointers handed to the
    /// wrong pool.
    object_size: usize,
    /// Distance between two slots.
    stride: usize,
    nodes: NonNull<PoolNode>,
    slots: NonNull<u8>,
}

/// Describes a run of contiguous slots.
///
/// Only the node of the first slot of a run is meaningful; together those
/// nodes partition the slots of the region. An allocated slot is always a run
/// of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolNode {
    /// Number of slots in the run.
    size: u32,
    /// Index of the first slot of the previous run, or [`NO_NODE`].
    previous: u32,
    free: bool,
}

/// Link of the free run chain, stored in the first slot of every free run.
pub(crate) struct FreeNode {
    next: Link<FreeNode>,
}

/// Stored right before every pointer handed out by a pool. It makes
/// deallocation O(1): no lookup is needed to find where the pointer came from.
#[derive(Clone, Copy)]
pub(crate) struct AllocationHeader {
    pub record: NonNull<RegionRecord>,
    pub node: NonNull<PoolNode>,
}

impl Linked for RegionRecord {
    fn next(&self) -> Link<Self> {
        self.next
    }

    fn previous(&self) -> Link<Self> {
        self.previous
    }

    fn set_next(&mut self, next: Link<Self>) {
        self.next = next;
    }

    fn set_previous(&mut self, previous: Link<Self>) {
        self.previous = previous;
    }
}

/// Offset of the node array from the region base.
const NODES_OFFSET: usize = align(mem::size_of::<RegionRecord>(), mem::align_of::<PoolNode>());

/// Offset of the first slot from the region base for a region of `capacity` slots.
const fn slots_offset(capacity: usize) -> usize {
    align(NODES_OFFSET + capacity * mem::size_of::<PoolNode>(), DEFAULT_ALIGNMENT)
}

/// Number of slots of `stride` bytes that fit in a region of `region_size` bytes.
pub(crate) fn region_capacity(region_size: usize, stride: usize) -> usize {
    let Some(available) = region_size.checked_sub(NODES_OFFSET) else {
        return 0;
    };

    let mut capacity = (available / (stride + mem::size_of::<PoolNode>())).min(NO_NODE as usize - 1);

    // The estimate ignores the padding in front of the slots.
    while capacity > 0 && slots_offset(capacity) + capacity * stride > region_size {
        capacity -= 1;
    }

    capacity
}

impl RegionRecord {
    /// Lays out a region that was just taken from the free list: every slot is
    /// part of a single free run.
    ///
    /// # Safety
    ///
    /// `base` must be [`DEFAULT_ALIGNMENT`] aligned and valid for writes over
    /// the span computed by [`region_capacity`] for `capacity` and `stride`.
    pub(crate) unsafe fn format(
        base: NonNull<u8>,
        capacity: usize,
        object_size: usize,
        stride: usize,
    ) -> NonNull<RegionRecord> {
        debug_assert!(capacity > 0);

        unsafe {
            let record = base.cast::<RegionRecord>();
            let nodes = base.add(NODES_OFFSET).cast::<PoolNode>();
            let slots = base.add(slots_offset(capacity));

            nodes.write(PoolNode {
                size: capacity as u32,
                previous: NO_NODE,
                free: true,
            });

            let free = slots.cast::<FreeNode>();
            free.write(FreeNode { next: None });

            record.write(RegionRecord {
                next: None,
                previous: None,
                free_nodes: Some(free),
                free_count: capacity,
                capacity,
                object_size,
                stride,
                nodes,
                slots,
            });

            record
        }
    }

    #[inline]
    pub(crate) fn has_free_slot(&self) -> bool {
        self.free_nodes.is_some()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.free_count == self.capacity
    }

    #[inline]
    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    /// Start of slot `index`.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.capacity);

        unsafe { self.slots.add(index * self.stride) }
    }

    #[inline]
    pub(crate) fn node(&self, index: usize) -> NonNull<PoolNode> {
        debug_assert!(index < self.capacity);

        unsafe { self.nodes.add(index) }
    }

    /// Index of the slot a node describes.
    #[inline]
    pub(crate) fn node_index(&self, node: NonNull<PoolNode>) -> usize {
        let index = (node.as_ptr() as usize - self.nodes.as_ptr() as usize) / mem::size_of::<PoolNode>();
        assert!(index < self.capacity, "pool node does not belong to this region");

        index
    }

    #[inline]
    fn run(&self, index: usize) -> PoolNode {
        unsafe { self.node(index).read() }
    }

    #[inline]
    fn run_mut(&mut self, index: usize) -> &mut PoolNode {
        unsafe { &mut *self.node(index).as_ptr() }
    }

    #[inline]
    fn free_node(&self, index: usize) -> NonNull<FreeNode> {
        self.slot(index).cast()
    }

    /// Takes the first slot of the lowest free run and returns its index.
    ///
    /// A run longer than one slot is split: its first slot is handed out and
    /// the rest becomes a new free run linked right after it.
    ///
    /// # Safety
    ///
    /// The record must describe a live, formatted region.
    pub(crate) unsafe fn take_slot(&mut self) -> Option<usize> {
        let head = self.free_nodes?;
        let index = (head.as_ptr() as usize - self.slots.as_ptr() as usize) / self.stride;
        let run = self.run(index);
        assert!(run.free, "free list points at an allocated slot");

        let next_free = unsafe { head.as_ref().next };

        if run.size > 1 {
            let rest = index + 1;
            let end = index + run.size as usize;

            *self.run_mut(rest) = PoolNode {
                size: run.size - 1,
                previous: index as u32,
                free: true,
            };

            if end < self.capacity {
                self.run_mut(end).previous = rest as u32;
            }

            let rest_free = self.free_node(rest);
            unsafe { rest_free.write(FreeNode { next: next_free }) };
            self.free_nodes = Some(rest_free);
        } else {
            self.free_nodes = next_free;
        }

        let node = self.run_mut(index);
        node.size = 1;
        node.free = false;

        self.free_count -= 1;

        Some(index)
    }

    /// Gives slot `index` back, merging it with the free runs right before and
    /// right after it.
    ///
    /// # Safety
    ///
    /// The record must describe a live, formatted region and slot `index` must
    /// not be used after this call.
    pub(crate) unsafe fn release_slot(&mut self, index: usize) {
        let run = self.run(index);
        assert!(!run.free && run.size == 1, "double free of pool slot {index}");
        assert!(self.free_count < self.capacity, "free slot count exceeds capacity");

        let slot = self.slot(index).as_ptr() as usize;

        // Free runs are sorted by address. Find the ones around this slot.
        let mut before: Link<FreeNode> = None;
        let mut after = self.free_nodes;

        while let Some(free) = after {
            if free.as_ptr() as usize > slot {
                break;
            }

            before = Some(free);
            after = unsafe { free.as_ref().next };
        }

        let mut size = 1;

        // Absorb the run that follows. Its free node is necessarily `after`.
        let following = index + 1;
        if following < self.capacity && self.run(following).free {
            debug_assert_eq!(after, Some(self.free_node(following)));

            size += self.run(following).size;
            after = unsafe { self.free_node(following).as_ref().next };
        }

        let start = match run.previous {
            // Join the run that precedes. Its free node is necessarily `before`.
            previous if previous != NO_NODE && self.run(previous as usize).free => {
                let previous = previous as usize;
                debug_assert_eq!(before, Some(self.free_node(previous)));

                self.run_mut(previous).size += size;
                unsafe { self.free_node(previous).as_mut().next = after };

                // Stale, but lets a second free of this slot be caught.
                self.run_mut(index).free = true;

                previous
            }
            _ => {
                *self.run_mut(index) = PoolNode {
                    size,
                    previous: run.previous,
                    free: true,
                };

                let mut free = self.free_node(index);
                unsafe { free.as_mut().next = after };

                match before {
                    Some(mut before) => unsafe { before.as_mut().next = Some(free) },
                    None => self.free_nodes = Some(free),
                }

                index
            }
        };

        let end = start + self.run(start).size as usize;
        if end < self.capacity {
            self.run_mut(end).previous = start as u32;
        }

        self.free_count += 1;
    }

    /// Lengths of the free runs in address order.
    #[cfg(test)]
    pub(crate) fn free_runs(&self) -> Vec<usize> {
        let mut runs = Vec::new();
        let mut current = self.free_nodes;

        while let Some(free) = current {
            let index = (free.as_ptr() as usize - self.slots.as_ptr() as usize) / self.stride;
            runs.push(self.run(index).size as usize);
            current = unsafe { free.as_ref().next };
        }

        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A region formatted inside a plain buffer.
    struct Fixture {
        _buffer: Vec<u128>,
        record: NonNull<RegionRecord>,
    }

    impl Fixture {
        fn new(region_size: usize, stride: usize) -> Self {
            let mut buffer = vec![0u128; region_size / mem::size_of::<u128>()];
            let capacity = region_capacity(region_size, stride);
            let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
            let record = unsafe { RegionRecord::format(base, capacity, stride - HEADER_SIZE, stride) };

            Self { _buffer: buffer, record }
        }

        fn record(&mut self) -> &mut RegionRecord {
            unsafe { self.record.as_mut() }
        }
    }

    #[test]
    fn capacity_fits_region() {
        for (region_size, stride) in [(0x1000, 32), (0x8000, 0x210), (0x200, 0x200)] {
            let capacity = region_capacity(region_size, stride);

            assert!(slots_offset(capacity) + capacity * stride <= region_size);
            // One more would not fit.
            assert!(slots_offset(capacity + 1) + (capacity + 1) * stride > region_size);
        }

        assert_eq!(0, region_capacity(0x40, 0x40));
    }

    #[test]
    fn slots_are_handed_out_in_address_order() {
        let mut fixture = Fixture::new(0x1000, 64);
        let record = fixture.record();
        let capacity = record.capacity;

        for expected in 0..capacity {
            assert_eq!(Some(expected), unsafe { record.take_slot() });
            assert_eq!(0, record.slot(expected).as_ptr() as usize % DEFAULT_ALIGNMENT);
        }

        assert_eq!(None, unsafe { record.take_slot() });
        assert_eq!(0, record.free_count());
        assert!(!record.has_free_slot());
    }

    #[test]
    fn freed_slots_coalesce() {
        let mut fixture = Fixture::new(0x1000, 64);
        let record = fixture.record();
        let capacity = record.capacity;

        for _ in 0..5 {
            unsafe { record.take_slot() };
        }
        assert_eq!(vec![capacity - 5], record.free_runs());

        unsafe {
            record.release_slot(1);
            record.release_slot(3);
        }
        assert_eq!(vec![1, 1, capacity - 5], record.free_runs());

        // Joins slot 1 on the left and slot 3 on the right.
        unsafe { record.release_slot(2) };
        assert_eq!(vec![3, capacity - 5], record.free_runs());

        // Joins everything into one run.
        unsafe { record.release_slot(4) };
        assert_eq!(vec![4 + capacity - 5], record.free_runs());

        unsafe { record.release_slot(0) };
        assert_eq!(vec![capacity], record.free_runs());
        assert!(record.is_empty());
    }

    #[test]
    fn lowest_free_slot_is_reused_first() {
        let mut fixture = Fixture::new(0x1000, 64);
        let record = fixture.record();

        for _ in 0..4 {
            unsafe { record.take_slot() };
        }

        unsafe {
            record.release_slot(2);
            record.release_slot(0);
        }

        assert_eq!(Some(0), unsafe { record.take_slot() });
        assert_eq!(Some(2), unsafe { record.take_slot() });
        assert_eq!(Some(4), unsafe { record.take_slot() });
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut fixture = Fixture::new(0x1000, 64);
        let record = fixture.record();

        unsafe {
            record.take_slot();
            record.take_slot();
            record.release_slot(0);
            record.release_slot(0);
        }
    }
}
