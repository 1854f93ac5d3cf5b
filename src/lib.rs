//! Layered allocators built directly on virtual memory.
//!
//! Everything starts with a [`VirtualRegion`]: address space reserved from the
//! kernel and committed page by page. On top of that:
//!
//! - [`RegionFreeList`] keeps idle regions around so they can be reused
//!   without going back to the kernel.
//! - [`PoolAllocator`] serves blocks of one size out of regions taken from a
//!   free list, splitting and merging runs of free slots.
//! - [`HeapAllocator`] routes each request to one pool per power of two size
//!   class, all sharing one free list.
//! - [`FixedAllocator`] serves blocks of one size out of a single region.
//! - [`LinearAllocator`] bumps an offset and frees in bulk through markers.
//!
//! ```text
//! VirtualRegion --> RegionFreeList --> PoolAllocator --> HeapAllocator
//!       |
//!       +---------> FixedAllocator
//!       +---------> LinearAllocator
//! ```
//!
//! None of the allocators is thread safe. Wrap them in a
//! [`BlockingAllocatorProxy`] to share them.

mod allocator;
mod block;
mod blocking;
mod error;
mod fixed;
mod freelist;
mod heap;
mod kernel;
mod linear;
pub mod list;
mod pool;
mod region;
mod utils;

pub use allocator::{Allocator, AllocatorExt, DEFAULT_ALIGNMENT, array_len};
pub use block::HEADER_SIZE;
pub use blocking::BlockingAllocatorProxy;
pub use error::{Fault, Result};
pub use fixed::FixedAllocator;
pub use freelist::{REGION_HEADER_SIZE, RegionFreeList};
pub use heap::{HeapAllocator, HeapConfig, MAX_SIZE_CLASSES};
pub use kernel::{Kernel, PlatformMemory, allocation_granularity, page_size};
pub use linear::LinearAllocator;
pub use pool::PoolAllocator;
pub use region::VirtualRegion;
pub use utils::{align, align_ptr};
