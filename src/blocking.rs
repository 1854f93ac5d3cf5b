use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use parking_lot::Mutex;

use crate::{allocator::Allocator, error::Result};

/// Makes any [`Allocator`] usable from several threads by serializing every
/// call behind one lock.
///
/// The allocators of this crate are single threaded. Wrapping one in a proxy
/// is the only way to share it, and there's nothing finer grained than this
/// single lock.
///
/// The proxy also implements [`GlobalAlloc`], so it can back `Box`, `Vec`
/// and friends for a piece of code (or the whole program, as long as the
/// wrapped allocator can be built in a `static`).
pub struct BlockingAllocatorProxy<A> {
    inner: Mutex<A>,
}

impl<A: Allocator> BlockingAllocatorProxy<A> {
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: Mutex::new(allocator),
        }
    }

    /// Locks the wrapped allocator and calls [`Allocator::allocate`] on it.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.inner.lock().allocate(size, alignment)
    }

    /// Locks the wrapped allocator and calls [`Allocator::deallocate`] on it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::deallocate`].
    pub unsafe fn deallocate(&self, pointer: NonNull<u8>) {
        unsafe { self.inner.lock().deallocate(pointer) }
    }

    /// Runs `f` with the lock held, for anything the proxy doesn't forward.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<A: Allocator> Allocator for BlockingAllocatorProxy<A> {
    #[inline]
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.inner.get_mut().allocate(size, alignment)
    }

    #[inline]
    unsafe fn deallocate(&mut self, pointer: NonNull<u8>) {
        unsafe { self.inner.get_mut().deallocate(pointer) }
    }
}

unsafe impl<A: Allocator + Send> GlobalAlloc for BlockingAllocatorProxy<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match BlockingAllocatorProxy::allocate(self, layout.size(), layout.align()) {
            Ok(pointer) => pointer.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, pointer: *mut u8, _layout: Layout) {
        if let Some(pointer) = NonNull::new(pointer) {
            unsafe { BlockingAllocatorProxy::deallocate(self, pointer) };
        }
    }
}
