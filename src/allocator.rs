use std::{mem, ptr::NonNull};

use crate::{error::Result, utils::align};

/// Default alignment of every allocation, in bytes.
///
/// 16 bytes on every supported target: the x86_64 ABI requires it for SSE
/// data and stack layout, and it's what the system allocators hand out by
/// default. Allocation headers fit in exactly this many bytes.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Common interface of every allocator in the crate.
///
/// Even though each allocator has radically different implementation details,
/// they all provide the same thing: allocating and deallocating portions of
/// memory. This is the only interface consumers depend on.
pub trait Allocator {
    /// Allocates a block of `size` bytes aligned on an `alignment` boundary.
    ///
    /// `alignment` must be a power of two.
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>>;

    /// Deallocates a block previously returned by [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// `pointer` must come from a previous call to `allocate` on this same
    /// allocator and must not have been deallocated already. Otherwise memory
    /// corruption can (and most likely will) occur.
    unsafe fn deallocate(&mut self, pointer: NonNull<u8>);

    /// Allocates `size` bytes with [`DEFAULT_ALIGNMENT`].
    #[inline]
    fn allocate_default(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(size, DEFAULT_ALIGNMENT)
    }
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    #[inline]
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        (**self).allocate(size, alignment)
    }

    #[inline]
    unsafe fn deallocate(&mut self, pointer: NonNull<u8>) {
        unsafe { (**self).deallocate(pointer) }
    }
}

/// Typed helpers layered on top of [`Allocator`].
pub trait AllocatorExt: Allocator {
    /// Allocates room for a `T` and moves `value` into it.
    fn construct<T>(&mut self, value: T) -> Result<NonNull<T>> {
        let pointer = self
            .allocate(mem::size_of::<T>().max(1), mem::align_of::<T>())?
            .cast::<T>();

        unsafe { pointer.write(value) };

        Ok(pointer)
    }

    /// Drops the value behind `object` and deallocates it.
    ///
    /// # Safety
    ///
    /// `object` must come from [`AllocatorExt::construct`] on this allocator.
    unsafe fn destruct<T>(&mut self, object: NonNull<T>) {
        unsafe {
            object.drop_in_place();
            self.deallocate(object.cast());
        }
    }

    /// Allocates an array of `length` default values.
    ///
    /// The length is stored in the word right before the first element, so
    /// [`AllocatorExt::destruct_array`] doesn't need any extra bookkeeping.
    fn construct_array<T: Default>(&mut self, length: usize) -> Result<NonNull<T>> {
        let prefix = array_prefix::<T>();
        let size = mem::size_of::<T>()
            .checked_mul(length)
            .and_then(|size| size.checked_add(prefix))
            .ok_or(crate::Fault::OutOfMemory)?;

        let memory = self.allocate(size, array_alignment::<T>())?;

        unsafe {
            let array = memory.add(prefix).cast::<T>();
            array.cast::<usize>().sub(1).write(length);

            for index in 0..length {
                array.add(index).write(T::default());
            }

            Ok(array)
        }
    }

    /// Drops every element of an array made by [`AllocatorExt::construct_array`]
    /// and deallocates it.
    ///
    /// # Safety
    ///
    /// `array` must come from `construct_array::<T>` on this allocator.
    unsafe fn destruct_array<T>(&mut self, array: NonNull<T>) {
        unsafe {
            let length = array_len(array);

            NonNull::slice_from_raw_parts(array, length).drop_in_place();

            self.deallocate(array.cast::<u8>().sub(array_prefix::<T>()));
        }
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

/// Number of elements of an array made by [`AllocatorExt::construct_array`].
///
/// # Safety
///
/// `array` must come from `construct_array::<T>` and not be destructed yet.
pub unsafe fn array_len<T>(array: NonNull<T>) -> usize {
    unsafe { array.cast::<usize>().sub(1).read() }
}

/// Bytes in front of an array: room for the length, padded so elements stay aligned.
#[inline]
const fn array_prefix<T>() -> usize {
    align(mem::size_of::<usize>(), array_alignment::<T>())
}

#[inline]
const fn array_alignment<T>() -> usize {
    if mem::align_of::<T>() > mem::align_of::<usize>() {
        mem::align_of::<T>()
    } else {
        mem::align_of::<usize>()
    }
}
