//! This file contains all the helper functions for the allocators.
//! This are functions that don't particularly belong to any concrete module of the program.

use std::ptr::NonNull;

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// This method is used to align region sizes to be a multiple of
/// [`crate::kernel::page_size`] and offsets inside regions to the alignment the
/// caller requested.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but for pointers. The provenance of `pointer` is kept.
#[inline]
pub fn align_ptr(pointer: NonNull<u8>, alignment: usize) -> NonNull<u8> {
    let address = pointer.as_ptr() as usize;
    let offset = align(address, alignment) - address;

    unsafe { pointer.add(offset) }
}

/// Number of bytes between `base` and `pointer`. `pointer` must not be below `base`.
#[inline]
pub fn distance(pointer: NonNull<u8>, base: NonNull<u8>) -> usize {
    pointer.as_ptr() as usize - base.as_ptr() as usize
}

/// Base 2 logarithm of the smallest power of two that is greater or equal to `value`.
#[inline]
pub const fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}
