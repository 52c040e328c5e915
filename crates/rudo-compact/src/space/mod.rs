//! Heap spaces.
//!
//! The collector only relocates objects in the [`BumpPointerSpace`]. The
//! other spaces keep their objects in place and are visited so that their
//! reference slots can be rewritten.

mod bump_pointer;
mod immune;
mod large_object;
mod non_moving;

pub use bump_pointer::BumpPointerSpace;
pub use immune::ImmuneSpace;
pub use large_object::LargeObjectSpace;
pub use non_moving::{NonMovingSpace, SweepResult};

use sys_alloc::{Mmap, MmapOptions};

use crate::error::GcError;

/// Rounds `value` up to a multiple of `alignment`, a power of two.
#[inline]
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment`, a power of two.
#[inline]
#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Reserves a page-aligned anonymous region for a space.
pub(crate) fn reserve(capacity: usize) -> Result<Mmap, GcError> {
    let len = align_up(capacity.max(1), sys_alloc::page_size());
    // SAFETY: the mapping is owned by the returned `Mmap` and every space
    // keeps it alive for as long as it hands out addresses inside it.
    let mem = unsafe { MmapOptions::new().len(len).no_reserve(true).map_anon()? };
    Ok(mem)
}
