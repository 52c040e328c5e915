//! Non-moving space: objects here are never relocated.
//!
//! Allocation bumps through the reservation and reuses swept cells through
//! an exact-size free list. Every allocation is pushed onto an allocation
//! stack; the marking pause freezes that stack and the sweep publishes its
//! entries into the live bitmap, so objects allocated after the pause are
//! invisible to the sweep.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Mmap;

use super::{align_up, reserve};
use crate::accounting::{CardTable, SpaceBitmap};
use crate::error::GcError;
use crate::object::{read_header, OBJECT_ALIGNMENT};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Objects freed.
    pub objects: usize,
    /// Bytes freed.
    pub bytes: usize,
}

/// Arena of objects that keep their address for their whole life.
#[derive(Debug)]
pub struct NonMovingSpace {
    mem: Mmap,
    end: AtomicUsize,
    free_list: Mutex<BTreeMap<usize, Vec<usize>>>,
    bitmaps: [SpaceBitmap; 2],
    live_index: AtomicUsize,
    alloc_stack: Mutex<Vec<usize>>,
    cards: CardTable,
}

impl NonMovingSpace {
    /// Reserves `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Map`] if the reservation fails.
    pub fn new(capacity: usize) -> Result<Self, GcError> {
        let mem = reserve(capacity)?;
        let begin = mem.ptr() as usize;
        let len = mem.len();
        Ok(Self {
            end: AtomicUsize::new(begin),
            free_list: Mutex::new(BTreeMap::new()),
            bitmaps: [
                SpaceBitmap::new("non-moving bitmap 0", begin, len),
                SpaceBitmap::new("non-moving bitmap 1", begin, len),
            ],
            live_index: AtomicUsize::new(0),
            alloc_stack: Mutex::new(Vec::new()),
            cards: CardTable::new(begin, len),
            mem,
        })
    }

    /// First address of the space.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> usize {
        self.mem.ptr() as usize
    }

    /// One past the highest address ever handed out.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// One past the last reservable address.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.mem.end()
    }

    /// `true` if `addr` lies inside the reservation.
    #[inline]
    #[must_use]
    pub fn has_address(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.begin()) < self.mem.len()
    }

    /// Objects that survived the last sweep, plus those published from the
    /// allocation stack.
    #[must_use]
    pub fn live_bitmap(&self) -> &SpaceBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire)]
    }

    /// Objects marked in the current cycle.
    #[must_use]
    pub fn mark_bitmap(&self) -> &SpaceBitmap {
        &self.bitmaps[1 - self.live_index.load(Ordering::Acquire)]
    }

    /// Makes the mark bitmap the live one. The old live bitmap becomes the
    /// next cycle's mark bitmap and is cleared when that cycle starts.
    pub fn swap_bitmaps(&self) {
        self.live_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Card table for the write barrier.
    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Allocates `bytes` (rounded to the object alignment), reusing a free
    /// cell of exactly that size when one exists. The memory is zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] when neither the free list nor the
    /// reservation can satisfy the request.
    pub fn alloc(&self, bytes: usize) -> Result<usize, GcError> {
        let bytes = align_up(bytes, OBJECT_ALIGNMENT);
        let reused = {
            let mut free = self.free_list.lock();
            let cell = free.get_mut(&bytes).and_then(Vec::pop);
            if free.get(&bytes).is_some_and(Vec::is_empty) {
                free.remove(&bytes);
            }
            cell
        };
        let addr = match reused {
            Some(addr) => addr,
            None => self.bump(bytes)?,
        };
        self.alloc_stack.lock().push(addr);
        Ok(addr)
    }

    fn bump(&self, bytes: usize) -> Result<usize, GcError> {
        let limit = self.limit();
        self.end
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |end| {
                (bytes <= limit - end).then_some(end + bytes)
            })
            .map_err(|_| GcError::OutOfMemory {
                space: "non-moving",
                requested: bytes,
            })
    }

    /// Freezes the allocation stack for the sweep and starts a fresh one.
    pub fn swap_alloc_stack(&self) -> Vec<usize> {
        std::mem::take(&mut *self.alloc_stack.lock())
    }

    /// Empties the allocation stack, returning its entries.
    pub fn drain_alloc_stack(&self) -> Vec<usize> {
        self.swap_alloc_stack()
    }

    /// Objects allocated since the last swap.
    #[must_use]
    pub fn alloc_stack_snapshot(&self) -> Vec<usize> {
        self.alloc_stack.lock().clone()
    }

    /// Publishes frozen allocation-stack entries into the live bitmap.
    pub fn mark_alloc_stack_as_live(&self, stack: &[usize]) {
        let live = self.live_bitmap();
        for &obj in stack {
            live.set(obj);
        }
    }

    /// Frees every live object that is not marked: the cell is zeroed and
    /// put on the free list.
    ///
    /// # Safety
    ///
    /// Every bit in the live bitmap must denote a valid object, and no
    /// mutator may still reach an unmarked one.
    pub unsafe fn sweep(&self) -> SweepResult {
        let live = self.live_bitmap();
        let mark = self.mark_bitmap();
        let mut dead = Vec::new();
        live.visit_marked_range(self.begin(), self.end(), |obj| {
            if !mark.test(obj) {
                dead.push(obj);
            }
        });
        let mut result = SweepResult::default();
        let mut free = self.free_list.lock();
        for obj in dead {
            // SAFETY: `obj` is a dead but valid object.
            let size = align_up(unsafe { read_header(obj) }.size(), OBJECT_ALIGNMENT);
            // SAFETY: nobody references the cell any more.
            unsafe { std::ptr::write_bytes(obj as *mut u8, 0, size) };
            live.clear(obj);
            free.entry(size).or_default().push(obj);
            result.objects += 1;
            result.bytes += size;
        }
        result
    }

    /// Bytes currently on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_list
            .lock()
            .iter()
            .map(|(size, cells)| size * cells.len())
            .sum()
    }

    /// Calls `visitor` with every object in the live bitmap or on the
    /// allocation stack, in address order.
    pub fn for_each_object(&self, mut visitor: impl FnMut(usize)) {
        let mut objects = Vec::new();
        self.live_bitmap()
            .visit_marked_range(self.begin(), self.end(), |obj| objects.push(obj));
        objects.extend(self.alloc_stack.lock().iter().copied());
        objects.sort_unstable();
        objects.dedup();
        for obj in objects {
            visitor(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{write_header, Header, ObjectKind};

    fn alloc_obj(space: &NonMovingSpace, size: usize) -> usize {
        let addr = space.alloc(size).unwrap();
        unsafe { write_header(addr, Header::new(size, 0, ObjectKind::Plain)) };
        addr
    }

    #[test]
    fn test_sweep_frees_unmarked_into_free_list() {
        let space = NonMovingSpace::new(1 << 16).unwrap();
        let a = alloc_obj(&space, 32);
        let b = alloc_obj(&space, 32);
        let c = alloc_obj(&space, 48);

        let stack = space.swap_alloc_stack();
        space.mark_bitmap().set(a);
        space.mark_alloc_stack_as_live(&stack);
        let result = unsafe { space.sweep() };
        assert_eq!(result, SweepResult { objects: 2, bytes: 80 });
        assert_eq!(space.free_bytes(), 80);
        space.swap_bitmaps();
        assert!(space.live_bitmap().test(a));
        assert!(!space.live_bitmap().test(b));

        // Exact-size reuse hands back the zeroed cell.
        let reused = space.alloc(48).unwrap();
        assert_eq!(reused, c);
        assert_eq!(unsafe { read_header(reused) }.raw(), 0);
    }

    #[test]
    fn test_allocations_after_freeze_survive_sweep() {
        let space = NonMovingSpace::new(1 << 16).unwrap();
        let _frozen = space.swap_alloc_stack();
        let young = alloc_obj(&space, 16);
        let result = unsafe { space.sweep() };
        assert_eq!(result.objects, 0);
        assert_eq!(space.drain_alloc_stack(), vec![young]);
    }

    #[test]
    fn test_out_of_memory() {
        let page = sys_alloc::page_size();
        let space = NonMovingSpace::new(page).unwrap();
        assert!(space.alloc(page).is_ok());
        assert!(matches!(
            space.alloc(8),
            Err(GcError::OutOfMemory { space: "non-moving", .. })
        ));
    }
}
