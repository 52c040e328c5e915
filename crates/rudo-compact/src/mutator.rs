//! Mutator handles.
//!
//! A [`Mutator`] registers the calling thread with a heap and is the only
//! way to allocate in the moving space or to read and write object fields.
//! Every operation runs inside a *runnable* section, during which the
//! collector cannot pause the thread except at a safepoint. Allocation is
//! a safepoint; field accesses are not.
//!
//! `ObjRef`s held in local variables go stale when a cycle compacts the
//! heap. Only values kept in root slots ([`Mutator::push_root`], global
//! roots) are rewritten. A typical sequence re-reads its roots after every
//! allocation:
//!
//! ```
//! use rudo_compact::{GcConfig, Heap};
//!
//! let heap = Heap::new(GcConfig::default().moving_space_capacity(1 << 20)).unwrap();
//! let mutator = heap.attach_mutator();
//! let parent = mutator.alloc(1, 0).unwrap();
//! let slot = mutator.push_root(Some(parent));
//! let child = mutator.alloc(0, 1).unwrap();
//! let parent = mutator.root(slot).unwrap();
//! unsafe { mutator.write_ref(parent, 0, Some(child)) };
//! ```

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::GcError;
use crate::heap::Heap;
use crate::object::{
    load_slot, object_size, read_header, slot_offset, store_slot, write_header, Header, ObjRef,
    ObjectKind, HEADER_SIZE, REF_SIZE,
};
use crate::sync::LockGuard;
use crate::thread::{ThreadControlBlock, Tlab};

thread_local!(static RUNNABLE_DEPTH: Cell<usize> = const { Cell::new(0) });

/// `true` while the calling thread is inside a runnable section of any
/// mutator.
pub(crate) fn in_runnable_section() -> bool {
    RUNNABLE_DEPTH.with(Cell::get) > 0
}

/// A registered mutator thread.
///
/// Detaches from the heap when dropped.
pub struct Mutator {
    heap: Arc<Heap>,
    tcb: Arc<ThreadControlBlock>,
    depth: Cell<usize>,
    order: RefCell<Option<LockGuard>>,
    // The mutator lock is held per thread.
    _not_send: PhantomData<*const ()>,
}

/// Keeps the owning mutator runnable. Sections nest.
#[must_use = "the thread turns native again when the guard is dropped"]
pub struct RunnableGuard<'a> {
    mutator: &'a Mutator,
}

impl Drop for RunnableGuard<'_> {
    fn drop(&mut self) {
        self.mutator.leave_runnable();
    }
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>) -> Self {
        let tcb = heap.threads.register();
        Self {
            heap,
            tcb,
            depth: Cell::new(0),
            order: RefCell::new(None),
            _not_send: PhantomData,
        }
    }

    /// The heap this mutator is attached to.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Registry id of this thread.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.tcb.id()
    }

    /// Enters a runnable section. Blocks while every mutator is suspended.
    pub fn runnable(&self) -> RunnableGuard<'_> {
        if self.depth.get() == 0 {
            let order = self.heap.threads.transition_to_runnable(&self.tcb);
            *self.order.borrow_mut() = Some(order);
        }
        self.depth.set(self.depth.get() + 1);
        RUNNABLE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        RunnableGuard { mutator: self }
    }

    fn leave_runnable(&self) {
        RUNNABLE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            // SAFETY: pairs with the transition taken when the depth left
            // zero.
            unsafe { self.heap.threads.transition_to_native(&self.heap, &self.tcb) };
            self.order.borrow_mut().take();
        }
    }

    /// Runs pending checkpoints and lets a pending pause proceed.
    pub fn safepoint(&self) {
        let _runnable = self.runnable();
        self.heap.threads.safepoint(&self.heap, &self.tcb);
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocates an object with `num_refs` null reference slots and
    /// `payload_words` zero words. Objects of at least
    /// `large_object_pages` pages go to the large-object space, everything
    /// else to the moving space.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] when the space is exhausted. No
    /// collection is triggered.
    pub fn alloc(&self, num_refs: usize, payload_words: usize) -> Result<ObjRef, GcError> {
        self.alloc_moving(num_refs, payload_words, ObjectKind::Plain)
    }

    /// Allocates a weak reference object whose slot 0 holds `referent`.
    ///
    /// # Errors
    ///
    /// As for [`Mutator::alloc`].
    pub fn alloc_reference(&self, referent: Option<ObjRef>) -> Result<ObjRef, GcError> {
        let _runnable = self.runnable();
        let reference = self.alloc_moving(1, 0, ObjectKind::WeakReference)?;
        // SAFETY: `reference` was just allocated and no safepoint followed.
        unsafe { self.write_ref(reference, 0, referent) };
        Ok(reference)
    }

    fn alloc_moving(&self, num_refs: usize, payload_words: usize, kind: ObjectKind) -> Result<ObjRef, GcError> {
        let size = object_size(num_refs, payload_words);
        if size >= self.heap.config.large_object_pages * self.heap.page_size {
            return self.alloc_large_with_kind(num_refs, payload_words, kind);
        }
        let _runnable = self.runnable();
        self.heap.threads.safepoint(&self.heap, &self.tcb);
        let addr = self.tcb.with_data(|data| self.bump_tlab(&mut data.tlab, size))?;
        // Installs the page first when a compaction is running, so the
        // relocated contents cannot overwrite the header.
        self.heap.ensure(addr, size);
        // SAFETY: fresh, zeroed memory owned by this thread's TLAB.
        unsafe {
            write_header(addr, Header::new(size, num_refs, kind));
            Ok(ObjRef::new_unchecked(addr))
        }
    }

    fn bump_tlab(&self, tlab: &mut Tlab, size: usize) -> Result<usize, GcError> {
        if let Some(addr) = tlab.alloc(size) {
            return Ok(addr);
        }
        tlab.revoke();
        let bytes = self.heap.config.tlab_size.max(size);
        let start = self.heap.moving.alloc_tlab(bytes).ok_or(GcError::OutOfMemory {
            space: "moving",
            requested: size,
        })?;
        *tlab = Tlab {
            start,
            pos: start + size,
            end: start + bytes,
        };
        Ok(start)
    }

    /// Allocates an object in the non-moving space. Its address never
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] when the space is exhausted.
    pub fn alloc_non_moving(&self, num_refs: usize, payload_words: usize) -> Result<ObjRef, GcError> {
        let size = object_size(num_refs, payload_words);
        let _runnable = self.runnable();
        self.heap.threads.safepoint(&self.heap, &self.tcb);
        let addr = self.heap.non_moving.alloc(size)?;
        // SAFETY: fresh and zeroed. The collector reads the header only
        // after this thread's next safepoint.
        unsafe {
            write_header(addr, Header::new(size, num_refs, ObjectKind::Plain));
            Ok(ObjRef::new_unchecked(addr))
        }
    }

    /// Allocates an object in its own mapping.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Map`] if the mapping fails.
    pub fn alloc_large(&self, num_refs: usize, payload_words: usize) -> Result<ObjRef, GcError> {
        self.alloc_large_with_kind(num_refs, payload_words, ObjectKind::Plain)
    }

    fn alloc_large_with_kind(
        &self,
        num_refs: usize,
        payload_words: usize,
        kind: ObjectKind,
    ) -> Result<ObjRef, GcError> {
        let size = object_size(num_refs, payload_words);
        let _runnable = self.runnable();
        self.heap.threads.safepoint(&self.heap, &self.tcb);
        let addr = self.heap.large.alloc(size)?;
        // SAFETY: fresh and zeroed.
        unsafe {
            write_header(addr, Header::new(size, num_refs, kind));
            Ok(ObjRef::new_unchecked(addr))
        }
    }

    // ------------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------------

    /// Reads reference slot `index` of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object whose address was obtained after this
    /// thread's last safepoint, and `index` must be below its slot count.
    #[must_use]
    pub unsafe fn read_ref(&self, obj: ObjRef, index: usize) -> Option<ObjRef> {
        let _runnable = self.runnable();
        let offset = slot_offset(index);
        self.heap.ensure(obj.addr(), offset + REF_SIZE);
        debug_assert!(index < unsafe { obj.num_refs() }, "slot {index} out of bounds");
        // SAFETY: the page is installed and the slot is in bounds.
        ObjRef::from_addr(unsafe { load_slot(obj.addr() + offset) })
    }

    /// Stores `value` into reference slot `index` of `obj` and dirties its
    /// card.
    ///
    /// # Safety
    ///
    /// As for [`Mutator::read_ref`]; `value` must also be live and current.
    pub unsafe fn write_ref(&self, obj: ObjRef, index: usize, value: Option<ObjRef>) {
        let _runnable = self.runnable();
        let offset = slot_offset(index);
        self.heap.ensure(obj.addr(), offset + REF_SIZE);
        debug_assert!(index < unsafe { obj.num_refs() }, "slot {index} out of bounds");
        // SAFETY: as in `read_ref`.
        unsafe { store_slot(obj.addr() + offset, ObjRef::to_slot(value)) };
        self.heap.write_barrier(obj.addr());
    }

    fn payload_addr(&self, obj: ObjRef, index: usize) -> usize {
        self.heap.ensure(obj.addr(), HEADER_SIZE);
        // SAFETY: the header page is installed.
        let header = unsafe { read_header(obj.addr()) };
        let offset = slot_offset(header.num_refs()) + 8 * index;
        debug_assert!(offset + 8 <= header.size(), "payload word {index} out of bounds");
        self.heap.ensure(obj.addr() + offset, 8);
        obj.addr() + offset
    }

    /// Reads payload word `index` of `obj`.
    ///
    /// # Safety
    ///
    /// As for [`Mutator::read_ref`], with `index` below the payload size.
    #[must_use]
    pub unsafe fn read_word(&self, obj: ObjRef, index: usize) -> usize {
        let _runnable = self.runnable();
        let addr = self.payload_addr(obj, index);
        // SAFETY: in bounds and installed.
        unsafe { (*(addr as *const AtomicUsize)).load(Ordering::Relaxed) }
    }

    /// Writes payload word `index` of `obj`.
    ///
    /// # Safety
    ///
    /// As for [`Mutator::read_word`].
    pub unsafe fn write_word(&self, obj: ObjRef, index: usize, value: usize) {
        let _runnable = self.runnable();
        let addr = self.payload_addr(obj, index);
        // SAFETY: in bounds and installed.
        unsafe { (*(addr as *const AtomicUsize)).store(value, Ordering::Relaxed) };
    }

    /// Referent of a weak reference object. Blocks while the collector is
    /// deciding which referents die.
    ///
    /// # Safety
    ///
    /// As for [`Mutator::read_ref`]; `reference` must have been allocated
    /// with [`Mutator::alloc_reference`].
    #[must_use]
    pub unsafe fn reference_get(&self, reference: ObjRef) -> Option<ObjRef> {
        self.heap.weak_gate.wait();
        // SAFETY: guaranteed by the caller.
        unsafe { self.read_ref(reference, 0) }
    }

    // ------------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------------

    /// Adds a root slot and returns its index.
    pub fn push_root(&self, value: Option<ObjRef>) -> usize {
        let _runnable = self.runnable();
        self.tcb.with_data(|data| {
            data.roots.push(ObjRef::to_slot(value));
            data.roots.len() - 1
        })
    }

    /// Current value of root slot `index`, at the object's current address.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn root(&self, index: usize) -> Option<ObjRef> {
        let _runnable = self.runnable();
        ObjRef::from_addr(self.tcb.with_data(|data| data.roots[index]))
    }

    /// Overwrites root slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set_root(&self, index: usize, value: Option<ObjRef>) {
        let _runnable = self.runnable();
        self.tcb.with_data(|data| data.roots[index] = ObjRef::to_slot(value));
    }

    /// Removes the last root slot and returns its value.
    pub fn pop_root(&self) -> Option<ObjRef> {
        let _runnable = self.runnable();
        self.tcb
            .with_data(|data| data.roots.pop())
            .and_then(ObjRef::from_addr)
    }

    /// Number of root slots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.tcb.with_data(|data| data.roots.len())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.heap.threads.unregister(&self.heap, &self.tcb);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.tcb.id())
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FaultSourceKind, GcConfig};

    fn heap() -> Arc<Heap> {
        Heap::new(
            GcConfig::default()
                .moving_space_capacity(1 << 20)
                .non_moving_capacity(1 << 18)
                .tlab_size(4096)
                .fault_source(FaultSourceKind::Emulated),
        )
        .unwrap()
    }

    #[test]
    fn test_runnable_sections_nest() {
        let heap = heap();
        let mutator = heap.attach_mutator();
        assert!(!in_runnable_section());
        {
            let _outer = mutator.runnable();
            let _inner = mutator.runnable();
            assert!(in_runnable_section());
            assert!(matches!(heap.collect(), Err(GcError::Unsupported(_))));
        }
        assert!(!in_runnable_section());
        assert!(heap.collect().is_ok());
    }

    #[test]
    fn test_tlab_refill_and_fields() {
        let heap = heap();
        let mutator = heap.attach_mutator();
        let a = mutator.alloc(2, 3).unwrap();
        let b = mutator.alloc(0, 400).unwrap();
        assert!(heap.moving_space().has_address(a.addr()));
        assert_eq!(b.addr(), a.addr() + object_size(2, 3));

        // Does not fit in the rest of the first TLAB.
        let c = mutator.alloc(0, 200).unwrap();
        assert_eq!(c.addr(), heap.moving_space().begin() + 4096);

        unsafe {
            mutator.write_ref(a, 1, Some(c));
            mutator.write_word(a, 2, 0xfeed);
            assert_eq!(mutator.read_ref(a, 0), None);
            assert_eq!(mutator.read_ref(a, 1), Some(c));
            assert_eq!(mutator.read_word(a, 2), 0xfeed);
            assert_eq!(a.kind(), ObjectKind::Plain);
        }
    }

    #[test]
    fn test_spaces_by_size() {
        let heap = heap();
        let mutator = heap.attach_mutator();
        let words = heap.config().large_object_pages * sys_alloc::page_size() / 8;
        let large = mutator.alloc(0, words).unwrap();
        assert!(heap.large_object_space().contains(large.addr()));
        let fixed = mutator.alloc_non_moving(1, 0).unwrap();
        assert!(heap.non_moving_space().has_address(fixed.addr()));
    }

    #[test]
    fn test_roots() {
        let heap = heap();
        let mutator = heap.attach_mutator();
        let obj = mutator.alloc(0, 1).unwrap();
        let idx = mutator.push_root(Some(obj));
        mutator.push_root(None);
        assert_eq!(mutator.root(idx), Some(obj));
        assert_eq!(mutator.root_count(), 2);
        assert_eq!(mutator.pop_root(), None);
        mutator.set_root(idx, None);
        assert_eq!(mutator.pop_root(), None);
        assert_eq!(mutator.root_count(), 0);
    }

    #[test]
    fn test_out_of_memory_does_not_collect() {
        let heap = Heap::new(
            GcConfig::default()
                .moving_space_capacity(sys_alloc::page_size())
                .tlab_size(sys_alloc::page_size())
                .fault_source(FaultSourceKind::Emulated),
        )
        .unwrap();
        let mutator = heap.attach_mutator();
        let words = sys_alloc::page_size() / 8 - 1;
        mutator.alloc(0, words).unwrap();
        assert!(matches!(
            mutator.alloc(0, 1),
            Err(GcError::OutOfMemory { space: "moving", .. })
        ));
        assert!(heap.last_stats().is_none());
    }

    #[test]
    fn test_detach_unregisters() {
        let heap = heap();
        let first = heap.attach_mutator();
        let second = heap.attach_mutator();
        assert_ne!(first.id(), second.id());
        assert_eq!(heap.threads().len(), 2);
        drop(first);
        assert_eq!(heap.threads().len(), 1);
    }
}
