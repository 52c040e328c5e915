//! Marking.
//!
//! Every space keeps its own mark state: the moving and non-moving spaces
//! use a start-of-object bitmap, large objects carry a flag, and the immune
//! space is always marked. Scanning a moving-space object for the first time
//! also records its words in the live-words bitmap.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::accounting::{age_card, CARD_AGED, CARD_CLEAN, CARD_DIRTY};
use crate::error::fatal;
use crate::heap::Heap;
use crate::object::{align_object, load_slot, read_header, slot_offset, ObjectKind};
use crate::sync::{LockGuard, LockOrder};
use crate::thread::{Barrier, Checkpoint, ThreadData};

use super::MarkCompact;

/// Sets the mark of `obj`. Returns `true` if this call marked it first, in
/// which case the caller must scan it.
///
/// Black moving-space objects are never marked: everything above the
/// boundary is live by construction.
pub(crate) fn mark_object_no_push(heap: &Heap, obj: usize, holder: Option<(usize, usize)>) -> bool {
    if heap.moving.has_address(obj) {
        if obj >= heap.black_allocations_begin.load(Ordering::Acquire) {
            return false;
        }
        return !heap.moving.mark_bitmap().atomic_test_and_set(obj);
    }
    if heap.non_moving.has_address(obj) {
        return !heap.non_moving.mark_bitmap().atomic_test_and_set(obj);
    }
    if heap.immune.has_address(obj) {
        return false;
    }
    match heap.large.test_and_set_mark(obj) {
        Some(was_marked) => !was_marked,
        None => fatal::heap_corruption(&heap.corruption_report("marking", obj, holder)),
    }
}

/// Whether `obj` survives the current cycle. Valid from the marking pause
/// until the end of the reclaim phase, and for moving objects while a
/// compaction plan exists.
pub(crate) fn is_marked(heap: &Heap, obj: usize) -> bool {
    if heap.moving.has_address(obj) {
        if obj >= heap.black_allocations_begin.load(Ordering::Acquire) {
            return true;
        }
        return heap.moving.mark_bitmap().test(obj);
    }
    if heap.non_moving.has_address(obj) {
        // Objects missing from the live bitmap were allocated after the
        // marking pause and are live.
        return heap.non_moving.mark_bitmap().test(obj) || !heap.non_moving.live_bitmap().test(obj);
    }
    if heap.immune.has_address(obj) {
        return true;
    }
    match heap.large.is_marked(obj) {
        Some(marked) => marked,
        None => fatal::heap_corruption(&heap.corruption_report("liveness query", obj, None)),
    }
}

/// Pushes every object of `objs` with one lock acquisition.
fn push_all(heap: &Heap, objs: &[usize]) {
    if objs.is_empty() {
        return;
    }
    let _order = LockGuard::new(LockOrder::MarkStackLock);
    let mut stack = heap.mark_stack.lock();
    loop {
        if let Some(slots) = stack.bump_back(objs.len()) {
            slots.copy_from_slice(objs);
            return;
        }
        stack.expand();
    }
}

fn mark_thread_roots(heap: &Heap, data: &ThreadData) {
    let newly_marked: Vec<usize> = data
        .roots
        .iter()
        .copied()
        .filter(|&root| root != 0 && mark_object_no_push(heap, root, None))
        .collect();
    push_all(heap, &newly_marked);
}

impl MarkCompact {
    fn mark_object(&mut self, heap: &Heap, obj: usize, holder: Option<(usize, usize)>) {
        if mark_object_no_push(heap, obj, holder) {
            let _order = LockGuard::new(LockOrder::MarkStackLock);
            heap.mark_stack.lock().push(obj);
        }
    }

    /// Marks every referent of `obj`. A first scan of a moving-space object
    /// also feeds the live-words bitmap; card rescans must not.
    pub(super) fn scan_object(&mut self, heap: &Heap, obj: usize, first_scan: bool) {
        // SAFETY: marked objects are valid and readable while marking.
        let header = unsafe { read_header(obj) };
        if first_scan {
            self.stats.objects_marked += 1;
            if heap.moving.has_address(obj) && obj < heap.black_allocations_begin.load(Ordering::Acquire) {
                self.update_liveness_info(obj, align_object(header.size()));
            }
        }
        let weak = header.kind() == ObjectKind::WeakReference;
        for i in usize::from(weak)..header.num_refs() {
            let offset = slot_offset(i);
            // SAFETY: `i` is below the slot count.
            let value = unsafe { load_slot(obj + offset) };
            if value != 0 {
                self.mark_object(heap, value, Some((obj, offset)));
            }
        }
        // SAFETY: weak references have at least one slot.
        if weak && header.num_refs() > 0 && unsafe { load_slot(obj + slot_offset(0)) } != 0 {
            heap.references.delay_referent(obj);
        }
    }

    /// Drains the mark stack.
    pub(super) fn process_mark_stack(&mut self, heap: &Heap) {
        loop {
            let next = {
                let _order = LockGuard::new(LockOrder::MarkStackLock);
                heap.mark_stack.lock().pop()
            };
            match next {
                Some(obj) => self.scan_object(heap, obj, true),
                None => break,
            }
        }
    }

    /// Has every mutator mark its own roots and waits until all of them
    /// did.
    pub(super) fn mark_roots_checkpoint(&mut self, heap: &Heap) {
        let barrier = Arc::new(Barrier::new(0));
        let pass = Arc::clone(&barrier);
        let checkpoint: Checkpoint = Arc::new(move |heap: &Heap, data: &mut ThreadData| {
            mark_thread_roots(heap, data);
            pass.pass();
        });
        let count = heap.threads.run_checkpoint(heap, &checkpoint);
        barrier.increment(count as isize);
    }

    pub(super) fn mark_non_thread_roots(&mut self, heap: &Heap) {
        let mut roots = Vec::new();
        heap.global_roots.visit(|root| roots.push(root));
        for root in roots {
            self.mark_object(heap, root, None);
        }
    }

    /// Scans immune objects on cached cards and marks what they reference.
    fn update_and_mark_mod_union(&mut self, heap: &Heap) {
        let immune = &heap.immune;
        immune.mod_union().process_cards(immune.cards());
        let mut referents = Vec::new();
        immune.mod_union().update_and_mark_references(immune.live_bitmap(), |obj| {
            // SAFETY: immune objects are never freed.
            let header = unsafe { read_header(obj) };
            let mut outside = false;
            for i in 0..header.num_refs() {
                // SAFETY: `i` is below the slot count.
                let value = unsafe { load_slot(obj + slot_offset(i)) };
                if value != 0 && !immune.has_address(value) {
                    outside = true;
                    referents.push((value, obj, slot_offset(i)));
                }
            }
            outside
        });
        for (value, holder, offset) in referents {
            self.mark_object(heap, value, Some((holder, offset)));
        }
    }

    /// Rescans marked objects on cards at least `min_age`, then drains.
    pub(super) fn scan_dirty_objects(&mut self, heap: &Heap, min_age: u8) {
        let moving = &heap.moving;
        let black_begin = heap.black_allocations_begin.load(Ordering::Acquire);
        let mut dirty = Vec::new();
        moving.cards().scan(
            moving.mark_bitmap(),
            moving.begin(),
            moving.end().min(black_begin),
            min_age,
            false,
            |obj| dirty.push(obj),
        );
        let non_moving = &heap.non_moving;
        non_moving.cards().scan(
            non_moving.mark_bitmap(),
            non_moving.begin(),
            non_moving.end(),
            min_age,
            false,
            |obj| dirty.push(obj),
        );
        heap.large.scan_cards(min_age, |obj| dirty.push(obj));
        for obj in dirty {
            self.scan_object(heap, obj, false);
        }
        self.update_and_mark_mod_union(heap);
        self.process_mark_stack(heap);
    }

    /// Ages every card, re-marks roots and rescans what was dirtied while
    /// the first pass ran, so the pause has less left to do.
    fn pre_clean_cards(&mut self, heap: &Heap) {
        heap.moving
            .cards()
            .modify_cards_atomic(heap.moving.begin(), heap.moving.limit(), age_card, |_, _, _| {});
        heap.non_moving.cards().modify_cards_atomic(
            heap.non_moving.begin(),
            heap.non_moving.limit(),
            age_card,
            |_, _, _| {},
        );
        heap.large.age_cards(age_card);
        self.mark_roots_checkpoint(heap);
        self.mark_non_thread_roots(heap);
        self.scan_dirty_objects(heap, CARD_AGED);
    }

    /// Concurrent marking. Mutators keep running; the write barrier dirties
    /// cards behind the collector's back and the card passes pick them up.
    pub(super) fn marking_phase(&mut self, heap: &Heap) {
        let _order = LockGuard::new(LockOrder::HeapBitmapLock);
        let _bitmap = heap.heap_bitmap_lock.read();
        heap.moving.cards().clear_all();
        heap.non_moving.cards().clear_all();
        heap.large.age_cards(|_| CARD_CLEAN);

        self.mark_roots_checkpoint(heap);
        self.mark_non_thread_roots(heap);
        self.update_and_mark_mod_union(heap);
        self.process_mark_stack(heap);
        self.pre_clean_cards(heap);
    }

    /// Final remark with every mutator suspended. Establishes the
    /// black-allocation boundary.
    pub(super) fn marking_pause(&mut self, heap: &Heap) {
        let suspended = heap.threads.suspend_all();
        let _order = LockGuard::new(LockOrder::HeapBitmapLock);
        let _bitmap = heap.heap_bitmap_lock.write();

        let mut roots = Vec::new();
        heap.threads.for_each_thread(&suspended, |data| {
            roots.extend(data.roots.iter().copied().filter(|&root| root != 0));
            data.tlab.revoke();
        });
        for root in roots {
            self.mark_object(heap, root, None);
        }

        let black_begin = heap.moving.align_end(heap.page_size);
        heap.black_allocations_begin.store(black_begin, Ordering::Release);
        heap.large.set_allocate_black(true);

        self.mark_non_thread_roots(heap);
        // Non-moving objects allocated while marking are live without a
        // mark bit, so card rescans never reach them.
        let frozen = heap.non_moving.swap_alloc_stack();
        for &obj in &frozen {
            self.scan_object(heap, obj, false);
        }
        self.scan_dirty_objects(heap, CARD_DIRTY);

        self.frozen_alloc_stack = frozen;
        heap.weak_gate.disallow();
    }
}
