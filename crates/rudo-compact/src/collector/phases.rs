//! The cycle driver: reclaim, planning, the compaction pause and the
//! bookkeeping around page relocation.

use std::cell::OnceCell;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::config::CompactionMode;
use crate::error::fatal;
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::fault::KernelFaults;
use crate::fault::{Compaction, FaultSource, SoftFaults};
use crate::heap::Heap;
use crate::metrics::{record_metrics, CollectionStats};
use crate::object::{load_slot, store_slot, visit_refs_for_compaction, OBJECT_ALIGNMENT};
use crate::sync::{LockGuard, LockOrder};
use crate::thread::ThreadData;
use crate::tracing::internal;

use super::live_words::LiveWordsBitmap;
use super::marking::is_marked;
use super::planner::CompactionPlan;
use super::{GcPhase, MarkCompact};

/// Rewrites every reference slot of `obj` in `[begin_off, end_off)` in
/// place.
///
/// # Safety
///
/// `obj` must be a live object outside the moving space.
unsafe fn update_refs_in_place(plan: &CompactionPlan, obj: usize, begin_off: usize, end_off: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        visit_refs_for_compaction(obj, begin_off, end_off, |off| {
            let slot = obj + off;
            let old = load_slot(slot);
            let new = plan.update_ref(old);
            if new != old {
                store_slot(slot, new);
            }
        });
    }
}

/// Rewrites the references of every live non-moving object, page by page.
///
/// # Safety
///
/// Must run inside the compaction pause, after the non-moving first-object
/// table was completed.
unsafe fn update_non_moving_space(heap: &Heap, plan: &CompactionPlan) {
    let page_size = plan.page_size;
    let live = heap.non_moving.live_bitmap();
    for idx in 0..plan.non_moving_first_objs_count {
        let first = plan.non_moving_first_objs[idx];
        if first == 0 {
            continue;
        }
        let page_begin = plan.non_moving_begin + idx * page_size;
        let page_end = page_begin + page_size;
        let mut holder = first;
        live.visit_marked_range(first + OBJECT_ALIGNMENT, page_end, |next| {
            // SAFETY: live objects of the non-moving space.
            unsafe { update_refs_in_place(plan, holder, page_begin.saturating_sub(holder), usize::MAX) };
            holder = next;
        });
        // The last object may continue on the next page, which visits the
        // rest.
        // SAFETY: as above.
        unsafe { update_refs_in_place(plan, holder, page_begin.saturating_sub(holder), page_end - holder) };
    }
}

impl MarkCompact {
    /// Runs one full cycle on the calling thread.
    pub(crate) fn run_cycle(&mut self, heap: &Heap) -> CollectionStats {
        self.cycles += 1;
        self.stats = CollectionStats::new();
        self.stats.cycle = self.cycles;
        let gc_id = internal::next_gc_id();
        let _span = internal::trace_gc_collection(heap.context.mode().as_str(), gc_id);
        let start = Instant::now();

        self.run_phase(heap, GcPhase::Initialize, Self::initialize_phase);
        self.run_phase(heap, GcPhase::Marking, Self::marking_phase);
        self.run_phase(heap, GcPhase::MarkingPause, Self::marking_pause);
        self.run_phase(heap, GcPhase::Reclaim, Self::reclaim_phase);
        let plan = self.run_phase(heap, GcPhase::PrepareForCompaction, Self::prepare_for_compaction);
        let compaction = self.run_phase(heap, GcPhase::PreCompactionPause, |gc, heap| {
            gc.compaction_pause(heap, plan)
        });
        self.run_phase(heap, GcPhase::Compaction, |gc, heap| gc.compaction_phase(heap, &compaction));
        self.run_phase(heap, GcPhase::Finish, |gc, heap| gc.finish_phase(heap, compaction));

        self.stats.duration = start.elapsed();
        record_metrics(&self.stats);
        self.stats
    }

    fn run_phase<R>(&mut self, heap: &Heap, phase: GcPhase, body: impl FnOnce(&mut Self, &Heap) -> R) -> R {
        let _span = internal::trace_phase(phase);
        internal::log_phase_start(phase, heap.moving.size());
        self.timer.start();
        let result = body(self, heap);
        self.timer.end(phase, &mut self.stats);
        internal::log_phase_end(phase, heap.moving.size());
        result
    }

    fn initialize_phase(&mut self, heap: &Heap) {
        heap.immune.seal();
        heap.non_moving.mark_bitmap().clear_all();
        heap.large.clear_marks();
        {
            let _order = LockGuard::new(LockOrder::MarkStackLock);
            heap.mark_stack.lock().reset(heap.config.mark_stack_capacity);
        }
        self.live_words.clear();
        self.chunk_info.fill(0);
        self.frozen_alloc_stack.clear();
        self.stats.moving_bytes_before = heap.moving.size();
    }

    /// Clears what marking proved dead. Mutators run, but nothing moves.
    fn reclaim_phase(&mut self, heap: &Heap) {
        let _order = LockGuard::new(LockOrder::HeapBitmapLock);
        let _bitmap = heap.heap_bitmap_lock.read();
        // Must precede every liveness query: objects missing from the live
        // bitmap count as allocated after the pause.
        heap.non_moving.mark_alloc_stack_as_live(&self.frozen_alloc_stack);

        let marked = |obj: usize| is_marked(heap, obj);
        heap.weak_roots.sweep(marked);
        // SAFETY: delayed references were marked, so they are still valid.
        self.stats.references_cleared = unsafe { heap.references.process_references(marked) };
        heap.weak_gate.allow();

        // SAFETY: the live bitmap only holds allocated objects and marking
        // is complete.
        let swept = unsafe { heap.non_moving.sweep() };
        self.stats.non_moving_bytes_freed = swept.bytes;
        let (large_freed, _) = heap.large.sweep();
        self.stats.large_objects_freed = large_freed;
        heap.non_moving.swap_bitmaps();
    }

    fn prepare_for_compaction(&mut self, heap: &Heap) -> CompactionPlan {
        let moving = &heap.moving;
        let live_words = mem::replace(
            &mut self.live_words,
            LiveWordsBitmap::new(moving.begin(), moving.capacity()),
        );
        let chunk_info = mem::replace(&mut self.chunk_info, vec![0; live_words.chunks() + 1]);
        let black_begin = heap.black_allocations_begin.load(Ordering::Acquire);
        let mut plan = CompactionPlan::new(moving, heap.page_size, live_words, chunk_info, black_begin);
        // SAFETY: the swapped live bitmap holds exactly the marked objects.
        unsafe { plan.init_non_moving_space_first_objects(&heap.non_moving) };
        self.stats.live_bytes = plan.live_bytes();
        plan
    }

    /// Picks how this cycle's pages are relocated and creates the fault
    /// source for it.
    fn fault_source(heap: &Heap) -> (CompactionMode, Box<dyn FaultSource>, usize) {
        let mode = if heap.config.concurrent_compaction {
            heap.context.mode()
        } else {
            CompactionMode::Fallback
        };
        match mode {
            CompactionMode::Minor => match &heap.shadow {
                Some(shadow) => (mode, Box::new(SoftFaults::new()), shadow.ptr() as usize),
                None => (CompactionMode::Copy, Box::new(SoftFaults::new()), 0),
            },
            #[cfg(any(target_os = "linux", target_os = "android"))]
            CompactionMode::Copy if heap.context.uses_kernel_faults() => {
                let Some(uffd) = heap.context.userfaultfd() else {
                    return (mode, Box::new(SoftFaults::new()), 0);
                };
                let moving = &heap.moving;
                match KernelFaults::new(uffd, heap.page_size, moving.begin(), moving.capacity()) {
                    Ok(kernel) => (mode, Box::new(kernel), 0),
                    Err(err) => {
                        internal::warn(&format!(
                            "cannot register the moving space ({err}), compacting inside the pause"
                        ));
                        (CompactionMode::Fallback, Box::new(SoftFaults::new()), 0)
                    }
                }
            }
            _ => (mode, Box::new(SoftFaults::new()), 0),
        }
    }

    /// The second pause. Every root is rewritten before any page can be
    /// touched; afterwards the moving space is empty until pages get
    /// installed.
    fn compaction_pause(&mut self, heap: &Heap, mut plan: CompactionPlan) -> Arc<Compaction> {
        let cell: OnceCell<Arc<Compaction>> = OnceCell::new();
        let stats = &mut self.stats;

        let update_thread = |data: &mut ThreadData| {
            let Some(compaction) = cell.get() else {
                return;
            };
            if !data.tlab.is_empty() {
                data.tlab.slide(compaction.plan.black_objs_slide_diff());
            }
            for root in &mut data.roots {
                *root = compaction.plan.update_ref(*root);
            }
        };

        heap.threads.flip_thread_roots(update_thread, |_suspended| {
            let _order = LockGuard::new(LockOrder::HeapBitmapLock);
            let _bitmap = heap.heap_bitmap_lock.write();

            let end_before = heap.moving.end();
            // SAFETY: mutators are suspended and their TLABs are complete.
            unsafe {
                plan.update_moving_space_black_allocations(&heap.moving);
                plan.update_non_moving_space_black_allocations(&heap.non_moving);
            }
            stats.black_bytes = end_before - plan.black_allocations_begin;
            stats.black_slide_diff = plan.black_objs_slide_diff();
            stats.moving_bytes_after = heap.moving.size();

            if let Err(err) = heap.moving.mem().remap_into(&heap.from_space) {
                fatal::resource_exhausted("remapping the moving space", &err);
            }
            plan.from_space_begin = heap.from_space.ptr() as usize;
            let (mode, source, shadow_begin) = Self::fault_source(heap);
            stats.mode = Some(mode);

            let immune = &heap.immune;
            immune.mod_union().process_cards(immune.cards());
            immune.mod_union().visit_objects(immune.live_bitmap(), |obj| {
                // SAFETY: immune objects are never freed.
                unsafe { update_refs_in_place(&plan, obj, 0, usize::MAX) };
            });
            heap.global_roots.update(|root| plan.update_ref(root));
            heap.weak_roots.update(|root| plan.update_ref(root));
            heap.references.update_cleared(|reference| plan.update_ref(reference));
            // SAFETY: inside the pause, after both first-object tables are
            // final.
            unsafe { update_non_moving_space(heap, &plan) };
            heap.large.for_each_marked(|obj| {
                // SAFETY: marked large objects are live.
                unsafe { update_refs_in_place(&plan, obj, 0, usize::MAX) };
            });

            let compaction = Arc::new(Compaction::new(plan, mode, source, shadow_begin));
            if mode == CompactionMode::Fallback {
                compaction.compact_all(heap);
            } else if !compaction.source().traps_accesses() {
                heap.faults.activate(Arc::clone(&compaction));
            }
            let _ = cell.set(Arc::clone(&compaction));
            compaction
        })
    }

    fn compaction_phase(&mut self, heap: &Heap, compaction: &Arc<Compaction>) {
        if compaction.mode() != CompactionMode::Fallback {
            compaction.run(heap, heap.config.compaction_workers.max(1));
        }
    }

    fn finish_phase(&mut self, heap: &Heap, compaction: Arc<Compaction>) {
        compaction.source().finish();
        heap.faults.deactivate();
        self.stats.absorb(&compaction.counters);

        if let Err(err) = heap.from_space.discard(0, heap.from_space.len()) {
            fatal::resource_exhausted("releasing the from-space", &err);
        }
        if let Some(shadow) = &heap.shadow {
            if let Err(err) = shadow.discard(0, shadow.len()) {
                fatal::resource_exhausted("releasing the shadow buffer", &err);
            }
        }
        if let Err(err) = heap.moving.release_tail() {
            fatal::resource_exhausted("releasing the moving-space tail", &err);
        }
        heap.moving.mark_bitmap().clear_all();
        heap.large.set_allocate_black(false);
        heap.black_allocations_begin.store(usize::MAX, Ordering::Release);
        heap.references.run_pending_callbacks();
    }
}
