//! Drives page relocation during the compaction phase.
//!
//! The collector thread walks the used pages back to front while a small
//! pool of workers serves faults. Every page goes through [`PageStates`],
//! so its relocation body runs exactly once whoever gets there first.

use std::sync::Arc;

use crate::collector::{compact_page, slide_black_page, CompactionPlan};
use crate::config::CompactionMode;
use crate::error::fatal;
use crate::heap::Heap;
use crate::metrics::{PageActor, PageCounters};

use super::page_state::{PageState, PageStates};
use super::source::{Fault, FaultSource};

/// Most shadow pages the eager pass collects before installing them.
const MAX_BATCH: usize = 32;

/// A page-sized, word-aligned scratch buffer.
struct PageBuffer(Vec<u64>);

impl PageBuffer {
    fn new(page_size: usize) -> Self {
        Self(vec![0; page_size / 8])
    }

    fn addr(&mut self) -> usize {
        self.0.as_mut_ptr() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// The collector's own pass over the used pages.
    Eager,
    /// A worker answering a fault.
    Faulter,
}

/// Relocation state of one compaction phase.
pub(crate) struct Compaction {
    pub(crate) plan: CompactionPlan,
    pub(crate) pages: PageStates,
    pub(crate) counters: PageCounters,
    mode: CompactionMode,
    source: Box<dyn FaultSource>,
    /// Start of the shadow buffer in minor mode, 0 otherwise.
    shadow_begin: usize,
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("mode", &self.mode)
            .field("pages", &self.pages.len())
            .field("used_pages", &self.plan.used_pages())
            .finish_non_exhaustive()
    }
}

impl Compaction {
    pub(crate) fn new(
        plan: CompactionPlan,
        mode: CompactionMode,
        source: Box<dyn FaultSource>,
        shadow_begin: usize,
    ) -> Self {
        let pages = (plan.moving_limit - plan.moving_begin) / plan.page_size;
        Self {
            plan,
            pages: PageStates::new(pages),
            counters: PageCounters::default(),
            mode,
            source,
            shadow_begin,
        }
    }

    pub(crate) const fn mode(&self) -> CompactionMode {
        self.mode
    }

    pub(crate) fn source(&self) -> &dyn FaultSource {
        &*self.source
    }

    fn page_addr(&self, idx: usize) -> usize {
        self.plan.moving_begin + idx * self.plan.page_size
    }

    fn shadow_addr(&self, idx: usize) -> usize {
        self.shadow_begin + idx * self.plan.page_size
    }

    /// Page index of a moving-space address.
    pub(crate) fn page_index(&self, addr: usize) -> usize {
        (addr - self.plan.moving_begin) / self.plan.page_size
    }

    /// Blocks until page `idx` is mapped.
    pub(crate) fn ensure_page(&self, idx: usize) {
        if self.pages.get(idx) != PageState::Mapped {
            self.source.request(&self.pages, idx, self.page_addr(idx));
        }
    }

    /// `true` if page `idx` receives any bytes.
    fn has_data(&self, idx: usize) -> bool {
        idx < self.plan.used_pages() && self.plan.first_objs[idx] != 0
    }

    /// Fills `dest` with the final contents of page `idx`. Returns `false`
    /// for a page with nothing to copy, leaving `dest` untouched.
    fn compact_into(&self, heap: &Heap, idx: usize, dest: usize) -> bool {
        if !self.has_data(idx) {
            return false;
        }
        let plan = &self.plan;
        let first_obj = plan.first_objs[idx];
        if idx < plan.moving_first_objs_count {
            // SAFETY: `dest` is a private page buffer and the from-space
            // holds the pre-compaction heap for the whole phase.
            unsafe { compact_page(plan, first_obj, plan.pre_compact_offset[idx] as usize, dest) };
        } else {
            let pre_compact_page =
                plan.black_allocations_begin + (idx - plan.moving_first_objs_count) * plan.page_size;
            // SAFETY: as above.
            unsafe {
                slide_black_page(
                    plan,
                    heap.moving.mark_bitmap(),
                    first_obj,
                    plan.black_first_chunk[idx] as usize,
                    pre_compact_page,
                    dest,
                );
            }
        }
        true
    }

    fn publish(&self, first: usize, count: usize) {
        for idx in first..first + count {
            self.pages.set_mapped(idx);
        }
        self.source.mapped();
    }

    /// Relocates and installs page `idx` unless another thread owns it.
    fn process_page(&self, heap: &Heap, idx: usize, role: Role, buf: &mut PageBuffer, batch: &mut Vec<usize>) {
        let actor = match role {
            Role::Eager => PageActor::GcThread,
            Role::Faulter => PageActor::Worker,
        };
        let page_size = self.plan.page_size;
        let page_addr = self.page_addr(idx);
        let installer = self.source.installer();

        if self.mode != CompactionMode::Minor || !self.has_data(idx) {
            match self.pages.try_claim(idx, PageState::ProcessingAndMapping) {
                Ok(()) => {
                    let dest = buf.addr();
                    if self.compact_into(heap, idx, dest) {
                        self.counters.compacted(actor);
                        // SAFETY: the buffer holds the finished page.
                        unsafe { installer.copy(page_addr, dest, page_size) };
                    } else {
                        self.counters.zero_page();
                        installer.zero(page_addr, page_size);
                    }
                    self.publish(idx, 1);
                }
                Err(PageState::ProcessingAndMapping | PageState::Mapped) => {
                    if role == Role::Faulter {
                        installer.wake(page_addr, page_size);
                    }
                }
                Err(state) => fatal::bad_page_state(idx, state as u8, "claiming a page in copy mode"),
            }
            return;
        }

        let shadow = self.shadow_addr(idx);
        match role {
            Role::Eager => {
                if self.pages.try_claim(idx, PageState::Processing).is_err() {
                    return;
                }
                self.compact_into(heap, idx, shadow);
                self.counters.compacted(actor);
                match self.pages.finish_processing(idx) {
                    Ok(()) => batch.push(idx),
                    Err(PageState::ProcessingAndMapping) => {
                        // SAFETY: the shadow page was just filled.
                        unsafe { installer.map_shadow(page_addr, shadow, page_size) };
                        self.publish(idx, 1);
                    }
                    Err(state) => fatal::bad_page_state(idx, state as u8, "finishing a shadow page"),
                }
            }
            Role::Faulter => loop {
                match self.pages.get(idx) {
                    PageState::Unprocessed => {
                        if self.pages.try_claim(idx, PageState::ProcessingAndMapping).is_ok() {
                            self.compact_into(heap, idx, shadow);
                            self.counters.compacted(actor);
                            // SAFETY: the shadow page was just filled.
                            unsafe { installer.map_shadow(page_addr, shadow, page_size) };
                            self.publish(idx, 1);
                            return;
                        }
                    }
                    PageState::Processing => {
                        if self.pages.upgrade(idx).is_ok() {
                            return;
                        }
                    }
                    PageState::Processed => {
                        if self.pages.claim_processed(idx).is_ok() {
                            self.counters.handoff();
                            // SAFETY: `Processed` was published with release
                            // ordering after the shadow page was filled.
                            unsafe { installer.map_shadow(page_addr, shadow, page_size) };
                            self.publish(idx, 1);
                            return;
                        }
                    }
                    PageState::ProcessingAndMapping | PageState::Mapped => return,
                }
            },
        }
    }

    /// Installs the processed shadow pages of `batch`, merging contiguous
    /// runs into one call. Pages a faulter claimed meanwhile are skipped.
    fn flush_batch(&self, batch: &mut Vec<usize>) {
        if batch.is_empty() {
            return;
        }
        batch.sort_unstable();
        let mut run: Option<(usize, usize)> = None;
        for &idx in batch.iter() {
            let claimed = self.pages.claim_processed(idx).is_ok();
            match run {
                Some((start, len)) if claimed && idx == start + len => run = Some((start, len + 1)),
                _ => {
                    if let Some((start, len)) = run.take() {
                        self.install_run(start, len);
                    }
                    if claimed {
                        run = Some((idx, 1));
                    }
                }
            }
        }
        if let Some((start, len)) = run {
            self.install_run(start, len);
        }
        batch.clear();
    }

    fn install_run(&self, start: usize, len: usize) {
        let page_size = self.plan.page_size;
        if len > 1 {
            self.counters.batched_install();
        }
        // SAFETY: every page of the run is `Processed` and now owned here.
        unsafe {
            self.source
                .installer()
                .map_shadow(self.page_addr(start), self.shadow_addr(start), len * page_size);
        }
        self.publish(start, len);
    }

    /// The collector's pass over every used page, last page first.
    fn compact_eagerly(&self, heap: &Heap) {
        let mut buf = PageBuffer::new(self.plan.page_size);
        let mut batch = Vec::with_capacity(MAX_BATCH);
        for idx in (0..self.plan.used_pages()).rev() {
            self.process_page(heap, idx, Role::Eager, &mut buf, &mut batch);
            if batch.len() >= MAX_BATCH {
                self.flush_batch(&mut batch);
            }
        }
        self.flush_batch(&mut batch);
    }

    /// A worker's read-dispatch loop.
    fn serve_faults(&self, heap: &Heap) {
        let mut buf = PageBuffer::new(self.plan.page_size);
        let mut unused = Vec::new();
        loop {
            match self.source.next_fault() {
                Fault::Terminate => break,
                Fault::Page(addr) => {
                    let idx = self.page_index(addr);
                    if idx < self.pages.len() {
                        self.process_page(heap, idx, Role::Faulter, &mut buf, &mut unused);
                    }
                }
            }
        }
    }

    /// Relocates every used page on the calling thread. Used inside the
    /// pause, where nothing can fault.
    pub(crate) fn compact_all(&self, heap: &Heap) {
        let mut buf = PageBuffer::new(self.plan.page_size);
        let mut batch = Vec::new();
        for idx in 0..self.plan.used_pages() {
            self.process_page(heap, idx, Role::Eager, &mut buf, &mut batch);
        }
        self.flush_batch(&mut batch);
    }

    /// The concurrent compaction phase: `workers` fault workers plus the
    /// eager pass on the calling thread. Returns when every page is mapped
    /// and every worker has exited.
    pub(crate) fn run(self: &Arc<Self>, heap: &Heap, workers: usize) {
        let result = crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| self.serve_faults(heap));
            }
            self.compact_eagerly(heap);
            self.source.terminate(&self.pages, workers);
        });
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
