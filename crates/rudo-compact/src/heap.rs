//! The heap facade.
//!
//! A [`Heap`] owns the four spaces, the marking tables, the thread registry,
//! the root tables and the collector. Mutator threads reach it through a
//! [`Mutator`] handle; collections run on whichever thread calls
//! [`Heap::collect`].
//!
//! # Memory Layout
//!
//! ```text
//! moving space      [begin .. end .. limit)   bump pointer + TLAB blocks
//! from-space        same size                 pre-compaction snapshot
//! shadow (minor)    same size                 compacted pages before install
//! non-moving space  [begin .. end .. limit)   free list + two bitmaps
//! immune space      [begin .. end)            sealed at the first cycle
//! large objects     one mapping each
//! ```
//!
//! The from-space and the shadow are reserved once and stay empty between
//! cycles.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sys_alloc::Mmap;

use crate::accounting::MarkStack;
use crate::collector::MarkCompact;
use crate::config::{CompactionMode, GcConfig};
use crate::context::GcContext;
use crate::error::fatal::{CorruptionReport, SpaceExtent};
use crate::error::GcError;
use crate::fault::FaultGate;
use crate::metrics::CollectionStats;
use crate::mutator::{in_runnable_section, Mutator};
use crate::object::{object_size, write_header, Header, ObjRef, ObjectKind};
use crate::reference::ReferenceProcessor;
use crate::roots::{GlobalRoots, WeakAccessGate, WeakRoots};
use crate::space::{reserve, BumpPointerSpace, ImmuneSpace, LargeObjectSpace, NonMovingSpace};
use crate::thread::ThreadList;

/// Words dumped on each side of a bad holder.
const REPORT_RADIUS: usize = 4;

/// A garbage-collected heap.
pub struct Heap {
    pub(crate) config: GcConfig,
    pub(crate) page_size: usize,
    pub(crate) context: GcContext,

    pub(crate) moving: BumpPointerSpace,
    pub(crate) non_moving: NonMovingSpace,
    pub(crate) immune: ImmuneSpace,
    pub(crate) large: LargeObjectSpace,
    /// Receives the moving space's pages at the compaction pause.
    pub(crate) from_space: Mmap,
    /// Destination of compacted pages in minor mode.
    pub(crate) shadow: Option<Mmap>,

    pub(crate) mark_stack: Mutex<MarkStack>,
    pub(crate) heap_bitmap_lock: RwLock<()>,
    /// First moving-space address allocated after the marking pause, or
    /// `usize::MAX` outside a cycle.
    pub(crate) black_allocations_begin: AtomicUsize,

    pub(crate) threads: ThreadList,
    pub(crate) global_roots: GlobalRoots,
    pub(crate) weak_roots: WeakRoots,
    pub(crate) weak_gate: WeakAccessGate,
    pub(crate) references: ReferenceProcessor,
    pub(crate) faults: FaultGate,

    collector: Mutex<MarkCompact>,
    last_stats: Mutex<Option<CollectionStats>>,
}

impl Heap {
    /// Reserves every space and probes the platform for the compaction
    /// mode.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Map`] if a reservation fails.
    pub fn new(config: GcConfig) -> Result<Arc<Self>, GcError> {
        let context = GcContext::init(&config);
        let moving = BumpPointerSpace::new(config.moving_space_capacity)?;
        let from_space = reserve(moving.capacity())?;
        let shadow = if context.mode() == CompactionMode::Minor {
            Some(reserve(moving.capacity())?)
        } else {
            None
        };
        let non_moving = NonMovingSpace::new(config.non_moving_capacity)?;
        let immune = ImmuneSpace::new(config.immune_capacity)?;
        let collector = MarkCompact::new(moving.begin(), moving.capacity());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            mode = context.mode().as_str(),
            kernel_faults = context.uses_kernel_faults(),
            moving_capacity = moving.capacity(),
            "heap created"
        );

        Ok(Arc::new(Self {
            page_size: sys_alloc::page_size(),
            mark_stack: Mutex::new(MarkStack::new(config.mark_stack_capacity)),
            config,
            context,
            moving,
            non_moving,
            immune,
            large: LargeObjectSpace::new(),
            from_space,
            shadow,
            heap_bitmap_lock: RwLock::new(()),
            black_allocations_begin: AtomicUsize::new(usize::MAX),
            threads: ThreadList::new(),
            global_roots: GlobalRoots::new(),
            weak_roots: WeakRoots::new(),
            weak_gate: WeakAccessGate::default(),
            references: ReferenceProcessor::new(),
            faults: FaultGate::default(),
            collector: Mutex::new(collector),
            last_stats: Mutex::new(None),
        }))
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn attach_mutator(self: &Arc<Self>) -> Mutator {
        Mutator::new(Arc::clone(self))
    }

    /// Runs one full collection cycle on the calling thread.
    ///
    /// Every other mutator must reach a safepoint or be outside its
    /// runnable section for the cycle to make progress.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Unsupported`] when called from inside a runnable
    /// section, since the pauses would wait for the caller itself.
    pub fn collect(&self) -> Result<CollectionStats, GcError> {
        if in_runnable_section() {
            return Err(GcError::Unsupported("collect() from a runnable mutator section"));
        }
        let stats = self.collector.lock().run_cycle(self);
        *self.last_stats.lock() = Some(stats);
        Ok(stats)
    }

    /// Statistics of the last completed cycle.
    #[must_use]
    pub fn last_stats(&self) -> Option<CollectionStats> {
        *self.last_stats.lock()
    }

    /// Allocates a boot-image object. Such objects are never moved or
    /// freed.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Unsupported`] once the first cycle started, or
    /// [`GcError::OutOfMemory`] when the immune space is full.
    pub fn alloc_immune(&self, num_refs: usize, payload_words: usize) -> Result<ObjRef, GcError> {
        let size = object_size(num_refs, payload_words);
        let addr = self.immune.alloc(size)?;
        // SAFETY: fresh, zeroed and owned by this call.
        unsafe {
            write_header(addr, Header::new(size, num_refs, ObjectKind::Plain));
            Ok(ObjRef::new_unchecked(addr))
        }
    }

    // ------------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------------

    /// Adds a strong global root and returns its index.
    pub fn add_global_root(&self, value: Option<ObjRef>) -> usize {
        self.global_roots.add(ObjRef::to_slot(value))
    }

    /// Current value of a global root.
    #[must_use]
    pub fn global_root(&self, index: usize) -> Option<ObjRef> {
        ObjRef::from_addr(self.global_roots.get(index))
    }

    /// Overwrites a global root.
    pub fn set_global_root(&self, index: usize, value: Option<ObjRef>) {
        self.global_roots.set(index, ObjRef::to_slot(value));
    }

    /// Adds a weak global root and returns its index. It reads as `None`
    /// once its referent died.
    pub fn add_weak_root(&self, value: Option<ObjRef>) -> usize {
        self.weak_roots.add(ObjRef::to_slot(value))
    }

    /// Current value of a weak global root. Blocks between the marking
    /// pause and the weak-root sweep.
    #[must_use]
    pub fn weak_root(&self, index: usize) -> Option<ObjRef> {
        self.weak_gate.wait();
        ObjRef::from_addr(self.weak_roots.get(index))
    }

    /// Installs the callback receiving the weak-reference objects whose
    /// referent was cleared. It runs at the end of every cycle that cleared
    /// any.
    pub fn set_reference_callback(&self, callback: impl Fn(&[ObjRef]) + Send + Sync + 'static) {
        self.references.set_callback(Box::new(callback));
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Page size the spaces are laid out in.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// The process-wide compaction context.
    #[must_use]
    pub const fn context(&self) -> &GcContext {
        &self.context
    }

    /// The moving space.
    #[must_use]
    pub const fn moving_space(&self) -> &BumpPointerSpace {
        &self.moving
    }

    /// The non-moving space.
    #[must_use]
    pub const fn non_moving_space(&self) -> &NonMovingSpace {
        &self.non_moving
    }

    /// The immune space.
    #[must_use]
    pub const fn immune_space(&self) -> &ImmuneSpace {
        &self.immune
    }

    /// The large-object space.
    #[must_use]
    pub const fn large_object_space(&self) -> &LargeObjectSpace {
        &self.large
    }

    /// The mutator registry.
    #[must_use]
    pub const fn threads(&self) -> &ThreadList {
        &self.threads
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    /// Blocks until every moving-space page overlapping `[addr, addr + len)`
    /// holds its final contents. Free outside the compaction phase.
    #[inline]
    pub(crate) fn ensure(&self, addr: usize, len: usize) {
        if !self.moving.has_address(addr) {
            return;
        }
        let Some(compaction) = self.faults.current() else {
            return;
        };
        let first = compaction.page_index(addr);
        let last = compaction.page_index(addr + len.max(1) - 1);
        for idx in first..=last {
            compaction.ensure_page(idx);
        }
    }

    /// Card-marking write barrier for a store into `obj`.
    #[inline]
    pub(crate) fn write_barrier(&self, obj: usize) {
        if self.moving.has_address(obj) {
            self.moving.cards().mark_card(obj);
        } else if self.non_moving.has_address(obj) {
            self.non_moving.cards().mark_card(obj);
        } else if self.immune.has_address(obj) {
            self.immune.cards().mark_card(obj);
        } else {
            self.large.mark_card(obj);
        }
    }

    fn space_extents(&self) -> Vec<SpaceExtent> {
        let mut spaces = vec![
            SpaceExtent {
                name: "moving",
                begin: self.moving.begin(),
                end: self.moving.limit(),
            },
            SpaceExtent {
                name: "non-moving",
                begin: self.non_moving.begin(),
                end: self.non_moving.limit(),
            },
            SpaceExtent {
                name: "immune",
                begin: self.immune.begin(),
                end: self.immune.end(),
            },
        ];
        spaces.extend(self.large.extents());
        spaces
    }

    /// Builds the report for a reference that belongs to no space. Only
    /// called before the compaction pause, while every heap page is
    /// readable.
    pub(crate) fn corruption_report(
        &self,
        context: &'static str,
        reference: usize,
        holder: Option<(usize, usize)>,
    ) -> CorruptionReport {
        let report = CorruptionReport::new(context, reference).with_spaces(self.space_extents());
        match holder {
            // SAFETY: the dump is restricted to the listed spaces, all of
            // which are mapped and readable outside the compaction phase.
            Some((obj, offset)) => unsafe { report.with_holder(obj, offset, REPORT_RADIUS) },
            None => report,
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("mode", &self.context.mode())
            .field("moving_used", &self.moving.size())
            .field("large_objects", &self.large.len())
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultSourceKind;
    use std::sync::atomic::Ordering;

    fn small_config() -> GcConfig {
        GcConfig::default()
            .moving_space_capacity(1 << 20)
            .non_moving_capacity(1 << 18)
            .immune_capacity(1 << 16)
            .fault_source(FaultSourceKind::Emulated)
    }

    #[test]
    fn test_immune_allocation_closes_at_first_cycle() {
        let heap = Heap::new(small_config()).unwrap();
        let boot = heap.alloc_immune(2, 1).unwrap();
        assert!(heap.immune_space().has_address(boot.addr()));
        assert_eq!(unsafe { boot.size() }, object_size(2, 1));

        heap.collect().unwrap();
        assert!(matches!(heap.alloc_immune(1, 0), Err(GcError::Unsupported(_))));
    }

    #[test]
    fn test_corruption_report_lists_spaces() {
        let heap = Heap::new(small_config()).unwrap();
        let report = heap.corruption_report("marking", 0xdead_0000, None);
        let text = report.to_string();
        assert!(text.contains("0xdead0000"));
        assert!(text.contains("moving"));
        assert!(text.contains("non-moving"));
        assert!(text.contains("immune"));
    }

    #[test]
    fn test_ensure_is_free_outside_compaction() {
        let heap = Heap::new(small_config()).unwrap();
        heap.ensure(heap.moving.begin(), 64);
        heap.ensure(0x10, 8);
        assert_eq!(heap.black_allocations_begin.load(Ordering::Relaxed), usize::MAX);
    }

    #[test]
    fn test_last_stats_tracks_cycles() {
        let heap = Heap::new(small_config()).unwrap();
        assert!(heap.last_stats().is_none());
        let first = heap.collect().unwrap();
        let second = heap.collect().unwrap();
        assert_eq!(first.cycle + 1, second.cycle);
        assert_eq!(heap.last_stats(), Some(second));
    }
}
