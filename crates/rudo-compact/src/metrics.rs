//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::collector::GcPhase;
use crate::config::CompactionMode;

/// Statistics for one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// Mode the compaction phase ran in, `None` before the first cycle.
    pub mode: Option<CompactionMode>,
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// Time spent in the marking pause.
    pub marking_pause: Duration,
    /// Time spent in the compaction pause.
    pub compaction_pause: Duration,
    /// Concurrent marking, including card pre-cleaning.
    pub marking: Duration,
    /// Sweeping, reference processing and weak-root clearing.
    pub reclaim: Duration,
    /// Building the compaction tables.
    pub prepare: Duration,
    /// Page relocation after the pause (zero in fallback mode).
    pub compaction: Duration,
    /// Releasing the from-space and resetting tables.
    pub finish: Duration,
    /// Moving-space bytes in use before the cycle.
    pub moving_bytes_before: usize,
    /// Moving-space bytes in use after compaction.
    pub moving_bytes_after: usize,
    /// Live bytes found below the black-allocation boundary.
    pub live_bytes: usize,
    /// Bytes allocated black while the cycle ran.
    pub black_bytes: usize,
    /// Distance black objects slid down by.
    pub black_slide_diff: usize,
    /// Objects marked in every space.
    pub objects_marked: usize,
    /// Non-moving bytes freed by the sweep.
    pub non_moving_bytes_freed: usize,
    /// Large objects released by the sweep.
    pub large_objects_freed: usize,
    /// Weak references whose referent was cleared.
    pub references_cleared: usize,
    /// Destination pages that received compacted bytes.
    pub pages_compacted: usize,
    /// Destination pages answered with zeroes.
    pub zero_pages: usize,
    /// Pages compacted by the GC thread.
    pub pages_by_gc_thread: usize,
    /// Pages compacted by fault workers answering a mutator fault.
    pub pages_by_workers: usize,
    /// Pages whose compactor handed mapping to another thread.
    pub mapping_handoffs: usize,
    /// Install calls that covered more than one page.
    pub batched_installs: usize,
}

impl Default for CollectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionStats {
    /// Create stats with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cycle: 0,
            mode: None,
            duration: Duration::ZERO,
            marking_pause: Duration::ZERO,
            compaction_pause: Duration::ZERO,
            marking: Duration::ZERO,
            reclaim: Duration::ZERO,
            prepare: Duration::ZERO,
            compaction: Duration::ZERO,
            finish: Duration::ZERO,
            moving_bytes_before: 0,
            moving_bytes_after: 0,
            live_bytes: 0,
            black_bytes: 0,
            black_slide_diff: 0,
            objects_marked: 0,
            non_moving_bytes_freed: 0,
            large_objects_freed: 0,
            references_cleared: 0,
            pages_compacted: 0,
            zero_pages: 0,
            pages_by_gc_thread: 0,
            pages_by_workers: 0,
            mapping_handoffs: 0,
            batched_installs: 0,
        }
    }

    /// Both pauses together.
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        self.marking_pause + self.compaction_pause
    }

    pub(crate) fn absorb(&mut self, pages: &PageCounters) {
        self.pages_by_gc_thread = pages.by_gc_thread.load(Ordering::Relaxed);
        self.pages_by_workers = pages.by_workers.load(Ordering::Relaxed);
        self.pages_compacted = self.pages_by_gc_thread + self.pages_by_workers;
        self.zero_pages = pages.zero_pages.load(Ordering::Relaxed);
        self.mapping_handoffs = pages.mapping_handoffs.load(Ordering::Relaxed);
        self.batched_installs = pages.batched_installs.load(Ordering::Relaxed);
    }
}

/// Who ran a page's compaction body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageActor {
    /// The collector thread's eager back-to-front pass or the pause.
    GcThread,
    /// A fault worker serving a mutator's fault.
    Worker,
}

/// Per-cycle page counters updated by every compacting thread.
#[derive(Debug, Default)]
pub struct PageCounters {
    by_gc_thread: AtomicUsize,
    by_workers: AtomicUsize,
    zero_pages: AtomicUsize,
    mapping_handoffs: AtomicUsize,
    batched_installs: AtomicUsize,
}

impl PageCounters {
    pub(crate) fn compacted(&self, actor: PageActor) {
        let counter = match actor {
            PageActor::GcThread => &self.by_gc_thread,
            PageActor::Worker => &self.by_workers,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn zero_page(&self) {
        self.zero_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handoff(&self) {
        self.mapping_handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batched_install(&self) {
        self.batched_installs.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of compaction bodies run so far this cycle.
    #[must_use]
    pub fn total_compacted(&self) -> usize {
        self.by_gc_thread.load(Ordering::Relaxed) + self.by_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.by_gc_thread,
            &self.by_workers,
            &self.zero_pages,
            &self.mapping_handoffs,
            &self.batched_installs,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Captures phase durations into a [`CollectionStats`].
///
/// # Example
///
/// ```
/// use rudo_compact::collector::GcPhase;
/// use rudo_compact::metrics::{CollectionStats, PhaseTimer};
///
/// let mut stats = CollectionStats::new();
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking work ...
/// timer.end(GcPhase::Marking, &mut stats);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create an idle timer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the running phase and add its duration to the matching field.
    pub fn end(&mut self, phase: GcPhase, stats: &mut CollectionStats) {
        let Some(start) = self.current_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        let field = match phase {
            GcPhase::Initialize | GcPhase::Marking => &mut stats.marking,
            GcPhase::MarkingPause => &mut stats.marking_pause,
            GcPhase::Reclaim => &mut stats.reclaim,
            GcPhase::PrepareForCompaction => &mut stats.prepare,
            GcPhase::PreCompactionPause => &mut stats.compaction_pause,
            GcPhase::Compaction => &mut stats.compaction,
            GcPhase::Finish => &mut stats.finish,
        };
        *field += elapsed;
    }
}

/// Process-level cumulative statistics across every heap.
///
/// # Example
///
/// ```
/// use rudo_compact::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total collections: {}", metrics.total_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    fallback_collections: AtomicUsize,
    pages_compacted: AtomicUsize,
    zero_pages: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            fallback_collections: AtomicUsize::new(0),
            pages_compacted: AtomicUsize::new(0),
            zero_pages: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Total cycles run.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Cycles that compacted inside the pause.
    #[inline]
    #[must_use]
    pub fn total_fallback_collections(&self) -> usize {
        self.fallback_collections.load(Ordering::Relaxed)
    }

    /// Pages that ran a compaction body.
    #[inline]
    #[must_use]
    pub fn total_pages_compacted(&self) -> usize {
        self.pages_compacted.load(Ordering::Relaxed)
    }

    /// Pages answered with zeroes.
    #[inline]
    #[must_use]
    pub fn total_zero_pages(&self) -> usize {
        self.zero_pages.load(Ordering::Relaxed)
    }

    /// Bytes given back by compaction and sweeping.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Time spent in pauses, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the process-wide cumulative metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Folds one cycle into the global counters.
pub(crate) fn record_metrics(stats: &CollectionStats) {
    let g = global_metrics();
    g.collections.fetch_add(1, Ordering::Relaxed);
    if stats.mode == Some(CompactionMode::Fallback) {
        g.fallback_collections.fetch_add(1, Ordering::Relaxed);
    }
    g.pages_compacted.fetch_add(stats.pages_compacted, Ordering::Relaxed);
    g.zero_pages.fetch_add(stats.zero_pages, Ordering::Relaxed);
    let reclaimed = stats.moving_bytes_before.saturating_sub(stats.moving_bytes_after)
        + stats.non_moving_bytes_freed;
    g.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
    g.pause_ns.fetch_add(
        stats.total_pause().as_nanos().try_into().unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default_to_zero() {
        let stats = CollectionStats::new();
        assert_eq!(stats.total_pause(), Duration::ZERO);
        assert_eq!(stats.mode, None);
        assert_eq!(stats.pages_compacted, 0);
    }

    #[test]
    fn test_phase_timer_accumulates() {
        let mut stats = CollectionStats::new();
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end(GcPhase::MarkingPause, &mut stats);
        let first = stats.marking_pause;
        assert!(first > Duration::ZERO);

        // Ending without a start is ignored.
        timer.end(GcPhase::MarkingPause, &mut stats);
        assert_eq!(stats.marking_pause, first);
    }

    #[test]
    fn test_page_counters_absorb() {
        let counters = PageCounters::default();
        counters.compacted(PageActor::GcThread);
        counters.compacted(PageActor::Worker);
        counters.compacted(PageActor::Worker);
        counters.zero_page();
        let mut stats = CollectionStats::new();
        stats.absorb(&counters);
        assert_eq!(stats.pages_compacted, 3);
        assert_eq!(stats.pages_by_workers, 2);
        assert_eq!(stats.zero_pages, 1);
        counters.reset();
        assert_eq!(counters.total_compacted(), 0);
    }
}
