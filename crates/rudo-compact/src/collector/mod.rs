//! The mark-compact collector.
//!
//! One cycle runs these phases in order, never skipping one:
//!
//! | Phase                  | Mutators  | Work                                              |
//! |------------------------|-----------|---------------------------------------------------|
//! | `Initialize`           | running   | reset per-cycle tables                            |
//! | `Marking`              | running   | trace roots, two card passes                      |
//! | `MarkingPause`         | suspended | remark, set the black-allocation boundary         |
//! | `Reclaim`              | running   | references, weak roots, sweeps                    |
//! | `PrepareForCompaction` | running   | first-object tables, chunk prefix sum             |
//! | `PreCompactionPause`   | suspended | update every root, remap, arm the fault gate      |
//! | `Compaction`           | running   | eager and fault-driven page relocation            |
//! | `Finish`               | running   | release the from-space, reset state               |
//!
//! Only objects of the moving space are relocated. Objects allocated after
//! the marking pause ("black" objects) are all considered live and slide by
//! one constant; everything below the boundary is compacted using the
//! live-words bitmap.

mod compact;
mod live_words;
mod marking;
mod phases;
mod planner;

pub use live_words::{LiveWordsBitmap, CHUNK_SIZE};
pub use planner::CompactionPlan;

pub(crate) use compact::{compact_page, slide_black_page};
pub(crate) use marking::is_marked;
#[cfg(test)]
pub(crate) use planner::tests::plan_for;

use crate::metrics::{CollectionStats, PhaseTimer};

/// Collection phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Per-cycle tables are reset.
    Initialize,
    /// Concurrent marking, including the card pre-cleaning pass.
    Marking,
    /// Mutators suspended; the final remark.
    MarkingPause,
    /// Reference processing, weak roots and sweeping.
    Reclaim,
    /// Building the compaction tables.
    PrepareForCompaction,
    /// Mutators suspended; roots rewritten to post-compaction addresses.
    PreCompactionPause,
    /// Pages relocated while mutators run.
    Compaction,
    /// Scratch mappings released.
    Finish,
}

/// Collector state that outlives one cycle.
///
/// Owned by the heap behind a mutex, so at most one cycle runs at a time.
#[derive(Debug)]
pub(crate) struct MarkCompact {
    /// Per-word liveness of the moving space, filled while marking.
    live_words: LiveWordsBitmap,
    /// Live bytes per chunk while marking; destination offsets after the
    /// prefix sum. One extra trailing entry holds the total.
    chunk_info: Vec<u32>,
    /// Non-moving allocation stack frozen by the marking pause.
    frozen_alloc_stack: Vec<usize>,
    cycles: u64,
    stats: CollectionStats,
    timer: PhaseTimer,
}

impl MarkCompact {
    pub(crate) fn new(moving_begin: usize, moving_capacity: usize) -> Self {
        let live_words = LiveWordsBitmap::new(moving_begin, moving_capacity);
        let chunks = live_words.chunks();
        Self {
            live_words,
            chunk_info: vec![0; chunks + 1],
            frozen_alloc_stack: Vec::new(),
            cycles: 0,
            stats: CollectionStats::new(),
            timer: PhaseTimer::new(),
        }
    }

    /// Records the words of a moving-space object marked below the black
    /// boundary.
    fn update_liveness_info(&mut self, obj: usize, size: usize) {
        let begin_bit = self.live_words.set_live_words(obj, size);
        let mut chunk = begin_bit * crate::object::OBJECT_ALIGNMENT / CHUNK_SIZE;
        let first_in_chunk = CHUNK_SIZE - (obj - self.live_words.begin()) % CHUNK_SIZE;
        let mut remaining = size;
        let first = first_in_chunk.min(remaining);
        self.chunk_info[chunk] += first as u32;
        remaining -= first;
        while remaining > 0 {
            chunk += 1;
            let part = remaining.min(CHUNK_SIZE);
            self.chunk_info[chunk] += part as u32;
            remaining -= part;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4000_0000;

    #[test]
    fn test_liveness_info_splits_across_chunks() {
        let mut gc = MarkCompact::new(BASE, 8 * CHUNK_SIZE);
        gc.update_liveness_info(BASE + CHUNK_SIZE - 24, 2 * CHUNK_SIZE + 40);
        assert_eq!(gc.chunk_info[0], 24);
        assert_eq!(gc.chunk_info[1], CHUNK_SIZE as u32);
        assert_eq!(gc.chunk_info[2], CHUNK_SIZE as u32);
        assert_eq!(gc.chunk_info[3], 16);
        for chunk in 0..4 {
            assert_eq!(gc.chunk_info[chunk] as usize, gc.live_words.live_bytes_in_chunk(chunk));
        }
    }
}
