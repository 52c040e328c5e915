//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collection cycles. Without it the same functions
//! exist as no-ops and warnings go to stderr.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::collector::GcPhase;

    /// Process-wide cycle number carried by the `gc_collect` span. Starts
    /// at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Hands out the next cycle number.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole cycle.
    pub fn trace_gc_collection(mode: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", compaction_mode = mode, gc_id = gc_id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// `phase_start` event with the moving space's current size.
    pub fn log_phase_start(phase: GcPhase, bytes: usize) {
        tracing::debug!(phase = ?phase, bytes, "phase_start");
    }

    /// `phase_end` event, same fields.
    pub fn log_phase_end(phase: GcPhase, bytes: usize) {
        tracing::debug!(phase = ?phase, bytes, "phase_end");
    }

    /// Warning that does not abort.
    pub fn warn(message: &str) {
        tracing::warn!("{message}");
    }

    /// Diagnostic printed right before an abort.
    pub fn fatal(message: &str) {
        tracing::error!("{message}");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    //! No-op versions of the tracing hooks.

    use crate::collector::GcPhase;

    /// Cycle identifier. Always 0 without the `tracing` feature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Returns `GcId(0)`.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Placeholder for an entered span.
    pub struct NoSpan;

    /// Does nothing.
    pub const fn trace_gc_collection(_mode: &str, _gc_id: GcId) -> NoSpan {
        NoSpan
    }

    /// Does nothing.
    pub const fn trace_phase(_phase: GcPhase) -> NoSpan {
        NoSpan
    }

    /// Does nothing.
    pub const fn log_phase_start(_phase: GcPhase, _bytes: usize) {}

    /// Does nothing.
    pub const fn log_phase_end(_phase: GcPhase, _bytes: usize) {}

    /// Prints `message` to stderr.
    pub fn warn(message: &str) {
        eprintln!("[rudo-compact] warning: {message}");
    }

    /// Prints `message` to stderr before an abort.
    pub fn fatal(message: &str) {
        eprintln!("[rudo-compact] fatal: {message}");
    }
}

pub use internal::GcId;
