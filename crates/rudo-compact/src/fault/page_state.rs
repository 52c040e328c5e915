//! Per-page relocation state.
//!
//! ```text
//!                  copy mode / faulter
//!   Unprocessed ─────────────────────────────► ProcessingAndMapping ──► Mapped
//!        │                                            ▲    ▲
//!        │ minor mode, eager compactor                │    │ claim_processed
//!        ▼                    upgrade (faulter)       │    │
//!   Processing ───────────────────────────────────────┘    │
//!        │                                                 │
//!        │ finish_processing (release)                     │
//!        ▼                                                 │
//!    Processed ────────────────────────────────────────────┘
//! ```
//!
//! Every transition is a single compare-and-swap, so exactly one thread
//! wins each edge. The compacted bytes are published by the release edges
//! into `Processed` and `Mapped`.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

/// State of one destination page in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Nobody touched the page yet.
    Unprocessed = 0,
    /// Being compacted into the shadow buffer; not to be mapped yet.
    Processing = 1,
    /// Whoever finishes the compaction also maps the page.
    ProcessingAndMapping = 2,
    /// Compacted bytes are ready in the shadow buffer.
    Processed = 3,
    /// Installed in the moving space.
    Mapped = 4,
}

impl PageState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unprocessed,
            1 => Self::Processing,
            2 => Self::ProcessingAndMapping,
            3 => Self::Processed,
            _ => Self::Mapped,
        }
    }
}

/// The state array of one cycle. A new one is allocated every cycle.
#[derive(Debug)]
pub struct PageStates {
    states: Box<[AtomicU8]>,
}

impl PageStates {
    /// `pages` states, all [`PageState::Unprocessed`].
    #[must_use]
    pub fn new(pages: usize) -> Self {
        Self {
            states: (0..pages).map(|_| AtomicU8::new(PageState::Unprocessed as u8)).collect(),
        }
    }

    /// Number of pages tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// `true` if no page is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state. Observing [`PageState::Mapped`] makes the installed
    /// bytes visible.
    #[must_use]
    pub fn get(&self, idx: usize) -> PageState {
        PageState::from_u8(self.states[idx].load(Ordering::Acquire))
    }

    fn transition(&self, idx: usize, from: PageState, to: PageState, success: Ordering) -> Result<(), PageState> {
        self.states[idx]
            .compare_exchange(from as u8, to as u8, success, Ordering::Acquire)
            .map(|_| ())
            .map_err(PageState::from_u8)
    }

    /// `Unprocessed → to`. On failure returns the state found.
    ///
    /// # Errors
    ///
    /// Returns the current state if the page was not unprocessed.
    pub fn try_claim(&self, idx: usize, to: PageState) -> Result<(), PageState> {
        self.transition(idx, PageState::Unprocessed, to, Ordering::Acquire)
    }

    /// `Processing → ProcessingAndMapping`: asks the compactor to map the
    /// page itself when done.
    ///
    /// # Errors
    ///
    /// Returns the current state if the page was not being processed.
    pub fn upgrade(&self, idx: usize) -> Result<(), PageState> {
        self.transition(idx, PageState::Processing, PageState::ProcessingAndMapping, Ordering::AcqRel)
    }

    /// `Processing → Processed`, publishing the compacted bytes.
    ///
    /// # Errors
    ///
    /// Returns the current state; [`PageState::ProcessingAndMapping`] means
    /// a faulter upgraded the page and the caller must map it.
    pub fn finish_processing(&self, idx: usize) -> Result<(), PageState> {
        self.transition(idx, PageState::Processing, PageState::Processed, Ordering::Release)
    }

    /// `Processed → ProcessingAndMapping`: takes over mapping a compacted
    /// page.
    ///
    /// # Errors
    ///
    /// Returns the current state if another thread claimed it first.
    pub fn claim_processed(&self, idx: usize) -> Result<(), PageState> {
        self.transition(idx, PageState::Processed, PageState::ProcessingAndMapping, Ordering::Acquire)
    }

    /// Marks the page installed.
    pub fn set_mapped(&self, idx: usize) {
        self.states[idx].store(PageState::Mapped as u8, Ordering::Release);
    }

    /// Every page back to [`PageState::Unprocessed`].
    pub fn reset(&self) {
        for state in &*self.states {
            state.store(PageState::Unprocessed as u8, Ordering::Relaxed);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_copy_mode_claim_is_exclusive() {
        let states = PageStates::new(2);
        assert_eq!(states.try_claim(0, PageState::ProcessingAndMapping), Ok(()));
        assert_eq!(
            states.try_claim(0, PageState::ProcessingAndMapping),
            Err(PageState::ProcessingAndMapping)
        );
        states.set_mapped(0);
        assert_eq!(states.get(0), PageState::Mapped);
        assert_eq!(states.get(1), PageState::Unprocessed);
    }

    #[test]
    fn test_upgrade_forces_compactor_to_map() {
        let states = PageStates::new(1);
        states.try_claim(0, PageState::Processing).unwrap();
        assert_eq!(states.upgrade(0), Ok(()));
        assert_eq!(states.finish_processing(0), Err(PageState::ProcessingAndMapping));
    }

    #[test]
    fn test_processed_page_is_claimed_once() {
        let states = PageStates::new(1);
        states.try_claim(0, PageState::Processing).unwrap();
        states.finish_processing(0).unwrap();
        assert_eq!(states.upgrade(0), Err(PageState::Processed));
        assert_eq!(states.claim_processed(0), Ok(()));
        assert_eq!(states.claim_processed(0), Err(PageState::ProcessingAndMapping));
        states.reset();
        assert_eq!(states.get(0), PageState::Unprocessed);
    }
}
