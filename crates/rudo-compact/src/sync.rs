//! # Lock Ordering Discipline
//!
//! The collector takes a small, fixed set of locks. They must be acquired in
//! increasing level:
//!
//! | Level | Lock              | Held by                                        |
//! |-------|-------------------|------------------------------------------------|
//! | 1     | `MutatorLock`     | shared by runnable mutators, exclusive in pauses |
//! | 2     | `HeapBitmapLock`  | shared while marking/sweeping, exclusive in pauses |
//! | 3     | `ThreadListLock`  | thread registration and checkpoint broadcast     |
//! | 4     | `MarkStackLock`   | checkpoint producers and the draining GC thread  |
//!
//! A mutator's own state lock is not tracked. Checkpoint closures run while
//! it is held and may only take `MarkStackLock`.
//!
//! ## Validation
//!
//! In debug builds every tracked acquisition goes through [`LockGuard::new`],
//! which panics when a lower level is taken while a higher one is held by the
//! same thread.
//!
//! ```
//! use rudo_compact::sync::{LockGuard, LockOrder};
//!
//! let _mutator = LockGuard::new(LockOrder::MutatorLock);
//! let _bitmap = LockGuard::new(LockOrder::HeapBitmapLock);
//! ```

use std::cell::RefCell;

const MAX_LOCK_DEPTH: usize = 16;

thread_local! {
    /// Levels of the tracked locks this thread holds, in acquisition order.
    static HELD: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH));
}

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Mutator lock (level 1).
    MutatorLock = 1,
    /// Heap bitmap lock (level 2).
    HeapBitmapLock = 2,
    /// Thread list lock (level 3).
    ThreadListLock = 3,
    /// Mark stack lock (level 4).
    MarkStackLock = 4,
}

impl LockOrder {
    /// Acquisition level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    const fn from_level(level: u8) -> Self {
        match level {
            2 => Self::HeapBitmapLock,
            3 => Self::ThreadListLock,
            4 => Self::MarkStackLock,
            _ => Self::MutatorLock,
        }
    }
}

/// RAII marker validating and recording a tracked acquisition.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates `tag` against the locks this thread holds and records it.
    ///
    /// # Panics
    ///
    /// Panics in debug builds on an ordering violation.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, highest_held());
            // Thread-local teardown may already have run.
            let _ = HELD.try_with(|held| held.borrow_mut().push(tag.level()));
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD.try_with(|held| held.borrow_mut().pop());
    }
}

/// Panics in debug builds if `tag` is below `held`.
#[inline]
pub fn validate_lock_order(tag: LockOrder, held: Option<LockOrder>) {
    if let Some(held) = held {
        debug_assert!(
            tag.level() > held.level(),
            "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {held:?} (level {})",
            tag.level(),
            held.level()
        );
    }
}

/// Highest level held by this thread, if any.
#[must_use]
pub fn highest_held() -> Option<LockOrder> {
    HELD.try_with(|held| held.borrow().iter().copied().max())
        .ok()
        .flatten()
        .map(LockOrder::from_level)
}

#[cfg(test)]
mod tests {
    use super::{highest_held, LockGuard, LockOrder};

    #[test]
    fn test_in_order() {
        let _a = LockGuard::new(LockOrder::MutatorLock);
        let _b = LockGuard::new(LockOrder::HeapBitmapLock);
        let _c = LockGuard::new(LockOrder::MarkStackLock);
        assert_eq!(highest_held(), Some(LockOrder::MarkStackLock));
    }

    #[test]
    fn test_state_restored_after_drop() {
        {
            let _a = LockGuard::new(LockOrder::MarkStackLock);
        }
        assert_eq!(highest_held(), None);
        let _b = LockGuard::new(LockOrder::MutatorLock);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_thread_list_after_mark_stack_panics() {
        let _a = LockGuard::new(LockOrder::MarkStackLock);
        let _b = LockGuard::new(LockOrder::ThreadListLock);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_reacquire_same_level_panics() {
        let _a = LockGuard::new(LockOrder::HeapBitmapLock);
        let _b = LockGuard::new(LockOrder::HeapBitmapLock);
    }
}
