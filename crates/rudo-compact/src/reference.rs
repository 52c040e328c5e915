//! Weak reference processing.
//!
//! Marking does not trace slot 0 of a [`ObjectKind::WeakReference`] object;
//! it hands the object to [`ReferenceProcessor::delay_referent`] instead.
//! Once marking is over, references whose referent stayed unmarked are
//! cleared and queued. The queue is a root set until the cycle ends, after
//! which the registered callback receives the cleared references at their
//! final addresses.
//!
//! [`ObjectKind::WeakReference`]: crate::object::ObjectKind::WeakReference

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::object::{load_slot, slot_offset, store_slot, ObjRef};

/// Callback receiving the references cleared by one cycle.
pub type ReferenceCallback = Box<dyn Fn(&[ObjRef]) + Send + Sync>;

/// Tracks weak references discovered while marking.
#[derive(Default)]
pub struct ReferenceProcessor {
    delayed: Mutex<Vec<usize>>,
    cleared: SegQueue<usize>,
    callback: RwLock<Option<ReferenceCallback>>,
}

impl std::fmt::Debug for ReferenceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceProcessor")
            .field("delayed", &self.delayed.lock().len())
            .field("cleared", &self.cleared.len())
            .finish_non_exhaustive()
    }
}

impl ReferenceProcessor {
    /// Creates an empty processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a marked reference object whose referent is decided later.
    pub fn delay_referent(&self, reference: usize) {
        self.delayed.lock().push(reference);
    }

    /// Number of references waiting for processing.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().len()
    }

    /// Clears every delayed reference whose referent is not marked and
    /// queues it. Returns the number cleared.
    ///
    /// # Safety
    ///
    /// Every delayed reference must still be a valid, readable object.
    pub unsafe fn process_references(&self, is_marked: impl Fn(usize) -> bool) -> usize {
        let delayed = std::mem::take(&mut *self.delayed.lock());
        let mut cleared = 0;
        for reference in delayed {
            let slot = reference + slot_offset(0);
            // SAFETY: `reference` is a live weak reference with one slot.
            let referent = unsafe { load_slot(slot) };
            if referent != 0 && !is_marked(referent) {
                // SAFETY: as above.
                unsafe { store_slot(slot, 0) };
                self.cleared.push(reference);
                cleared += 1;
            }
        }
        cleared
    }

    /// Rewrites every queued reference through `update`.
    pub fn update_cleared(&self, mut update: impl FnMut(usize) -> usize) {
        let pending: Vec<usize> = std::iter::from_fn(|| self.cleared.pop()).collect();
        for reference in pending {
            self.cleared.push(update(reference));
        }
    }

    /// Calls `visitor` on every queued reference.
    pub fn visit_cleared(&self, mut visitor: impl FnMut(usize)) {
        let pending: Vec<usize> = std::iter::from_fn(|| self.cleared.pop()).collect();
        for &reference in &pending {
            visitor(reference);
        }
        for reference in pending {
            self.cleared.push(reference);
        }
    }

    /// Installs the callback run after each cycle.
    pub fn set_callback(&self, callback: ReferenceCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Hands every queued reference to the callback and empties the queue.
    /// Returns the number handed over.
    pub fn run_pending_callbacks(&self) -> usize {
        let cleared: Vec<ObjRef> = std::iter::from_fn(|| self.cleared.pop())
            .filter_map(ObjRef::from_addr)
            .collect();
        if let Some(callback) = self.callback.read().as_ref() {
            if !cleared.is_empty() {
                callback(&cleared);
            }
        }
        cleared.len()
    }
}
