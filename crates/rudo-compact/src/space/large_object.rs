//! Large-object space: one page-aligned mapping per object.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::RwLock;
use sys_alloc::Mmap;

use super::reserve;
use crate::accounting::{CARD_CLEAN, CARD_DIRTY};
use crate::error::{fatal::SpaceExtent, GcError};

#[derive(Debug)]
struct LargeObject {
    mem: Mmap,
    marked: AtomicBool,
    /// Card value for the whole object.
    card: AtomicU8,
}

/// Objects too big for the moving space.
#[derive(Debug, Default)]
pub struct LargeObjectSpace {
    objects: RwLock<BTreeMap<usize, LargeObject>>,
    bytes: AtomicUsize,
    allocate_black: AtomicBool,
}

impl LargeObjectSpace {
    /// Creates an empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zeroed object of `bytes` and returns its address.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Map`] if the mapping fails.
    pub fn alloc(&self, bytes: usize) -> Result<usize, GcError> {
        let mem = reserve(bytes)?;
        let addr = mem.ptr() as usize;
        self.bytes.fetch_add(mem.len(), Ordering::Relaxed);
        let object = LargeObject {
            mem,
            marked: AtomicBool::new(self.allocate_black.load(Ordering::Acquire)),
            card: AtomicU8::new(CARD_CLEAN),
        };
        self.objects.write().insert(addr, object);
        Ok(addr)
    }

    /// While set, new objects start out marked. Set from the marking pause
    /// until the end of the cycle.
    pub fn set_allocate_black(&self, black: bool) {
        self.allocate_black.store(black, Ordering::Release);
    }

    /// `true` if `addr` is the start of a large object.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.objects.read().contains_key(&addr)
    }

    /// Start of the large object covering `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<usize> {
        let objects = self.objects.read();
        let (&start, object) = objects.range(..=addr).next_back()?;
        (addr < start + object.mem.len()).then_some(start)
    }

    /// Sets the mark flag. Returns `Some(true)` if it was already set and
    /// `None` if `addr` is not a large object.
    pub fn test_and_set_mark(&self, addr: usize) -> Option<bool> {
        let objects = self.objects.read();
        objects
            .get(&addr)
            .map(|object| object.marked.swap(true, Ordering::AcqRel))
    }

    /// Mark flag of the object at `addr`.
    #[must_use]
    pub fn is_marked(&self, addr: usize) -> Option<bool> {
        self.objects
            .read()
            .get(&addr)
            .map(|object| object.marked.load(Ordering::Acquire))
    }

    /// Clears every mark flag.
    pub fn clear_marks(&self) {
        for object in self.objects.read().values() {
            object.marked.store(false, Ordering::Relaxed);
        }
    }

    /// Write barrier for the object at `addr`.
    pub fn mark_card(&self, addr: usize) {
        if let Some(object) = self.objects.read().get(&addr) {
            object.card.store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Replaces every object's card with `age(card)`.
    pub fn age_cards(&self, age: impl Fn(u8) -> u8) {
        for object in self.objects.read().values() {
            let card = object.card.load(Ordering::Relaxed);
            object.card.store(age(card), Ordering::Relaxed);
        }
    }

    /// Calls `visitor` on every marked object whose card is at least
    /// `min_age`, resetting the card to clean first.
    pub fn scan_cards(&self, min_age: u8, mut visitor: impl FnMut(usize)) {
        let dirty: Vec<usize> = {
            let objects = self.objects.read();
            objects
                .iter()
                .filter(|(_, object)| {
                    object.card.load(Ordering::Relaxed) >= min_age
                        && object.marked.load(Ordering::Acquire)
                })
                .map(|(&addr, object)| {
                    object.card.store(CARD_CLEAN, Ordering::Relaxed);
                    addr
                })
                .collect()
        };
        for addr in dirty {
            visitor(addr);
        }
    }

    /// Calls `visitor` on every marked object.
    pub fn for_each_marked(&self, mut visitor: impl FnMut(usize)) {
        let marked: Vec<usize> = self
            .objects
            .read()
            .iter()
            .filter(|(_, object)| object.marked.load(Ordering::Acquire))
            .map(|(&addr, _)| addr)
            .collect();
        for addr in marked {
            visitor(addr);
        }
    }

    /// Calls `visitor` on every object.
    pub fn for_each_object(&self, mut visitor: impl FnMut(usize)) {
        let all: Vec<usize> = self.objects.read().keys().copied().collect();
        for addr in all {
            visitor(addr);
        }
    }

    /// Unmaps every unmarked object. Returns `(objects, bytes)` freed.
    pub fn sweep(&self) -> (usize, usize) {
        let mut objects = self.objects.write();
        let before = objects.len();
        let mut freed = 0;
        objects.retain(|_, object| {
            let keep = object.marked.load(Ordering::Acquire);
            if !keep {
                freed += object.mem.len();
            }
            keep
        });
        self.bytes.fetch_sub(freed, Ordering::Relaxed);
        (before - objects.len(), freed)
    }

    /// Mapped bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// `true` when there are no large objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub(crate) fn extents(&self) -> Vec<SpaceExtent> {
        self.objects
            .read()
            .iter()
            .map(|(&begin, object)| SpaceExtent {
                name: "large object",
                begin,
                end: begin + object.mem.len(),
            })
            .collect()
    }
}
