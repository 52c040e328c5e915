//! Growable mark stack.
//!
//! Array-backed with an explicit capacity that doubles when full. Checkpoint
//! closures reserve a run of slots with [`MarkStack::bump_back`] under the
//! mark-stack lock and then fill it in one go.

/// Stack of object addresses awaiting a scan.
#[derive(Debug)]
pub struct MarkStack {
    slots: Vec<usize>,
    capacity: usize,
}

impl MarkStack {
    /// Creates an empty stack that can hold `capacity` entries before the
    /// first expansion.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Current logical capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `true` when a push would need an expansion.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Doubles the capacity, preserving the entries.
    pub fn expand(&mut self) {
        let new_capacity = self.capacity * 2;
        self.slots.reserve(new_capacity - self.slots.len());
        self.capacity = new_capacity;
    }

    /// Pushes, expanding first if full.
    pub fn push(&mut self, obj: usize) {
        if self.is_full() {
            self.expand();
        }
        self.slots.push(obj);
    }

    /// Pops the most recently pushed entry.
    pub fn pop(&mut self) -> Option<usize> {
        self.slots.pop()
    }

    /// Reserves `count` slots at the top and returns them for filling, or
    /// `None` when there is not enough room.
    pub fn bump_back(&mut self, count: usize) -> Option<&mut [usize]> {
        if self.slots.len() + count > self.capacity {
            return None;
        }
        let start = self.slots.len();
        self.slots.resize(start + count, 0);
        Some(&mut self.slots[start..])
    }

    /// Drops all entries and shrinks back to `capacity`.
    pub fn reset(&mut self, capacity: usize) {
        self.slots.clear();
        self.slots.shrink_to(capacity);
        self.capacity = capacity.max(1);
    }
}
