//! Non-thread roots.
//!
//! [`GlobalRoots`] are strong and traced every cycle. [`WeakRoots`] are not
//! traced: after marking, entries whose referent is unmarked are cleared and
//! the rest are rewritten at the compaction pause like any other root.
//!
//! Between the marking pause and the end of weak processing a weak read could
//! hand out an object the sweep is about to free, so reads through
//! [`WeakAccessGate`] block for that window.

use parking_lot::{Condvar, Mutex};

/// Strong roots that do not belong to a thread.
#[derive(Debug, Default)]
pub struct GlobalRoots {
    slots: Mutex<Vec<usize>>,
}

impl GlobalRoots {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root and returns its index.
    pub fn add(&self, value: usize) -> usize {
        let mut slots = self.slots.lock();
        slots.push(value);
        slots.len() - 1
    }

    /// Value of root `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> usize {
        self.slots.lock()[index]
    }

    /// Overwrites root `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: usize) {
        self.slots.lock()[index] = value;
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// `true` when there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Calls `visitor` on every non-null root.
    pub fn visit(&self, mut visitor: impl FnMut(usize)) {
        for &value in self.slots.lock().iter() {
            if value != 0 {
                visitor(value);
            }
        }
    }

    /// Replaces every non-null root with `update(root)`.
    pub fn update(&self, mut update: impl FnMut(usize) -> usize) {
        for value in self.slots.lock().iter_mut() {
            if *value != 0 {
                *value = update(*value);
            }
        }
    }
}

/// Weak roots: cleared when their referent dies.
#[derive(Debug, Default)]
pub struct WeakRoots {
    slots: Mutex<Vec<usize>>,
}

impl WeakRoots {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a weak root and returns its index.
    pub fn add(&self, value: usize) -> usize {
        let mut slots = self.slots.lock();
        slots.push(value);
        slots.len() - 1
    }

    /// Value of weak root `index`, 0 once cleared.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> usize {
        self.slots.lock()[index]
    }

    /// Number of weak roots, cleared ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// `true` when there are no weak roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Clears every entry whose referent is not marked. Returns how many
    /// were cleared.
    pub fn sweep(&self, is_marked: impl Fn(usize) -> bool) -> usize {
        let mut cleared = 0;
        for value in self.slots.lock().iter_mut() {
            if *value != 0 && !is_marked(*value) {
                *value = 0;
                cleared += 1;
            }
        }
        cleared
    }

    /// Replaces every non-null entry with `update(entry)`.
    pub fn update(&self, mut update: impl FnMut(usize) -> usize) {
        for value in self.slots.lock().iter_mut() {
            if *value != 0 {
                *value = update(*value);
            }
        }
    }
}

/// Blocks weak reads while weak processing is pending.
#[derive(Debug)]
pub struct WeakAccessGate {
    allowed: Mutex<bool>,
    cond: Condvar,
}

impl Default for WeakAccessGate {
    fn default() -> Self {
        Self {
            allowed: Mutex::new(true),
            cond: Condvar::new(),
        }
    }
}

impl WeakAccessGate {
    /// Blocks new weak reads. Called from the marking pause.
    pub fn disallow(&self) {
        *self.allowed.lock() = false;
    }

    /// Lets weak reads through again and wakes every blocked reader.
    pub fn allow(&self) {
        *self.allowed.lock() = true;
        self.cond.notify_all();
    }

    /// Returns once weak reads are allowed.
    pub fn wait(&self) {
        let mut allowed = self.allowed.lock();
        while !*allowed {
            self.cond.wait(&mut allowed);
        }
    }

    /// `true` if weak reads currently go through without blocking.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        *self.allowed.lock()
    }
}
