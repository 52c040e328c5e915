//! Object-start bitmap over a contiguous address range.
//!
//! One bit per [`OBJECT_ALIGNMENT`] bytes. A set bit means "an object starts
//! here" for mark and live bitmaps. All updates go through atomics so
//! checkpoint closures on mutator threads can mark concurrently with the GC
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::OBJECT_ALIGNMENT;

const BITS_PER_WORD: usize = 64;
const BYTES_PER_WORD: usize = BITS_PER_WORD * OBJECT_ALIGNMENT;

/// A bitmap with one bit per aligned word of `[begin, begin + capacity)`.
///
/// # Example
///
/// ```
/// use rudo_compact::accounting::SpaceBitmap;
///
/// let bitmap = SpaceBitmap::new("example", 0x10000, 4096);
/// assert!(!bitmap.atomic_test_and_set(0x10040));
/// assert!(bitmap.atomic_test_and_set(0x10040));
/// assert!(bitmap.test(0x10040));
/// ```
#[derive(Debug)]
pub struct SpaceBitmap {
    name: &'static str,
    begin: usize,
    capacity: usize,
    words: Box<[AtomicU64]>,
}

impl SpaceBitmap {
    /// Creates a cleared bitmap covering `capacity` bytes from `begin`.
    #[must_use]
    pub fn new(name: &'static str, begin: usize, capacity: usize) -> Self {
        let len = capacity.div_ceil(BYTES_PER_WORD);
        let words = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            begin,
            capacity,
            words,
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// First covered address.
    #[must_use]
    pub const fn heap_begin(&self) -> usize {
        self.begin
    }

    /// One past the last covered address.
    #[must_use]
    pub const fn heap_limit(&self) -> usize {
        self.begin + self.capacity
    }

    /// `true` if `addr` is inside the covered range.
    #[inline]
    #[must_use]
    pub const fn has_address(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.begin) < self.capacity
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, u64) {
        debug_assert!(
            self.has_address(addr),
            "{}: {addr:#x} outside [{:#x}, {:#x})",
            self.name,
            self.begin,
            self.heap_limit()
        );
        let bit = (addr - self.begin) / OBJECT_ALIGNMENT;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    /// Tests the bit for `addr`.
    #[inline]
    #[must_use]
    pub fn test(&self, addr: usize) -> bool {
        let (idx, mask) = self.locate(addr);
        self.words[idx].load(Ordering::Relaxed) & mask != 0
    }

    /// Sets the bit for `addr`; returns whether it was already set.
    #[inline]
    pub fn set(&self, addr: usize) -> bool {
        let (idx, mask) = self.locate(addr);
        let word = &self.words[idx];
        let old = word.load(Ordering::Relaxed);
        if old & mask == 0 {
            word.fetch_or(mask, Ordering::Relaxed);
        }
        old & mask != 0
    }

    /// Atomically sets the bit for `addr`; returns whether it was already
    /// set. Exactly one of several racing callers observes `false`.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: usize) -> bool {
        let (idx, mask) = self.locate(addr);
        let word = &self.words[idx];
        if word.load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        word.fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Clears the bit for `addr`; returns whether it was set.
    #[inline]
    pub fn clear(&self, addr: usize) -> bool {
        let (idx, mask) = self.locate(addr);
        self.words[idx].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    /// Clears every bit in `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        let mut addr = begin;
        while addr < end && (addr - self.begin) % BYTES_PER_WORD != 0 {
            self.clear(addr);
            addr += OBJECT_ALIGNMENT;
        }
        while addr + BYTES_PER_WORD <= end {
            let (idx, _) = self.locate(addr);
            self.words[idx].store(0, Ordering::Relaxed);
            addr += BYTES_PER_WORD;
        }
        while addr < end {
            self.clear(addr);
            addr += OBJECT_ALIGNMENT;
        }
    }

    /// Clears the whole bitmap.
    pub fn clear_all(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Copies every word of `other`, which must cover the same range.
    pub fn copy_from(&self, other: &Self) {
        debug_assert_eq!(self.begin, other.begin);
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Calls `visitor` with the address of every set bit in `[begin, end)`,
    /// in increasing order. Bits may be changed while visiting; each word is
    /// loaded once.
    pub fn visit_marked_range(&self, begin: usize, end: usize, mut visitor: impl FnMut(usize)) {
        self.walk_marked_range(begin, end, |addr| {
            visitor(addr);
            true
        });
    }

    /// Returns the lowest set address in `[begin, end)`.
    #[must_use]
    pub fn find_first_marked(&self, begin: usize, end: usize) -> Option<usize> {
        let mut found = None;
        self.walk_marked_range(begin, end, |addr| {
            found = Some(addr);
            false
        });
        found
    }

    fn walk_marked_range(&self, begin: usize, end: usize, mut visitor: impl FnMut(usize) -> bool) {
        let end = end.min(self.heap_limit());
        if begin >= end {
            return;
        }
        let first_bit = (begin - self.begin) / OBJECT_ALIGNMENT;
        let end_bit = (end - self.begin).div_ceil(OBJECT_ALIGNMENT);
        let mut idx = first_bit / BITS_PER_WORD;
        let last_idx = (end_bit - 1) / BITS_PER_WORD;
        while idx <= last_idx {
            let mut word = self.words[idx].load(Ordering::Relaxed);
            let base_bit = idx * BITS_PER_WORD;
            if idx == first_bit / BITS_PER_WORD {
                word &= !0u64 << (first_bit % BITS_PER_WORD);
            }
            if idx == last_idx && end_bit % BITS_PER_WORD != 0 {
                word &= (1u64 << (end_bit % BITS_PER_WORD)) - 1;
            }
            while word != 0 {
                let shift = word.trailing_zeros() as usize;
                if !visitor(self.begin + (base_bit + shift) * OBJECT_ALIGNMENT) {
                    return;
                }
                word &= word - 1;
            }
            idx += 1;
        }
    }

    /// Returns the highest set address that is `<= addr` and `>= min_addr`.
    #[must_use]
    pub fn find_preceding_object(&self, addr: usize, min_addr: usize) -> Option<usize> {
        let min_addr = min_addr.max(self.begin);
        if addr < min_addr {
            return None;
        }
        let bit = (addr - self.begin) / OBJECT_ALIGNMENT;
        let min_bit = (min_addr - self.begin) / OBJECT_ALIGNMENT;
        let mut idx = bit / BITS_PER_WORD;
        let mut word = self.words[idx].load(Ordering::Relaxed);
        let keep = bit % BITS_PER_WORD;
        if keep != BITS_PER_WORD - 1 {
            word &= (1u64 << (keep + 1)) - 1;
        }
        loop {
            if word != 0 {
                let found = idx * BITS_PER_WORD + (BITS_PER_WORD - 1 - word.leading_zeros() as usize);
                return (found >= min_bit).then_some(self.begin + found * OBJECT_ALIGNMENT);
            }
            if idx == 0 || (idx * BITS_PER_WORD) <= min_bit {
                return None;
            }
            idx -= 1;
            word = self.words[idx].load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SpaceBitmap;
    use std::sync::Arc;
    use std::thread;

    const BASE: usize = 0x4000_0000;

    #[test]
    fn test_set_clear_test() {
        let bitmap = SpaceBitmap::new("t", BASE, 4096);
        assert!(!bitmap.set(BASE + 8));
        assert!(bitmap.set(BASE + 8));
        assert!(bitmap.test(BASE + 8));
        assert!(!bitmap.test(BASE + 16));
        assert!(bitmap.clear(BASE + 8));
        assert!(!bitmap.test(BASE + 8));
    }

    #[test]
    fn test_concurrent_test_and_set_single_winner() {
        let bitmap = Arc::new(SpaceBitmap::new("t", BASE, 4096));
        let winners: usize = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || usize::from(!bitmap.atomic_test_and_set(BASE + 512)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_visit_marked_range_edges() {
        let bitmap = SpaceBitmap::new("t", BASE, 8192);
        for off in [0, 8, 504, 512, 1024, 4096, 8184] {
            bitmap.set(BASE + off);
        }
        let mut seen = Vec::new();
        bitmap.visit_marked_range(BASE + 8, BASE + 4096, |a| seen.push(a - BASE));
        assert_eq!(seen, vec![8, 504, 512, 1024]);

        seen.clear();
        bitmap.visit_marked_range(BASE, BASE + 8192, |a| seen.push(a - BASE));
        assert_eq!(seen.len(), 7);
        assert_eq!(bitmap.find_first_marked(BASE + 16, BASE + 8192), Some(BASE + 504));
        assert_eq!(bitmap.find_first_marked(BASE + 1032, BASE + 4096), None);
    }

    #[test]
    fn test_find_preceding_object() {
        let bitmap = SpaceBitmap::new("t", BASE, 8192);
        bitmap.set(BASE + 64);
        bitmap.set(BASE + 1000);
        assert_eq!(bitmap.find_preceding_object(BASE + 999, BASE), Some(BASE + 64));
        assert_eq!(bitmap.find_preceding_object(BASE + 1000, BASE), Some(BASE + 1000));
        assert_eq!(bitmap.find_preceding_object(BASE + 4000, BASE + 2000), None);
        assert_eq!(bitmap.find_preceding_object(BASE + 56, BASE), None);
    }

    #[test]
    fn test_clear_range_and_count() {
        let bitmap = SpaceBitmap::new("t", BASE, 8192);
        for off in (0..8192).step_by(8) {
            bitmap.set(BASE + off);
        }
        bitmap.clear_range(BASE + 40, BASE + 4000);
        assert_eq!(bitmap.count(), 1024 - (4000 - 40) / 8);
        assert!(bitmap.test(BASE + 32));
        assert!(!bitmap.test(BASE + 40));
        assert!(bitmap.test(BASE + 4000));
    }
}
