//! Byte-per-card dirty tracking for the write barrier.

use std::sync::atomic::{AtomicU8, Ordering};

use super::SpaceBitmap;

/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1024;
const CARD_SHIFT: u32 = CARD_SIZE.trailing_zeros();

/// Card never written since the last scan.
pub const CARD_CLEAN: u8 = 0;
/// Card written by the mutator.
pub const CARD_DIRTY: u8 = 0x70;
/// Card that was dirty at the previous concurrent scan.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// Ages a card for a concurrent pre-cleaning pass: dirty becomes aged,
/// anything else becomes clean.
#[must_use]
pub const fn age_card(card: u8) -> u8 {
    if card == CARD_DIRTY {
        CARD_AGED
    } else {
        CARD_CLEAN
    }
}

/// A card table covering one space.
#[derive(Debug)]
pub struct CardTable {
    begin: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Creates a clean table covering `[begin, begin + capacity)`.
    #[must_use]
    pub fn new(begin: usize, capacity: usize) -> Self {
        let cards = (0..capacity.div_ceil(CARD_SIZE))
            .map(|_| AtomicU8::new(CARD_CLEAN))
            .collect();
        Self { begin, cards }
    }

    /// `true` if `addr` is covered.
    #[must_use]
    pub const fn covers(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.begin) < self.cards.len() * CARD_SIZE
    }

    #[inline]
    fn index(&self, addr: usize) -> usize {
        (addr - self.begin) >> CARD_SHIFT
    }

    /// First address covered by card `idx`.
    #[must_use]
    pub const fn addr_from_card(&self, idx: usize) -> usize {
        self.begin + (idx << CARD_SHIFT)
    }

    /// Write barrier: dirties the card holding `addr`.
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        let card = &self.cards[self.index(addr)];
        if card.load(Ordering::Relaxed) != CARD_DIRTY {
            card.store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Current value of the card holding `addr`.
    #[must_use]
    pub fn get(&self, addr: usize) -> u8 {
        self.cards[self.index(addr)].load(Ordering::Relaxed)
    }

    /// Resets every card to clean.
    pub fn clear_all(&self) {
        for card in &*self.cards {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Visits every object recorded in `bitmap` that starts on a card in
    /// `[begin, end)` whose value is at least `min_age`. With `clear`, the
    /// visited cards are reset to clean first. Returns the number of cards
    /// visited.
    pub fn scan(
        &self,
        bitmap: &SpaceBitmap,
        begin: usize,
        end: usize,
        min_age: u8,
        clear: bool,
        mut visitor: impl FnMut(usize),
    ) -> usize {
        let mut visited = 0;
        let end = end.min(self.addr_from_card(self.cards.len()));
        if begin >= end {
            return 0;
        }
        for idx in self.index(begin)..=self.index(end - 1) {
            let card = &self.cards[idx];
            if card.load(Ordering::Relaxed) < min_age {
                continue;
            }
            if clear {
                card.store(CARD_CLEAN, Ordering::Relaxed);
            }
            let start = self.addr_from_card(idx);
            bitmap.visit_marked_range(start, (start + CARD_SIZE).min(end), &mut visitor);
            visited += 1;
        }
        visited
    }

    /// Atomically replaces each card in `[begin, end)` with `age(card)` and
    /// calls `modified(card_index, old, new)` for every card that changed.
    pub fn modify_cards_atomic(
        &self,
        begin: usize,
        end: usize,
        age: impl Fn(u8) -> u8,
        mut modified: impl FnMut(usize, u8, u8),
    ) {
        let end = end.min(self.addr_from_card(self.cards.len()));
        if begin >= end {
            return;
        }
        for idx in self.index(begin)..=self.index(end - 1) {
            let card = &self.cards[idx];
            let mut old = card.load(Ordering::Relaxed);
            loop {
                let new = age(old);
                if new == old {
                    break;
                }
                match card.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        modified(idx, old, new);
                        break;
                    }
                    Err(actual) => old = actual,
                }
            }
        }
    }

    /// Cards of `[begin, end)` whose value is at least `min_age`.
    #[must_use]
    pub fn cards_at_least(&self, begin: usize, end: usize, min_age: u8) -> Vec<usize> {
        let end = end.min(self.addr_from_card(self.cards.len()));
        if begin >= end {
            return Vec::new();
        }
        (self.index(begin)..=self.index(end - 1))
            .filter(|&idx| self.cards[idx].load(Ordering::Relaxed) >= min_age)
            .collect()
    }

    /// Resets a single card to clean.
    pub fn clear_card(&self, idx: usize) {
        self.cards[idx].store(CARD_CLEAN, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x1000_0000;

    #[test]
    fn test_mark_and_scan_clears() {
        let table = CardTable::new(BASE, 8 * CARD_SIZE);
        let bitmap = SpaceBitmap::new("t", BASE, 8 * CARD_SIZE);
        bitmap.set(BASE + CARD_SIZE + 16);
        bitmap.set(BASE + 3 * CARD_SIZE);
        table.mark_card(BASE + CARD_SIZE + 100);

        let mut seen = Vec::new();
        let n = table.scan(&bitmap, BASE, BASE + 8 * CARD_SIZE, CARD_DIRTY, true, |a| {
            seen.push(a);
        });
        assert_eq!(n, 1);
        assert_eq!(seen, vec![BASE + CARD_SIZE + 16]);
        assert_eq!(table.get(BASE + CARD_SIZE), CARD_CLEAN);
    }

    #[test]
    fn test_aging_reports_dirty_transitions() {
        let table = CardTable::new(BASE, 4 * CARD_SIZE);
        table.mark_card(BASE);
        table.mark_card(BASE + 2 * CARD_SIZE);

        let mut changed = Vec::new();
        table.modify_cards_atomic(BASE, BASE + 4 * CARD_SIZE, age_card, |idx, old, new| {
            changed.push((idx, old, new));
        });
        assert_eq!(changed, vec![(0, CARD_DIRTY, CARD_AGED), (2, CARD_DIRTY, CARD_AGED)]);
        assert_eq!(table.cards_at_least(BASE, BASE + 4 * CARD_SIZE, CARD_AGED), vec![0, 2]);

        changed.clear();
        table.modify_cards_atomic(BASE, BASE + 4 * CARD_SIZE, age_card, |idx, old, new| {
            changed.push((idx, old, new));
        });
        assert_eq!(changed, vec![(0, CARD_AGED, CARD_CLEAN), (2, CARD_AGED, CARD_CLEAN)]);
    }
}
