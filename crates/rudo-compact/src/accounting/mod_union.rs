//! Mod-union table for the immune space.
//!
//! The immune space is never marked or swept, but its objects may reference
//! collected spaces. Cards the mutator dirtied are moved into a persistent
//! set so references out of the immune space survive card clearing across
//! cycles.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use super::{CardTable, SpaceBitmap, CARD_DIRTY, CARD_SIZE};

/// Card-cache flavoured mod-union table.
#[derive(Debug)]
pub struct ModUnionTable {
    begin: usize,
    end: usize,
    cleared_cards: Mutex<BTreeSet<usize>>,
}

impl ModUnionTable {
    /// Creates an empty table for `[begin, end)`.
    #[must_use]
    pub fn new(begin: usize, end: usize) -> Self {
        Self {
            begin,
            end,
            cleared_cards: Mutex::new(BTreeSet::new()),
        }
    }

    /// Moves every dirty card of the space into the cache and cleans it.
    pub fn process_cards(&self, cards: &CardTable) {
        let dirty = cards.cards_at_least(self.begin, self.end, CARD_DIRTY);
        let mut cached = self.cleared_cards.lock();
        for idx in dirty {
            cards.clear_card(idx);
            cached.insert(cards.addr_from_card(idx));
        }
    }

    /// Calls `visitor` on every live object that starts on a cached card.
    /// The visitor returns whether the object still references memory
    /// outside the immune space; cards where no object does are dropped.
    pub fn update_and_mark_references(
        &self,
        live: &SpaceBitmap,
        mut visitor: impl FnMut(usize) -> bool,
    ) {
        let mut cached = self.cleared_cards.lock();
        cached.retain(|&card| {
            let mut keep = false;
            live.visit_marked_range(card, (card + CARD_SIZE).min(self.end), |obj| {
                keep |= visitor(obj);
            });
            keep
        });
    }

    /// Calls `visitor` on every live object that starts on a cached card,
    /// without pruning.
    pub fn visit_objects(&self, live: &SpaceBitmap, mut visitor: impl FnMut(usize)) {
        let cached = self.cleared_cards.lock();
        for &card in cached.iter() {
            live.visit_marked_range(card, (card + CARD_SIZE).min(self.end), &mut visitor);
        }
    }

    /// Number of cached cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cleared_cards.lock().len()
    }

    /// `true` when no card is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cleared_cards.lock().is_empty()
    }
}
