//! Live-words bitmap.
//!
//! One bit per 8-byte word of the moving space. A set bit means the word
//! belongs to an object found live by marking. Each 64-bit bitmap word
//! covers exactly one [`CHUNK_SIZE`] chunk, so a chunk's live bytes are one
//! popcount away and the chunk table can be cross-checked cheaply.

use crate::object::OBJECT_ALIGNMENT;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Bytes covered by one bitmap word.
pub const CHUNK_SIZE: usize = BITS_PER_WORD * OBJECT_ALIGNMENT;

/// Word-granular liveness map of the moving space.
#[derive(Debug, Clone)]
pub struct LiveWordsBitmap {
    begin: usize,
    words: Vec<u64>,
}

impl LiveWordsBitmap {
    /// Creates a cleared bitmap for `[begin, begin + capacity)`.
    #[must_use]
    pub fn new(begin: usize, capacity: usize) -> Self {
        Self {
            begin,
            words: vec![0; capacity.div_ceil(CHUNK_SIZE)],
        }
    }

    /// First covered address.
    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    /// Number of chunks covered.
    #[must_use]
    pub fn chunks(&self) -> usize {
        self.words.len()
    }

    /// Marks every word of the object `[addr, addr + size)` live. Returns
    /// the bit index of `addr`.
    pub fn set_live_words(&mut self, addr: usize, size: usize) -> usize {
        let first = (addr - self.begin) / OBJECT_ALIGNMENT;
        let end = first + size / OBJECT_ALIGNMENT;
        let mut bit = first;
        while bit < end {
            let idx = bit / BITS_PER_WORD;
            let shift = bit % BITS_PER_WORD;
            let n = (BITS_PER_WORD - shift).min(end - bit);
            let mask = if n == BITS_PER_WORD {
                u64::MAX
            } else {
                ((1u64 << n) - 1) << shift
            };
            self.words[idx] |= mask;
            bit += n;
        }
        first
    }

    /// `true` if the word at `addr` is live.
    #[must_use]
    pub fn test(&self, addr: usize) -> bool {
        let bit = (addr - self.begin) / OBJECT_ALIGNMENT;
        self.words[bit / BITS_PER_WORD] & (1 << (bit % BITS_PER_WORD)) != 0
    }

    /// Live bytes recorded in chunk `chunk_idx`.
    #[must_use]
    pub fn live_bytes_in_chunk(&self, chunk_idx: usize) -> usize {
        self.words[chunk_idx].count_ones() as usize * OBJECT_ALIGNMENT
    }

    /// Live words of `chunk_idx` strictly before bit `bit_in_chunk`.
    #[must_use]
    pub fn count_live_words_upto(&self, chunk_idx: usize, bit_in_chunk: usize) -> usize {
        let word = self.words[chunk_idx];
        let mask = (1u64 << bit_in_chunk) - 1;
        (word & mask).count_ones() as usize
    }

    /// Bit position inside chunk `chunk_idx` of its `n`th live word
    /// (zero based).
    ///
    /// # Panics
    ///
    /// Panics if the chunk has `n` or fewer live words.
    #[must_use]
    pub fn find_nth_live_word_offset(&self, chunk_idx: usize, n: usize) -> usize {
        let mut word = self.words[chunk_idx];
        for _ in 0..n {
            word &= word - 1;
        }
        assert!(word != 0, "chunk {chunk_idx} has no live word #{n}");
        word.trailing_zeros() as usize
    }

    /// Calls `visitor(begin_bit, words, is_last)` for maximal runs of live
    /// words starting at bit `begin_bit`, until `bytes` worth of live words
    /// have been visited or `end` is reached. The last stride is cut short
    /// so the visited total never exceeds `bytes`.
    pub fn visit_live_strides(
        &self,
        begin_bit: usize,
        end: usize,
        bytes: usize,
        mut visitor: impl FnMut(usize, usize, bool),
    ) {
        let end_bit = ((end - self.begin) / OBJECT_ALIGNMENT).min(self.words.len() * BITS_PER_WORD);
        let mut remaining = bytes / OBJECT_ALIGNMENT;
        let mut bit = begin_bit;
        let mut pending: Option<(usize, usize)> = None;
        while remaining > 0 {
            let Some(start) = self.next_set(bit, end_bit) else {
                break;
            };
            let stop = self.next_clear(start, end_bit);
            let len = (stop - start).min(remaining);
            if let Some((s, l)) = pending.take() {
                visitor(s, l, false);
            }
            pending = Some((start, len));
            remaining -= len;
            bit = start + len;
        }
        if let Some((s, l)) = pending {
            visitor(s, l, true);
        }
    }

    fn next_set(&self, from: usize, end_bit: usize) -> Option<usize> {
        let mut bit = from;
        while bit < end_bit {
            let idx = bit / BITS_PER_WORD;
            let word = self.words[idx] & (u64::MAX << (bit % BITS_PER_WORD));
            if word != 0 {
                let found = idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                return (found < end_bit).then_some(found);
            }
            bit = (idx + 1) * BITS_PER_WORD;
        }
        None
    }

    fn next_clear(&self, from: usize, end_bit: usize) -> usize {
        let mut bit = from;
        while bit < end_bit {
            let idx = bit / BITS_PER_WORD;
            let word = !self.words[idx] & (u64::MAX << (bit % BITS_PER_WORD));
            if word != 0 {
                return (idx * BITS_PER_WORD + word.trailing_zeros() as usize).min(end_bit);
            }
            bit = (idx + 1) * BITS_PER_WORD;
        }
        end_bit
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x7000_0000;

    #[test]
    fn test_set_spanning_chunks() {
        let mut live = LiveWordsBitmap::new(BASE, 4 * CHUNK_SIZE);
        let bit = live.set_live_words(BASE + CHUNK_SIZE - 16, CHUNK_SIZE + 32);
        assert_eq!(bit, 62);
        assert_eq!(live.live_bytes_in_chunk(0), 16);
        assert_eq!(live.live_bytes_in_chunk(1), CHUNK_SIZE);
        assert_eq!(live.live_bytes_in_chunk(2), 16);
        assert!(live.test(BASE + 2 * CHUNK_SIZE + 8));
        assert!(!live.test(BASE + 2 * CHUNK_SIZE + 16));
    }

    #[test]
    fn test_nth_and_count() {
        let mut live = LiveWordsBitmap::new(BASE, CHUNK_SIZE);
        live.set_live_words(BASE + 8, 16);
        live.set_live_words(BASE + 64, 8);
        assert_eq!(live.find_nth_live_word_offset(0, 0), 1);
        assert_eq!(live.find_nth_live_word_offset(0, 2), 8);
        assert_eq!(live.count_live_words_upto(0, 8), 2);
        assert_eq!(live.count_live_words_upto(0, 9), 3);
    }

    #[test]
    fn test_strides_are_capped_by_bytes() {
        let mut live = LiveWordsBitmap::new(BASE, 4 * CHUNK_SIZE);
        live.set_live_words(BASE, 24);
        live.set_live_words(BASE + 64, 40);
        live.set_live_words(BASE + 3 * CHUNK_SIZE, 16);

        let mut strides = Vec::new();
        live.visit_live_strides(0, BASE + 4 * CHUNK_SIZE, 48, |b, w, last| strides.push((b, w, last)));
        assert_eq!(strides, vec![(0, 3, false), (8, 3, true)]);

        strides.clear();
        live.visit_live_strides(11, BASE + 4 * CHUNK_SIZE, 4096, |b, w, last| {
            strides.push((b, w, last));
        });
        assert_eq!(strides, vec![(11, 2, false), (192, 2, true)]);

        strides.clear();
        live.visit_live_strides(0, BASE + 64, 4096, |b, w, last| strides.push((b, w, last)));
        assert_eq!(strides, vec![(0, 3, true)]);
    }
}
