//! Compaction tables.
//!
//! Everything a page needs to be relocated on its own is computed here,
//! before any page is touched:
//!
//! - for every destination page below `post_compact_end`, the object that
//!   covers its first byte and the live-word offset the page starts at;
//! - for every page of black allocations, its first object and the size of
//!   its first contiguous run of objects;
//! - the chunk table turned into destination offsets by an exclusive prefix
//!   sum, which maps any live pre-compaction address to its new address;
//! - for the non-moving space, the object covering each page's first byte.

use crate::accounting::SpaceBitmap;
use crate::error::fatal::{self, CorruptionReport};
use crate::object::{align_object, read_header, OBJECT_ALIGNMENT};
use crate::space::{align_down, align_up, BumpPointerSpace, NonMovingSpace};

use super::live_words::{LiveWordsBitmap, CHUNK_SIZE};

const WORDS_PER_CHUNK: usize = CHUNK_SIZE / OBJECT_ALIGNMENT;

/// Per-cycle relocation tables for the moving and non-moving spaces.
#[derive(Debug)]
pub struct CompactionPlan {
    pub(crate) moving_begin: usize,
    pub(crate) moving_limit: usize,
    pub(crate) page_size: usize,
    /// Where the pre-compaction contents of the moving space live once the
    /// pause has remapped them.
    pub(crate) from_space_begin: usize,
    pub(crate) live_words: LiveWordsBitmap,
    pub(crate) chunk_info: Vec<u32>,
    /// Object covering the first byte of each destination page, or 0.
    pub(crate) first_objs: Vec<usize>,
    /// Live-word index each compacted page starts at.
    pub(crate) pre_compact_offset: Vec<u32>,
    /// Bytes of the first contiguous object run of each black page.
    pub(crate) black_first_chunk: Vec<u32>,
    pub(crate) moving_first_objs_count: usize,
    pub(crate) black_page_count: usize,
    pub(crate) black_allocations_begin: usize,
    pub(crate) black_objs_slide_diff: usize,
    /// Live bytes below the black boundary.
    pub(crate) live_bytes: usize,
    pub(crate) post_compact_end: usize,
    pub(crate) non_moving_begin: usize,
    pub(crate) non_moving_first_objs: Vec<usize>,
    pub(crate) non_moving_first_objs_count: usize,
}

impl CompactionPlan {
    /// Builds the moving-space tables.
    ///
    /// `chunk_info` holds the live bytes of every chunk as recorded while
    /// marking, plus one trailing zero entry.
    pub(crate) fn new(
        moving: &BumpPointerSpace,
        page_size: usize,
        live_words: LiveWordsBitmap,
        chunk_info: Vec<u32>,
        black_allocations_begin: usize,
    ) -> Self {
        let moving_begin = moving.begin();
        let pages = moving.capacity() / page_size;
        let mut plan = Self {
            moving_begin,
            moving_limit: moving.limit(),
            page_size,
            from_space_begin: moving_begin,
            live_words,
            chunk_info,
            first_objs: vec![0; pages + 1],
            pre_compact_offset: vec![0; pages + 1],
            black_first_chunk: vec![0; pages + 1],
            moving_first_objs_count: 0,
            black_page_count: 0,
            black_allocations_begin,
            black_objs_slide_diff: 0,
            live_bytes: 0,
            post_compact_end: moving_begin,
            non_moving_begin: 0,
            non_moving_first_objs: Vec::new(),
            non_moving_first_objs_count: 0,
        };

        let vector_len = (black_allocations_begin - moving_begin) / CHUNK_SIZE;
        #[cfg(debug_assertions)]
        plan.verify_chunk_info(vector_len);

        plan.init_moving_space_first_objects(moving.mark_bitmap(), vector_len);

        let mut total = 0u32;
        for entry in &mut plan.chunk_info[..=vector_len] {
            let live = *entry;
            *entry = total;
            total += live;
        }
        let total = total as usize;
        plan.live_bytes = total;
        plan.post_compact_end = moving_begin + align_up(total, page_size);
        debug_assert_eq!(
            plan.post_compact_end,
            moving_begin + plan.moving_first_objs_count * page_size,
            "first-object count disagrees with the compacted size"
        );
        plan.black_objs_slide_diff = black_allocations_begin - plan.post_compact_end;
        plan
    }

    #[cfg(debug_assertions)]
    fn verify_chunk_info(&self, vector_len: usize) {
        for chunk in 0..vector_len {
            debug_assert_eq!(
                self.chunk_info[chunk] as usize,
                self.live_words.live_bytes_in_chunk(chunk),
                "chunk {chunk} live bytes disagree with the live-words bitmap"
            );
        }
        debug_assert!(
            self.chunk_info[vector_len..].iter().all(|&live| live == 0),
            "live bytes recorded past the black-allocation boundary"
        );
    }

    fn init_moving_space_first_objects(&mut self, mark_bitmap: &SpaceBitmap, vector_len: usize) {
        let Some(mut chunk_idx) = (0..vector_len).find(|&i| self.chunk_info[i] != 0) else {
            return;
        };
        let page_size = self.page_size;
        let offset = chunk_idx * WORDS_PER_CHUNK + self.live_words.find_nth_live_word_offset(chunk_idx, 0);
        self.first_objs[0] = self.moving_begin + offset * OBJECT_ALIGNMENT;
        self.pre_compact_offset[0] = offset as u32;
        let mut page_idx = 1;
        let mut page_live_bytes = 0usize;
        loop {
            while page_live_bytes <= page_size {
                if chunk_idx >= vector_len {
                    self.moving_first_objs_count = page_idx;
                    return;
                }
                page_live_bytes += self.chunk_info[chunk_idx] as usize;
                chunk_idx += 1;
            }
            // The page boundary falls inside the chunk just added.
            chunk_idx -= 1;
            page_live_bytes -= page_size;
            let nth = (self.chunk_info[chunk_idx] as usize - page_live_bytes) / OBJECT_ALIGNMENT;
            let offset = chunk_idx * WORDS_PER_CHUNK + self.live_words.find_nth_live_word_offset(chunk_idx, nth);
            let addr = self.moving_begin + offset * OBJECT_ALIGNMENT;
            let Some(obj) = mark_bitmap.find_preceding_object(addr, self.moving_begin) else {
                fatal::heap_corruption(&CorruptionReport::new("live word without a marked object", addr));
            };
            self.first_objs[page_idx] = obj;
            self.pre_compact_offset[page_idx] = offset as u32;
            page_idx += 1;
            chunk_idx += 1;
        }
    }

    /// Builds the non-moving first-object table from its live bitmap, which
    /// after the sweep holds exactly the marked objects.
    ///
    /// # Safety
    ///
    /// Every bit of the live bitmap must denote a readable object.
    pub(crate) unsafe fn init_non_moving_space_first_objects(&mut self, space: &NonMovingSpace) {
        let page_size = self.page_size;
        let begin = space.begin();
        let end = space.end();
        self.non_moving_begin = begin;
        self.non_moving_first_objs = vec![0; (space.limit() - begin) / page_size + 1];
        self.non_moving_first_objs_count = 0;
        let live = space.live_bitmap();
        // SAFETY: the caller guarantees live objects are readable.
        let obj_end = |obj: usize| obj + align_object(unsafe { read_header(obj) }.size());

        let Some(mut prev_obj) = live.find_first_marked(begin, end) else {
            return;
        };
        let mut page_idx = (prev_obj - begin) / page_size;
        let mut prev_obj_end = obj_end(prev_obj);
        self.non_moving_first_objs[page_idx] = prev_obj;
        page_idx += 1;
        let mut page_begin = align_down(prev_obj + page_size, page_size);
        while page_begin < end {
            if prev_obj_end > page_begin {
                // An object from an earlier page overlaps this one.
                self.non_moving_first_objs[page_idx] = prev_obj;
            } else {
                // Only the preceding page can hold an overlapping start: an
                // older one would have been caught above.
                prev_obj_end = 0;
                if let Some(obj) = live.find_preceding_object(page_begin, page_begin - page_size) {
                    prev_obj = obj;
                    prev_obj_end = obj_end(obj);
                }
                self.non_moving_first_objs[page_idx] = if prev_obj_end > page_begin {
                    prev_obj
                } else {
                    live.find_first_marked(page_begin, page_begin + page_size).unwrap_or(0)
                };
            }
            page_begin += page_size;
            page_idx += 1;
        }
        self.non_moving_first_objs_count = page_idx;
    }

    /// Folds the TLAB blocks allocated black since the marking pause into
    /// the plan, so each black page knows its first object and the size of
    /// its first contiguous run. Objects of blocks starting mid-page are
    /// recorded in the moving mark bitmap. The block list is rewritten so
    /// the compacted region becomes the new main block.
    ///
    /// # Safety
    ///
    /// Mutators must be suspended and the moving space not yet remapped.
    pub(crate) unsafe fn update_moving_space_black_allocations(&mut self, moving: &BumpPointerSpace) {
        let page_size = self.page_size;
        let begin = moving.begin();
        let (main_block_size, blocks) = moving.block_sizes();
        let mut consumed = 0;
        debug_assert!(main_block_size <= self.black_allocations_begin - begin);

        if let Some(blocks) = blocks {
            let mark_bitmap = moving.mark_bitmap();
            let mut black_page_idx = self.moving_first_objs_count;
            let mut black_allocs = self.black_allocations_begin;
            let mut block_end = begin + main_block_size;
            // Bytes of the current black page accounted for so far.
            let mut page_used = 0usize;
            let mut first_chunk_size = 0usize;
            let mut first_obj = 0usize;
            for block_size in blocks {
                block_end += block_size;
                if black_allocs >= block_end {
                    consumed += 1;
                    continue;
                }
                let mut obj = black_allocs;
                let mut set_mark_bit = page_used > 0;
                if first_obj == 0 {
                    first_obj = obj;
                }
                while black_allocs < block_end {
                    // SAFETY: inside an allocated block; mutators are
                    // suspended.
                    let header = unsafe { read_header(obj) };
                    if header.is_null() {
                        break;
                    }
                    if set_mark_bit {
                        mark_bitmap.set(obj);
                    }
                    let obj_size = align_object(header.size());
                    if page_used + obj_size >= page_size {
                        set_mark_bit = false;
                        first_chunk_size += page_size - page_used;
                        page_used += obj_size;
                        // A page whose values were stored before an unused
                        // TLAB tail keeps them.
                        if self.black_first_chunk[black_page_idx] == 0 {
                            self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                            self.first_objs[black_page_idx] = first_obj;
                        }
                        black_page_idx += 1;
                        page_used -= page_size;
                        while page_used >= page_size {
                            self.black_first_chunk[black_page_idx] = page_size as u32;
                            self.first_objs[black_page_idx] = obj;
                            black_page_idx += 1;
                            page_used -= page_size;
                        }
                        first_obj = if page_used > 0 { obj } else { obj + obj_size };
                        first_chunk_size = page_used;
                    } else {
                        first_chunk_size += obj_size;
                        page_used += obj_size;
                    }
                    black_allocs += obj_size;
                    obj = black_allocs;
                }
                if black_allocs < block_end {
                    // Unused TLAB tail. Only the page's first TLAB defines
                    // its first run; later ones are found via mark bits.
                    if first_chunk_size > 0 && self.black_first_chunk[black_page_idx] == 0 {
                        self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                        self.first_objs[black_page_idx] = first_obj;
                    }
                    first_chunk_size = 0;
                    first_obj = 0;
                    let page_remaining = page_size - page_used;
                    let mut block_remaining = block_end - black_allocs;
                    if page_remaining <= block_remaining {
                        block_remaining -= page_remaining;
                        black_page_idx += 1 + block_remaining / page_size;
                        page_used = block_remaining % page_size;
                    } else {
                        page_used += block_remaining;
                    }
                    black_allocs = block_end;
                }
            }
            if page_used > 0 {
                // The last black page is only partly used.
                if first_chunk_size > 0 && self.black_first_chunk[black_page_idx] == 0 {
                    self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                    self.first_objs[black_page_idx] = first_obj;
                }
                black_page_idx += 1;
            }
            self.black_page_count = black_page_idx - self.moving_first_objs_count;
        }
        moving.set_block_sizes(self.post_compact_end - begin, consumed);
    }

    /// Publishes objects allocated in the non-moving space since the
    /// marking pause and patches the first-object table for them.
    ///
    /// # Safety
    ///
    /// Mutators must be suspended.
    pub(crate) unsafe fn update_non_moving_space_black_allocations(&mut self, space: &NonMovingSpace) {
        let page_size = self.page_size;
        let begin = self.non_moving_begin;
        let live = space.live_bitmap();
        for obj in space.drain_alloc_stack() {
            live.set(obj);
            let mut idx = (obj - begin) / page_size;
            let page_begin = align_down(obj, page_size);
            let first = self.non_moving_first_objs[idx];
            if first == 0 || (obj < first && first > page_begin) {
                self.non_moving_first_objs[idx] = obj;
            }
            idx += 1;
            let next_first = self.non_moving_first_objs[idx];
            let mut next_page_begin = page_begin + page_size;
            if next_first == 0 || next_first > next_page_begin {
                // SAFETY: allocated objects are initialised before the
                // allocating mutator reaches a safepoint.
                let obj_end = obj + align_object(unsafe { read_header(obj) }.size());
                while next_page_begin < obj_end {
                    self.non_moving_first_objs[idx] = obj;
                    idx += 1;
                    next_page_begin += page_size;
                }
            }
            self.non_moving_first_objs_count = self.non_moving_first_objs_count.max(idx);
        }
    }

    /// New address of a live moving-space object below the black boundary.
    #[must_use]
    pub fn post_compact_address(&self, old: usize) -> usize {
        if old >= self.black_allocations_begin {
            return old - self.black_objs_slide_diff;
        }
        let word = (old - self.moving_begin) / OBJECT_ALIGNMENT;
        let chunk = word / WORDS_PER_CHUNK;
        debug_assert!(self.live_words.test(old), "{old:#x} was not marked live");
        self.moving_begin
            + self.chunk_info[chunk] as usize
            + self.live_words.count_live_words_upto(chunk, word % WORDS_PER_CHUNK) * OBJECT_ALIGNMENT
    }

    /// New value of a reference slot: moving-space referents are
    /// relocated, everything else is kept.
    #[inline]
    #[must_use]
    pub fn update_ref(&self, value: usize) -> usize {
        if value.wrapping_sub(self.moving_begin) < self.moving_limit - self.moving_begin {
            self.post_compact_address(value)
        } else {
            value
        }
    }

    /// Bytes of marked objects below the black boundary.
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// First address past the compacted data.
    #[must_use]
    pub const fn post_compact_end(&self) -> usize {
        self.post_compact_end
    }

    /// Constant distance black objects slide down by.
    #[must_use]
    pub const fn black_objs_slide_diff(&self) -> usize {
        self.black_objs_slide_diff
    }

    /// Pages that receive data: compacted pages followed by black pages.
    #[must_use]
    pub const fn used_pages(&self) -> usize {
        self.moving_first_objs_count + self.black_page_count
    }

    /// Pre-compaction address of `addr` inside the from-space snapshot.
    #[inline]
    pub(crate) const fn from_space_addr(&self, addr: usize) -> usize {
        self.from_space_begin + (addr - self.moving_begin)
    }

    /// `true` if the moving object at `old` survives this cycle.
    #[must_use]
    pub fn is_live(&self, old: usize) -> bool {
        old >= self.black_allocations_begin || self.live_words.test(old)
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::object::{write_header, Header, ObjectKind};

    /// Marks `objs` (address, size) live and builds the plan with the black
    /// boundary at `black`.
    pub(crate) fn plan_for(
        space: &BumpPointerSpace,
        objs: &[(usize, usize)],
        black: usize,
    ) -> CompactionPlan {
        let mut live = LiveWordsBitmap::new(space.begin(), space.capacity());
        for &(obj, size) in objs {
            space.mark_bitmap().set(obj);
            live.set_live_words(obj, size);
        }
        let mut chunk_info = vec![0; live.chunks() + 1];
        for (chunk, entry) in chunk_info.iter_mut().take(live.chunks()).enumerate() {
            *entry = live.live_bytes_in_chunk(chunk) as u32;
        }
        CompactionPlan::new(space, sys_alloc::page_size(), live, chunk_info, black)
    }

    #[test]
    fn test_dead_gap_is_squeezed_out() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(2 * page).unwrap();
        let a = begin;
        let dead = begin + 64;
        let c = begin + page + 32;
        let plan = plan_for(&space, &[(a, 64), (c, 32)], begin + 2 * page);

        assert_eq!(plan.live_bytes(), 96);
        assert_eq!(plan.post_compact_end(), begin + page);
        assert_eq!(plan.used_pages(), 1);
        assert_eq!(plan.first_objs[0], a);
        assert_eq!(plan.post_compact_address(a), a);
        assert_eq!(plan.post_compact_address(c), begin + 64);
        assert_eq!(plan.black_objs_slide_diff(), page);
        assert!(!plan.is_live(dead));
        assert!(plan.is_live(begin + 2 * page + 8));
        assert_eq!(plan.update_ref(0), 0);
        assert_eq!(plan.update_ref(begin + 16 * page), begin + 16 * page);
    }

    #[test]
    fn test_first_object_straddles_page_boundary() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(2 * page).unwrap();
        let x = begin;
        let z = begin + page + 32;
        let plan = plan_for(&space, &[(x, page - 32), (z, 128)], begin + 2 * page);

        assert_eq!(plan.post_compact_end(), begin + 2 * page);
        assert_eq!(plan.moving_first_objs_count, 2);
        // Destination page 1 begins 32 bytes into `z`.
        assert_eq!(plan.first_objs[1], z);
        assert_eq!(plan.pre_compact_offset[1] as usize, (z + 32 - begin) / OBJECT_ALIGNMENT);
        assert_eq!(plan.post_compact_address(z), begin + page - 32);
    }

    #[test]
    fn test_black_block_after_boundary() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(2 * page).unwrap();
        let live = begin + page + 8;
        let black = space.align_end(page);
        assert_eq!(black, begin + 2 * page);

        let block = space.alloc_tlab(page / 2).unwrap();
        let d = block;
        let e = block + 48;
        unsafe {
            write_header(d, Header::new(48, 1, ObjectKind::Plain));
            write_header(e, Header::new(16, 0, ObjectKind::Plain));
        }

        let mut plan = plan_for(&space, &[(live, 32)], black);
        unsafe { plan.update_moving_space_black_allocations(&space) };

        assert_eq!(plan.used_pages(), 2);
        assert_eq!(plan.first_objs[1], d);
        assert_eq!(plan.black_first_chunk[1], 64);
        assert_eq!(plan.update_ref(e), e - page);
        assert!(!space.mark_bitmap().test(d));
        // The compacted page became the main block; the black block follows.
        assert_eq!(space.block_sizes(), (page, Some(vec![page / 2])));
        assert_eq!(space.end(), begin + page + page / 2);
    }
}
