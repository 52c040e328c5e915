//! Relocation of a single destination page.
//!
//! Both functions read only the from-space snapshot and the plan, and write
//! only the destination buffer, so any thread may run them. The caller
//! guarantees each page is relocated at most once per cycle.
//!
//! Objects straddling a page boundary are visited twice, once per page, with
//! the slot visitor bounded to the page. Headers of objects that began on an
//! earlier page are always read from the from-space, because the earlier
//! destination page may not be finished yet.

use std::ptr;

use crate::accounting::SpaceBitmap;
use crate::object::{align_object, visit_refs_for_compaction, OBJECT_ALIGNMENT};

use super::planner::CompactionPlan;

/// Rewrites the reference slot at `slot`, which lives in a private
/// destination buffer.
#[inline]
unsafe fn update_slot(plan: &CompactionPlan, slot: usize) {
    // SAFETY: `slot` is an aligned word of the destination buffer.
    unsafe {
        let old = ptr::read(slot as *const usize);
        let new = plan.update_ref(old);
        if new != old {
            ptr::write(slot as *mut usize, new);
        }
    }
}

/// Fills the destination page `dest` with the live data that compacts onto
/// it: `first_obj` covers the page's first byte and `offset` is the index of
/// the page's first live word.
///
/// # Safety
///
/// `dest` must be a writable, 8-byte aligned buffer of one page, and the
/// plan's from-space must hold the pre-compaction heap.
pub(crate) unsafe fn compact_page(plan: &CompactionPlan, first_obj: usize, offset: usize, dest: usize) {
    let page_size = plan.page_size;
    let mut strides: Vec<(usize, usize)> = Vec::with_capacity(8);
    let mut copied = 0usize;
    plan.live_words
        .visit_live_strides(offset, plan.black_allocations_begin, page_size, |begin_bit, words, _| {
            let len = words * OBJECT_ALIGNMENT;
            let src = plan.from_space_begin + begin_bit * OBJECT_ALIGNMENT;
            // SAFETY: the stride is live from-space memory and fits the page.
            unsafe { ptr::copy_nonoverlapping(src as *const u8, (dest + copied) as *mut u8, len) };
            strides.push((copied, len));
            copied += len;
        });

    // The first object may have started on an earlier page.
    let offset_within_obj = offset * OBJECT_ALIGNMENT - (first_obj - plan.moving_begin);
    // SAFETY: the header of a live object in the from-space.
    let first_size = unsafe {
        visit_refs_for_compaction(
            plan.from_space_addr(first_obj),
            offset_within_obj,
            offset_within_obj + page_size,
            |off| update_slot(plan, dest + off - offset_within_obj),
        )
    };
    let first_portion = (align_object(first_size) - offset_within_obj).min(page_size);

    for (i, &(start, len)) in strides.iter().enumerate() {
        let mut pos = if i == 0 { start + first_portion } else { start };
        while pos < start + len {
            let obj = dest + pos;
            // SAFETY: every live stride starts with a whole object whose
            // header was copied into the buffer.
            let size = unsafe { visit_refs_for_compaction(obj, 0, page_size - pos, |off| update_slot(plan, obj + off)) };
            pos += align_object(size);
        }
    }

    if copied < page_size {
        // SAFETY: within the destination page.
        unsafe { ptr::write_bytes((dest + copied) as *mut u8, 0, page_size - copied) };
    }
}

/// Fills the destination page `dest` with black page `pre_compact_page`,
/// slid down by the constant slide distance.
///
/// `first_obj` is the object covering the page's first live byte and
/// `first_chunk_size` the length of the contiguous run starting there.
/// Objects after the run are found through `mark_bitmap`.
///
/// # Safety
///
/// Same as [`compact_page`].
pub(crate) unsafe fn slide_black_page(
    plan: &CompactionPlan,
    mark_bitmap: &SpaceBitmap,
    first_obj: usize,
    first_chunk_size: usize,
    pre_compact_page: usize,
    dest: usize,
) {
    let page_size = plan.page_size;
    let page_end = pre_compact_page + page_size;
    let dest_slot = |addr: usize| dest + (addr - pre_compact_page);

    let (pre_addr, dest_off) = if first_obj > pre_compact_page {
        // The page begins with the unused tail of a TLAB.
        let gap = first_obj - pre_compact_page;
        // SAFETY: within the destination page.
        unsafe { ptr::write_bytes(dest as *mut u8, 0, gap) };
        (first_obj, gap)
    } else {
        (pre_compact_page, 0)
    };

    // SAFETY: the first chunk is allocated from-space memory inside the page.
    unsafe {
        ptr::copy_nonoverlapping(
            plan.from_space_addr(pre_addr) as *const u8,
            (dest + dest_off) as *mut u8,
            first_chunk_size,
        );
    }
    let chunk_end = pre_addr + first_chunk_size;
    let mut obj = first_obj;
    while obj < chunk_end {
        let begin_off = pre_addr.saturating_sub(obj);
        let end_off = page_end - obj;
        // SAFETY: objects of the first chunk are contiguous; headers come
        // from the from-space because `first_obj` may start on an earlier
        // page.
        let size = unsafe {
            visit_refs_for_compaction(plan.from_space_addr(obj), begin_off, end_off, |off| {
                update_slot(plan, dest_slot(obj + off));
            })
        };
        obj += align_object(size);
    }

    let copied = dest_off + first_chunk_size;
    if copied >= page_size {
        return;
    }
    match mark_bitmap.find_first_marked(chunk_end, page_end) {
        None => {
            // SAFETY: within the destination page.
            unsafe { ptr::write_bytes((dest + copied) as *mut u8, 0, page_size - copied) };
        }
        Some(_) => {
            // Objects of a later TLAB start mid-page. Copying the whole rest
            // also carries the zero tail between TLABs.
            // SAFETY: the rest of the page lies inside the from-space.
            unsafe {
                ptr::copy_nonoverlapping(
                    plan.from_space_addr(chunk_end) as *const u8,
                    (dest + copied) as *mut u8,
                    page_size - copied,
                );
            }
            mark_bitmap.visit_marked_range(chunk_end, page_end, |obj| {
                // SAFETY: marked black objects are whole objects whose
                // header lies on this page.
                unsafe {
                    visit_refs_for_compaction(dest_slot(obj), 0, page_end - obj, |off| {
                        update_slot(plan, dest_slot(obj + off));
                    });
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::planner::tests::plan_for;
    use crate::object::{write_header, Header, ObjectKind};
    use crate::space::BumpPointerSpace;

    fn write_word(addr: usize, value: usize) {
        unsafe { ptr::write(addr as *mut usize, value) };
    }

    fn object(addr: usize, size: usize, num_refs: usize) {
        unsafe { write_header(addr, Header::new(size, num_refs, ObjectKind::Plain)) };
    }

    fn header_word(size: usize, num_refs: usize) -> u64 {
        Header::new(size, num_refs, ObjectKind::Plain).raw()
    }

    #[test]
    fn test_straddling_object_is_split_across_pages() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(3 * page).unwrap();
        let black = space.align_end(page);

        let dead = begin;
        let a = begin + 64;
        let b = begin + 128;
        let b_size = page + 16;
        let c = b + b_size;
        object(dead, 64, 0);
        object(a, 24, 1);
        write_word(a + 8, b);
        write_word(a + 16, 0xA);
        object(b, b_size, 1);
        write_word(b + 8, c);
        let b_words = (b_size - 16) / 8;
        for j in 0..b_words {
            write_word(b + 16 + 8 * j, j + 1);
        }
        object(c, 24, 0);
        write_word(c + 8, 0xC);
        write_word(c + 16, 0xCC);

        let plan = plan_for(&space, &[(a, 24), (b, b_size), (c, 24)], black);
        assert_eq!(plan.moving_first_objs_count, 2);
        assert_eq!(plan.first_objs[1], b);

        let mut pages = [vec![u64::MAX; page / 8], vec![u64::MAX; page / 8]];
        for (idx, buf) in pages.iter_mut().enumerate() {
            unsafe {
                compact_page(
                    &plan,
                    plan.first_objs[idx],
                    plan.pre_compact_offset[idx] as usize,
                    buf.as_mut_ptr() as usize,
                );
            }
        }
        let new_b = begin + 24;
        let new_c = new_b + b_size;

        let p0 = &pages[0];
        assert_eq!(p0[0], header_word(24, 1));
        assert_eq!(p0[1] as usize, new_b);
        assert_eq!(p0[2], 0xA);
        assert_eq!(p0[3], header_word(b_size, 1));
        assert_eq!(p0[4] as usize, new_c);
        for (w, &word) in p0.iter().enumerate().skip(5) {
            assert_eq!(word as usize, w - 4, "page 0 word {w}");
        }

        // B's last five payload words, then C, then zeros.
        let p1 = &pages[1];
        for (k, &word) in p1.iter().take(5).enumerate() {
            assert_eq!(word as usize, b_words - 4 + k);
        }
        assert_eq!(p1[5], header_word(24, 0));
        assert_eq!(p1[6], 0xC);
        assert_eq!(p1[7], 0xCC);
        assert!(p1[8..].iter().all(|&word| word == 0));
    }

    #[test]
    fn test_black_page_slides_and_zero_fills() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(2 * page).unwrap();
        let live = begin + page + 8;
        object(live, 32, 0);
        let black = space.align_end(page);

        let d = space.alloc_tlab(page / 2).unwrap();
        let e = d + 48;
        object(d, 48, 1);
        write_word(d + 8, e);
        write_word(d + 16, 7);
        object(e, 16, 0);
        write_word(e + 8, 8);

        let mut plan = plan_for(&space, &[(live, 32)], black);
        unsafe { plan.update_moving_space_black_allocations(&space) };
        assert_eq!(plan.used_pages(), 2);

        let mut buf = vec![u64::MAX; page / 8];
        unsafe {
            slide_black_page(
                &plan,
                space.mark_bitmap(),
                plan.first_objs[1],
                plan.black_first_chunk[1] as usize,
                black,
                buf.as_mut_ptr() as usize,
            );
        }
        assert_eq!(buf[0], header_word(48, 1));
        assert_eq!(buf[1] as usize, e - plan.black_objs_slide_diff());
        assert_eq!(buf[2], 7);
        assert_eq!(buf[6], header_word(16, 0));
        assert_eq!(buf[7], 8);
        assert!(buf[8..].iter().all(|&word| word == 0));
    }

    #[test]
    fn test_partly_used_tlabs_sharing_a_page_all_survive() {
        let page = sys_alloc::page_size();
        let space = BumpPointerSpace::new(16 * page).unwrap();
        let begin = space.alloc_tlab(2 * page).unwrap();
        let live = begin + page + 8;
        object(live, 32, 0);
        let black = space.align_end(page);

        // (block size, object sizes): every block leaves an unused tail.
        let layout: [(usize, &[usize]); 5] = [
            (1024, &[512]),
            (1024, &[512, 256]),
            (2048, &[1000]),
            (4096, &[4000]),
            (1024, &[16]),
        ];
        let mut objs = Vec::new();
        for (block_size, sizes) in layout {
            let mut addr = space.alloc_tlab(block_size).unwrap();
            for &size in sizes {
                objs.push((addr, size));
                addr += size;
            }
        }
        // Each object refers to the next one and carries its index.
        for (i, &(addr, size)) in objs.iter().enumerate() {
            object(addr, size, 1);
            write_word(addr + 8, objs.get(i + 1).map_or(0, |&(next, _)| next));
            if size >= 24 {
                write_word(addr + 16, 0x100 + i);
            }
        }

        let black_pages = (space.end() - black).div_ceil(page);
        let mut plan = plan_for(&space, &[(live, 32)], black);
        unsafe { plan.update_moving_space_black_allocations(&space) };
        assert_eq!(plan.used_pages(), 1 + black_pages);
        let diff = plan.black_objs_slide_diff();
        assert_eq!(diff, page);

        let mut buf = vec![u64::MAX; black_pages * page / 8];
        let buf_begin = buf.as_mut_ptr() as usize;
        for k in 0..black_pages {
            let idx = plan.moving_first_objs_count + k;
            unsafe {
                slide_black_page(
                    &plan,
                    space.mark_bitmap(),
                    plan.first_objs[idx],
                    plan.black_first_chunk[idx] as usize,
                    black + k * page,
                    buf_begin + k * page,
                );
            }
        }

        for (i, &(addr, size)) in objs.iter().enumerate() {
            let word = (addr - black) / 8;
            assert_eq!(buf[word], header_word(size, 1), "header of object {i}");
            let next = objs.get(i + 1).map_or(0, |&(next, _)| next - diff);
            assert_eq!(buf[word + 1] as usize, next, "reference of object {i}");
            if size >= 24 {
                assert_eq!(buf[word + 2] as usize, 0x100 + i, "payload of object {i}");
            }
        }
    }
}
