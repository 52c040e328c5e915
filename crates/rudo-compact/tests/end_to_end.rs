//! Full collection cycles observed through the public heap API.
//!
//! Every scenario runs in each compaction mode: concurrent copy, concurrent
//! minor (shadow buffer) and compaction inside the pause.

#![cfg(feature = "test-util")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use rudo_compact::test_util::{build_random_graph, heap_image, heap_in_mode, mutator_roots, small_config};
use rudo_compact::{CompactionMode, Heap, ObjRef};

const MODES: [CompactionMode; 3] = [CompactionMode::Copy, CompactionMode::Minor, CompactionMode::Fallback];

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[test]
fn test_chain_across_page_boundary() {
    for mode in MODES {
        let heap = Heap::new(small_config().tlab_size(64 << 10).mode(mode)).unwrap();
        let page = heap.page_size();
        let begin = heap.moving_space().begin();
        let mutator = heap.attach_mutator();

        let _g1 = mutator.alloc(0, 63).unwrap();
        let a = mutator.alloc(1, 1).unwrap();
        let _g2 = mutator.alloc(0, 127).unwrap();
        // One reference plus a page of payload: after compaction B starts
        // 24 bytes into page 0 and ends 40 bytes into page 1.
        let b_words = page / 8;
        let b = mutator.alloc(1, b_words).unwrap();
        let g3 = mutator.alloc(2, 10).unwrap();
        let c = mutator.alloc(0, 2).unwrap();
        unsafe {
            mutator.write_word(a, 0, 0xA);
            mutator.write_ref(a, 0, Some(b));
            for i in 0..b_words {
                mutator.write_word(b, i, i * 3 + 1);
            }
            mutator.write_ref(b, 0, Some(c));
            mutator.write_ref(g3, 0, Some(a));
            mutator.write_word(c, 0, 0xC);
            mutator.write_word(c, 1, 0xCC);
        }
        let slot = mutator.push_root(Some(a));

        let stats = heap.collect().unwrap();
        assert_eq!(stats.mode, Some(mode));

        let a_size = 24;
        let b_size = 16 + page;
        let c_size = 24;
        assert_eq!(stats.live_bytes, a_size + b_size + c_size);
        assert_eq!(stats.pages_compacted + stats.zero_pages, 2);
        assert_eq!(heap.moving_space().end(), begin + 2 * page);

        let a = mutator.root(slot).unwrap();
        assert_eq!(a.addr(), begin);
        unsafe {
            assert_eq!(mutator.read_word(a, 0), 0xA);
            let b = mutator.read_ref(a, 0).unwrap();
            assert_eq!(b.addr(), begin + a_size);
            assert_eq!(b.size(), b_size);
            for i in 0..b_words {
                assert_eq!(mutator.read_word(b, i), i * 3 + 1, "B word {i} in {mode:?}");
            }
            let c = mutator.read_ref(b, 0).unwrap();
            assert_eq!(c.addr(), begin + a_size + b_size);
            assert_eq!(mutator.read_word(c, 0), 0xC);
            assert_eq!(mutator.read_word(c, 1), 0xCC);

            // Nothing of the dead objects survives past the last live byte.
            let mut addr = c.addr() + c_size;
            while addr < begin + 2 * page {
                assert_eq!(std::ptr::read_volatile(addr as *const u64), 0, "stale word at {addr:#x}");
                addr += 8;
            }
        }
    }
}

#[test]
fn test_unreachable_objects_are_squeezed_out() {
    for mode in MODES {
        let heap = heap_in_mode(mode);
        let mutator = heap.attach_mutator();
        build_random_graph(&mutator, 7, 4000, 5);
        let roots = mutator_roots(&mutator);
        let before = heap_image(&mutator, &roots);

        let stats = heap.collect().unwrap();
        assert!(stats.live_bytes < stats.moving_bytes_before);
        assert_eq!(
            heap.moving_space().size(),
            align_up(stats.live_bytes, heap.page_size()),
            "{mode:?}"
        );
        assert_eq!(stats.objects_marked, before.len());

        let after = heap_image(&mutator, &mutator_roots(&mutator));
        assert_eq!(before, after, "{mode:?}");
    }
}

#[test]
fn test_repeated_cycles_keep_the_graph() {
    let heap = heap_in_mode(CompactionMode::Copy);
    let mutator = heap.attach_mutator();
    build_random_graph(&mutator, 11, 1500, 3);
    let expected = heap_image(&mutator, &mutator_roots(&mutator));

    let first = heap.collect().unwrap();
    let second = heap.collect().unwrap();
    assert_eq!(second.cycle, first.cycle + 1);
    assert_eq!(second.live_bytes, first.live_bytes);
    assert_eq!(heap.last_stats(), Some(second));
    assert_eq!(heap_image(&mutator, &mutator_roots(&mutator)), expected);
}

#[test]
fn test_weak_roots_follow_or_clear() {
    for mode in MODES {
        let heap = heap_in_mode(mode);
        let mutator = heap.attach_mutator();
        let _garbage = mutator.alloc(0, 32).unwrap();
        let live = mutator.alloc(0, 1).unwrap();
        let dead = mutator.alloc(0, 1).unwrap();
        unsafe { mutator.write_word(live, 0, 99) };
        let slot = mutator.push_root(Some(live));
        let live_weak = heap.add_weak_root(Some(live));
        let dead_weak = heap.add_weak_root(Some(dead));
        let empty_weak = heap.add_weak_root(None);

        heap.collect().unwrap();

        let live = mutator.root(slot);
        assert!(live.is_some());
        assert_eq!(heap.weak_root(live_weak), live);
        assert_eq!(heap.weak_root(dead_weak), None);
        assert_eq!(heap.weak_root(empty_weak), None);
        assert_eq!(unsafe { mutator.read_word(live.unwrap(), 0) }, 99);
    }
}

#[test]
fn test_reference_objects_are_cleared_and_reported() {
    for mode in MODES {
        let heap = heap_in_mode(mode);
        let reported: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let reported = Arc::clone(&reported);
            heap.set_reference_callback(move |cleared| {
                reported.lock().extend(cleared.iter().map(|r| r.addr()));
            });
        }
        let mutator = heap.attach_mutator();
        let _garbage = mutator.alloc(0, 40).unwrap();
        let referent = mutator.alloc(0, 2).unwrap();
        let doomed = mutator.alloc(0, 2).unwrap();
        let strong_slot = mutator.push_root(Some(referent));
        let keeps = mutator.alloc_reference(Some(referent)).unwrap();
        let keeps_slot = mutator.push_root(Some(keeps));
        let loses = mutator.alloc_reference(Some(doomed)).unwrap();
        let loses_slot = mutator.push_root(Some(loses));

        let stats = heap.collect().unwrap();
        assert_eq!(stats.references_cleared, 1, "{mode:?}");

        let referent = mutator.root(strong_slot);
        let keeps = mutator.root(keeps_slot).unwrap();
        let loses = mutator.root(loses_slot).unwrap();
        unsafe {
            assert_eq!(mutator.reference_get(keeps), referent);
            assert_eq!(mutator.reference_get(loses), None);
        }
        assert_eq!(*reported.lock(), vec![loses.addr()]);
    }
}

#[test]
fn test_references_from_other_spaces_are_updated() {
    for mode in MODES {
        let heap = heap_in_mode(mode);
        let page = heap.page_size();
        let mutator = heap.attach_mutator();

        let immune = heap.alloc_immune(1, 0).unwrap();
        let _garbage = mutator.alloc(0, 100).unwrap();
        let from_immune = mutator.alloc(0, 1).unwrap();
        let from_non_moving = mutator.alloc(0, 1).unwrap();
        let from_large = mutator.alloc(0, 1).unwrap();
        let pinned = mutator.alloc_non_moving(1, 1).unwrap();
        let _dead_pinned = mutator.alloc_non_moving(0, 6).unwrap();
        let large = mutator.alloc_large(1, 3 * page / 8).unwrap();
        let _dead_large = mutator.alloc_large(0, 3 * page / 8).unwrap();
        unsafe {
            mutator.write_word(from_immune, 0, 1);
            mutator.write_word(from_non_moving, 0, 2);
            mutator.write_word(from_large, 0, 3);
            mutator.write_ref(immune, 0, Some(from_immune));
            mutator.write_ref(pinned, 0, Some(from_non_moving));
            mutator.write_ref(large, 0, Some(from_large));
        }
        let old = [from_immune, from_non_moving, from_large];
        let pinned_slot = mutator.push_root(Some(pinned));
        let large_slot = mutator.push_root(Some(large));

        let stats = heap.collect().unwrap();
        assert!(stats.non_moving_bytes_freed >= 56, "{mode:?}");
        assert_eq!(stats.large_objects_freed, 1);
        assert_eq!(heap.large_object_space().len(), 1);

        assert_eq!(mutator.root(pinned_slot), Some(pinned));
        assert_eq!(mutator.root(large_slot), Some(large));
        for (holder, (value, old)) in [immune, pinned, large].into_iter().zip((1..).zip(old)) {
            let moved = unsafe { mutator.read_ref(holder, 0) }.unwrap();
            assert_ne!(moved, old, "{mode:?}");
            assert!(heap.moving_space().has_address(moved.addr()));
            assert_eq!(unsafe { mutator.read_word(moved, 0) }, value);
        }
    }
}

#[test]
fn test_collection_recovers_from_exhaustion() {
    let heap = Heap::new(
        small_config()
            .moving_space_capacity(256 << 10)
            .tlab_size(16 << 10)
            .mode(CompactionMode::Copy),
    )
    .unwrap();
    let mutator = heap.attach_mutator();
    let keep = mutator.alloc(0, 4).unwrap();
    let slot = mutator.push_root(Some(keep));
    while mutator.alloc(0, 30).is_ok() {}

    let stats = heap.collect().unwrap();
    assert_eq!(stats.live_bytes, 40);
    assert!(mutator.alloc(0, 30).is_ok());
    assert_eq!(mutator.root(slot).map(ObjRef::addr), Some(heap.moving_space().begin()));
}

/// A second mutator allocates without pause for the whole cycle. Objects
/// allocated after the marking pause are black: they move by exactly the
/// black slide, and those allocated after the compaction pause not at all.
/// Links between black objects slide with them.
#[test]
fn test_allocations_during_a_cycle() {
    for mode in MODES {
        let heap = heap_in_mode(mode);
        let main = heap.attach_mutator();
        build_random_graph(&main, 23, 6000, 4);
        let expected = heap_image(&main, &mutator_roots(&main));

        let done = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();
        let worker = {
            let heap = Arc::clone(&heap);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mutator = heap.attach_mutator();
                let mut count = 0usize;
                while !done.load(Ordering::Acquire) && count < 40_000 {
                    let _runnable = mutator.runnable();
                    let Ok(obj) = mutator.alloc(1, 3) else {
                        break;
                    };
                    // Each object points at the previous one and remembers
                    // where that one was when the link was made.
                    let prev = count.checked_sub(1).and_then(|slot| mutator.root(slot));
                    unsafe {
                        mutator.write_word(obj, 0, obj.addr());
                        mutator.write_word(obj, 1, count);
                        mutator.write_word(obj, 2, prev.map_or(0, |prev| prev.addr()));
                        mutator.write_ref(obj, 0, prev);
                    }
                    mutator.push_root(Some(obj));
                    if count == 0 {
                        started_tx.send(()).unwrap();
                    }
                    count += 1;
                }
                while !done.load(Ordering::Acquire) {
                    thread::yield_now();
                }

                let stats = heap.last_stats().unwrap();
                let post_compact_end = heap.moving_space().begin() + align_up(stats.live_bytes, heap.page_size());
                let roots = mutator_roots(&mutator);
                let slid = |obj: ObjRef| {
                    let old = unsafe { mutator.read_word(obj, 0) };
                    obj.addr() >= post_compact_end && old != obj.addr()
                };
                let mut still_sliding = true;
                for (n, root) in roots.iter().enumerate() {
                    let obj = root.unwrap();
                    let (old, number, prev_old) =
                        unsafe { (mutator.read_word(obj, 0), mutator.read_word(obj, 1), mutator.read_word(obj, 2)) };
                    assert_eq!(number, n);
                    let prev = unsafe { mutator.read_ref(obj, 0) };
                    assert_eq!(prev, n.checked_sub(1).and_then(|p| roots[p]), "link of object {n}");
                    if obj.addr() < post_compact_end {
                        continue;
                    }
                    if old == obj.addr() {
                        still_sliding = false;
                    } else {
                        assert!(still_sliding, "object {n} moved after unmoved black objects");
                        assert_eq!(old - obj.addr(), stats.black_slide_diff, "object {n}");
                        if let Some(prev) = prev.filter(|&prev| slid(prev)) {
                            // Both ends slid, and the link slid with them.
                            assert_eq!(prev.addr(), prev_old - stats.black_slide_diff, "link of object {n}");
                        }
                    }
                }
                count
            })
        };

        started_rx.recv().unwrap();
        let stats = heap.collect().unwrap();
        done.store(true, Ordering::Release);
        let allocated = worker.join().unwrap();
        assert!(allocated > 0);
        assert_eq!(stats.mode, Some(mode));
        assert_eq!(heap_image(&main, &mutator_roots(&main)), expected, "{mode:?}");
    }
}
