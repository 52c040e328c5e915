//! Stress tests for the page claim protocol on real threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rudo_compact::fault::{PageState, PageStates};

const PAGES: usize = 256;
const THREADS: usize = 8;

#[test]
fn test_every_page_has_a_single_copy_claimant() {
    let states = Arc::new(PageStates::new(PAGES));
    let claims: Arc<Vec<AtomicUsize>> = Arc::new((0..PAGES).map(|_| AtomicUsize::new(0)).collect());
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let states = Arc::clone(&states);
            let claims = Arc::clone(&claims);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                // Each thread walks the pages from a different offset, as
                // faulting mutators would.
                for i in 0..PAGES {
                    let idx = (i * 7 + t * 31) % PAGES;
                    if states.try_claim(idx, PageState::ProcessingAndMapping).is_ok() {
                        claims[idx].fetch_add(1, Ordering::Relaxed);
                        states.set_mapped(idx);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for idx in 0..PAGES {
        assert_eq!(claims[idx].load(Ordering::Relaxed), 1, "page {idx}");
        assert_eq!(states.get(idx), PageState::Mapped);
    }
}

#[test]
fn test_minor_protocol_maps_each_page_once() {
    let states = Arc::new(PageStates::new(PAGES));
    let maps: Arc<Vec<AtomicUsize>> = Arc::new((0..PAGES).map(|_| AtomicUsize::new(0)).collect());
    let start = Arc::new(Barrier::new(THREADS + 1));

    let map = {
        let states = Arc::clone(&states);
        let maps = Arc::clone(&maps);
        move |idx: usize| {
            maps[idx].fetch_add(1, Ordering::Relaxed);
            states.set_mapped(idx);
        }
    };

    let faulters: Vec<_> = (0..THREADS)
        .map(|t| {
            let states = Arc::clone(&states);
            let start = Arc::clone(&start);
            let map = map.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..PAGES {
                    let idx = (i + t * 17) % PAGES;
                    loop {
                        match states.get(idx) {
                            PageState::Unprocessed => {
                                if states.try_claim(idx, PageState::ProcessingAndMapping).is_ok() {
                                    map(idx);
                                    break;
                                }
                            }
                            PageState::Processing => {
                                if states.upgrade(idx).is_ok() {
                                    break;
                                }
                            }
                            PageState::Processed => {
                                if states.claim_processed(idx).is_ok() {
                                    map(idx);
                                    break;
                                }
                            }
                            PageState::ProcessingAndMapping | PageState::Mapped => break,
                        }
                    }
                }
            })
        })
        .collect();

    // The eager compactor walks back to front and maps its own pages only
    // when a faulter asked for them.
    start.wait();
    let mut batch = Vec::new();
    for idx in (0..PAGES).rev() {
        if states.try_claim(idx, PageState::Processing).is_err() {
            continue;
        }
        match states.finish_processing(idx) {
            Ok(()) => batch.push(idx),
            Err(PageState::ProcessingAndMapping) => map(idx),
            Err(state) => panic!("page {idx} in {state:?}"),
        }
    }
    for idx in batch {
        if states.claim_processed(idx).is_ok() {
            map(idx);
        }
    }
    for faulter in faulters {
        faulter.join().unwrap();
    }

    for idx in 0..PAGES {
        assert_eq!(maps[idx].load(Ordering::Relaxed), 1, "page {idx}");
        assert_eq!(states.get(idx), PageState::Mapped);
    }
}

#[test]
fn test_states_never_move_backwards() {
    let states = PageStates::new(1);
    states.try_claim(0, PageState::Processing).unwrap();
    assert_eq!(states.try_claim(0, PageState::ProcessingAndMapping), Err(PageState::Processing));
    states.finish_processing(0).unwrap();
    assert_eq!(states.finish_processing(0), Err(PageState::Processed));
    states.claim_processed(0).unwrap();
    states.set_mapped(0);
    assert_eq!(states.upgrade(0), Err(PageState::Mapped));
    assert_eq!(states.claim_processed(0), Err(PageState::Mapped));
    assert_eq!(states.get(0), PageState::Mapped);
}
