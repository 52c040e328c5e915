//! Cycles whose faults are taken by the kernel through userfaultfd.
//!
//! Most containers forbid the syscall; every test returns early when the
//! kernel will not hand out a descriptor.

#![cfg(all(feature = "test-util", target_os = "linux"))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use rudo_compact::test_util::{build_random_graph, heap_image, mutator_roots, small_config};
use rudo_compact::{CompactionMode, FaultSourceKind, Heap};
use sys_alloc::uffd::Userfaultfd;

fn kernel_heap() -> Option<Arc<Heap>> {
    if Userfaultfd::open(0).is_err() {
        return None;
    }
    let heap = Heap::new(small_config().fault_source(FaultSourceKind::Kernel)).unwrap();
    assert_eq!(heap.context().mode(), CompactionMode::Copy);
    assert!(heap.context().uses_kernel_faults());
    Some(heap)
}

#[test]
fn test_kernel_cycle_keeps_the_graph() {
    let Some(heap) = kernel_heap() else {
        return;
    };
    let mutator = heap.attach_mutator();
    build_random_graph(&mutator, 3, 4000, 5);
    let expected = heap_image(&mutator, &mutator_roots(&mutator));

    let stats = heap.collect().unwrap();
    assert_eq!(stats.mode, Some(CompactionMode::Copy));
    assert!(stats.pages_compacted > 0);
    assert_eq!(heap_image(&mutator, &mutator_roots(&mutator)), expected);
}

/// A second mutator walks its own graph for the whole cycle. Its reads of
/// pages not yet relocated block in the kernel until a worker or the
/// collector installs them.
#[test]
fn test_reader_faults_during_compaction() {
    let Some(heap) = kernel_heap() else {
        return;
    };
    let main = heap.attach_mutator();
    build_random_graph(&main, 17, 6000, 4);
    let expected = heap_image(&main, &mutator_roots(&main));

    let done = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let reader = {
        let heap = Arc::clone(&heap);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mutator = heap.attach_mutator();
            build_random_graph(&mutator, 29, 6000, 4);
            let own = {
                let _runnable = mutator.runnable();
                heap_image(&mutator, &mutator_roots(&mutator))
            };
            ready_tx.send(()).unwrap();

            let mut walks = 0usize;
            loop {
                let finished = done.load(Ordering::Acquire);
                {
                    // Roots are read in the same runnable section as the
                    // walk so a pause cannot move objects in between.
                    let _runnable = mutator.runnable();
                    let roots = mutator_roots(&mutator);
                    assert_eq!(heap_image(&mutator, &roots), own, "walk {walks}");
                }
                walks += 1;
                if finished {
                    break;
                }
                mutator.safepoint();
            }
            walks
        })
    };

    ready_rx.recv().unwrap();
    let stats = heap.collect().unwrap();
    done.store(true, Ordering::Release);
    let walks = reader.join().unwrap();

    assert!(walks > 0);
    assert_eq!(stats.mode, Some(CompactionMode::Copy));
    assert!(stats.pages_compacted > 0);
    assert_eq!(heap_image(&main, &mutator_roots(&main)), expected);
}
