//! Integration tests for the tracing feature.
//!
//! A capturing subscriber checks that cycles emit their spans and phase
//! events.

#![cfg(feature = "tracing")]

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rudo_compact::{CompactionMode, FaultSourceKind, GcConfig, Heap};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn traced<R>(f: impl FnOnce() -> R) -> (R, String) {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, capture.contents())
}

fn config(mode: CompactionMode) -> GcConfig {
    GcConfig::default()
        .moving_space_capacity(1 << 20)
        .fault_source(FaultSourceKind::Emulated)
        .mode(mode)
}

#[test]
fn test_cycle_emits_collection_span() {
    let heap = Heap::new(config(CompactionMode::Copy)).unwrap();
    let mutator = heap.attach_mutator();
    let _garbage = mutator.alloc(0, 16).unwrap();

    let (stats, output) = traced(|| heap.collect().unwrap());
    assert_eq!(stats.cycle, 1);
    assert!(output.contains("gc_collect"), "{output}");
    assert!(output.contains("compaction_mode="), "{output}");
    assert!(output.contains("copy"), "{output}");
}

#[test]
fn test_every_phase_is_logged() {
    let heap = Heap::new(config(CompactionMode::Fallback)).unwrap();
    let (_, output) = traced(|| heap.collect().unwrap());
    for phase in ["Initialize", "Marking", "MarkingPause", "Reclaim", "PreCompactionPause", "Finish"] {
        assert!(output.contains(&format!("phase={phase}")), "missing {phase}: {output}");
    }
    assert_eq!(output.matches("phase_start").count(), output.matches("phase_end").count());
}

#[test]
fn test_heap_creation_is_logged() {
    let (heap, output) = traced(|| Heap::new(config(CompactionMode::Minor)).unwrap());
    assert_eq!(heap.context().mode(), CompactionMode::Minor);
    assert!(output.contains("heap created"), "{output}");
}

#[test]
fn test_multiple_collections_with_tracing() {
    let heap = Heap::new(config(CompactionMode::Copy)).unwrap();
    let mutator = heap.attach_mutator();
    let (_, output) = traced(|| {
        for i in 0..5 {
            let obj = mutator.alloc(0, 4).unwrap();
            if i % 2 == 0 {
                mutator.push_root(Some(obj));
            }
            heap.collect().unwrap();
        }
    });
    let finished = output.lines().filter(|line| line.contains("phase_end phase=Finish")).count();
    assert_eq!(finished, 5);
}
