//! Helpers for tests: small heaps and address-independent heap images.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{CompactionMode, FaultSourceKind, GcConfig};
use crate::heap::Heap;
use crate::mutator::Mutator;
use crate::object::{slot_offset, ObjRef, ObjectKind, HEADER_SIZE};

/// A 4 MiB moving space with small TLABs and the in-process fault source.
#[must_use]
pub fn small_config() -> GcConfig {
    GcConfig::default()
        .moving_space_capacity(4 << 20)
        .non_moving_capacity(1 << 20)
        .immune_capacity(1 << 16)
        .tlab_size(8 << 10)
        .compaction_workers(2)
        .fault_source(FaultSourceKind::Emulated)
}

/// Builds a small heap forced into `mode`.
///
/// # Panics
///
/// Panics if the reservations fail.
#[must_use]
pub fn heap_in_mode(mode: CompactionMode) -> Arc<Heap> {
    Heap::new(small_config().mode(mode)).expect("failed to create test heap")
}

/// One reachable object, with references replaced by discovery indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectImage {
    /// Object kind.
    pub kind: ObjectKind,
    /// Reference slots as indices into the image.
    pub refs: Vec<Option<usize>>,
    /// Payload words.
    pub payload: Vec<usize>,
}

/// Everything reachable from `roots`, in breadth-first discovery order.
/// Two heaps holding the same object graph produce equal images whatever
/// the addresses.
///
/// # Panics
///
/// Panics if a reachable object has a corrupt header.
#[must_use]
pub fn heap_image(mutator: &Mutator, roots: &[Option<ObjRef>]) -> Vec<ObjectImage> {
    let _runnable = mutator.runnable();
    let mut index: HashMap<usize, usize> = HashMap::new();
    let mut order: Vec<ObjRef> = Vec::new();
    let mut discover = |obj: ObjRef, order: &mut Vec<ObjRef>| -> usize {
        *index.entry(obj.addr()).or_insert_with(|| {
            order.push(obj);
            order.len() - 1
        })
    };
    for root in roots.iter().flatten() {
        discover(*root, &mut order);
    }

    let mut image = Vec::new();
    let mut next = 0;
    while next < order.len() {
        let obj = order[next];
        next += 1;
        mutator.heap().ensure(obj.addr(), HEADER_SIZE);
        // SAFETY: reachable objects are live; no safepoint runs while the
        // image is taken.
        let (kind, num_refs, size) = unsafe { (obj.kind(), obj.num_refs(), obj.size()) };
        assert!(size >= slot_offset(num_refs), "corrupt header at {obj:?}");
        let refs = (0..num_refs)
            .map(|i| {
                // SAFETY: as above.
                unsafe { mutator.read_ref(obj, i) }.map(|child| discover(child, &mut order))
            })
            .collect();
        let payload = (0..(size - slot_offset(num_refs)) / 8)
            // SAFETY: as above.
            .map(|i| unsafe { mutator.read_word(obj, i) })
            .collect();
        image.push(ObjectImage { kind, refs, payload });
    }
    image
}

/// Current values of every root slot of `mutator`.
#[must_use]
pub fn mutator_roots(mutator: &Mutator) -> Vec<Option<ObjRef>> {
    (0..mutator.root_count()).map(|i| mutator.root(i)).collect()
}

/// Deterministic pseudo-random generator for graph builders.
#[derive(Debug, Clone)]
pub struct Lcg(u64);

impl Lcg {
    /// Seeds the generator.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Next value in `0..bound`.
    pub fn below(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 33) as usize) % bound.max(1)
    }
}

/// Allocates `count` moving objects wired into a random graph, keeps about
/// one in `keep_one_in` of them as roots and drops the rest. Payload word
/// 0 of every object holds its allocation number.
///
/// # Panics
///
/// Panics if the moving space is exhausted.
pub fn build_random_graph(mutator: &Mutator, seed: u64, count: usize, keep_one_in: usize) {
    let mut rng = Lcg::new(seed);
    let first_root = mutator.root_count();
    for n in 0..count {
        // The only safepoint of an iteration is the allocation itself.
        let _runnable = mutator.runnable();
        let num_refs = rng.below(4);
        let payload = 1 + rng.below(6);
        let obj = mutator.alloc(num_refs, payload).expect("moving space exhausted");
        // SAFETY: fresh object, no safepoint since its allocation.
        unsafe { mutator.write_word(obj, 0, n) };
        let roots = mutator.root_count() - first_root;
        for slot in 0..num_refs {
            if roots > 0 && rng.below(3) != 0 {
                let target = mutator.root(first_root + rng.below(roots));
                // SAFETY: root values are current.
                unsafe { mutator.write_ref(obj, slot, target) };
            }
        }
        if rng.below(keep_one_in) == 0 {
            mutator.push_root(Some(obj));
        }
    }
}
