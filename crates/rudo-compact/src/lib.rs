//! A concurrent mark-compact collector core.
//!
//! `rudo-compact` manages a heap of word-addressed objects split into a
//! moving space, a non-moving space, an immune ("boot image") space and a
//! large-object space. Collection is **concurrent mark-compact**: marking
//! runs alongside the mutators, two short pauses fix up roots, and the
//! moving space is compacted page by page while mutators keep running.
//!
//! # Page Relocation
//!
//! At the second pause the whole moving space is remapped to a scratch
//! from-space, leaving every page absent. A page becomes readable again when
//! some thread compacts it and installs the result:
//!
//! - with `userfaultfd` (Linux), the kernel blocks any access to an absent
//!   page and a worker thread serves the fault;
//! - otherwise the heap's accessors request the page from the same workers
//!   before touching it.
//!
//! Either way each page is compacted exactly once. See [`fault`] for the
//! per-page protocol and [`CompactionMode`] for how the mode is chosen.
//!
//! # Quick Start
//!
//! ```
//! use rudo_compact::{GcConfig, Heap};
//!
//! let heap = Heap::new(GcConfig::default().moving_space_capacity(1 << 20)).unwrap();
//! let mutator = heap.attach_mutator();
//!
//! let list = mutator.alloc(1, 1).unwrap();
//! let slot = mutator.push_root(Some(list));
//! let _garbage = mutator.alloc(0, 64).unwrap();
//!
//! let stats = heap.collect().unwrap();
//! assert!(stats.live_bytes < stats.moving_bytes_before);
//!
//! // Roots follow their objects.
//! let list = mutator.root(slot).unwrap();
//! assert_eq!(unsafe { mutator.read_word(list, 0) }, 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod accounting;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod fault;
pub mod heap;
pub mod metrics;
pub mod mutator;
pub mod object;
pub mod reference;
pub mod roots;
pub mod space;
pub mod sync;
pub mod thread;
pub mod tracing;

// Re-export public API
pub use collector::{CompactionPlan, GcPhase};
pub use config::{CompactionMode, FaultSourceKind, GcConfig};
pub use context::GcContext;
pub use error::GcError;
pub use heap::Heap;
pub use metrics::{global_metrics, CollectionStats, GlobalMetrics};
pub use mutator::{Mutator, RunnableGuard};
pub use object::{ObjRef, ObjectKind};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;
