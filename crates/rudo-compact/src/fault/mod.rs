//! Fault-driven page relocation.
//!
//! During the compaction phase the moving space starts out empty: its
//! pre-compaction contents were remapped to the from-space. A page becomes
//! readable once some thread has relocated it and installed it.
//!
//! - [`page_state`]: the per-page claim protocol.
//! - [`source`]: where faults come from and how pages are installed.
//! - `kernel` (Linux): the `userfaultfd` fault source.
//! - `driver`: the eager pass and the fault workers.

mod driver;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod kernel;
pub mod page_state;
pub mod source;

pub use page_state::{PageState, PageStates};
pub use source::{Fault, FaultSource, Installer, MemoryInstaller, SoftFaults};

pub(crate) use driver::Compaction;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use kernel::KernelFaults;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Routes mutator accesses to the running compaction, if any.
#[derive(Default)]
pub(crate) struct FaultGate {
    active: AtomicBool,
    current: RwLock<Option<Arc<Compaction>>>,
}

impl FaultGate {
    /// Makes accesses go through `compaction` until [`FaultGate::deactivate`].
    pub(crate) fn activate(&self, compaction: Arc<Compaction>) {
        *self.current.write() = Some(compaction);
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        *self.current.write() = None;
    }

    /// The running compaction. Cheap when none is.
    pub(crate) fn current(&self) -> Option<Arc<Compaction>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        self.current.read().clone()
    }
}

impl std::fmt::Debug for FaultGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultGate")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
