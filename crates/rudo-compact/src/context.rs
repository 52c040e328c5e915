//! Process-wide compaction context.
//!
//! Decides once which [`CompactionMode`] and fault source the heap uses and
//! owns the `userfaultfd` descriptor when there is one.
//!
//! | `fault_source` | forced mode | userfaultfd | result                 |
//! |----------------|-------------|-------------|------------------------|
//! | any            | `fallback`  | -           | `Fallback`             |
//! | any            | `minor`     | -           | `Minor`, emulated      |
//! | `Emulated`     | none/`copy` | -           | `Copy`, emulated       |
//! | `Auto`         | none/`copy` | opens       | `Copy`, kernel         |
//! | `Auto`         | none/`copy` | fails       | `Copy`, emulated, warned once |
//! | `Kernel`       | none/`copy` | opens       | `Copy`, kernel         |
//! | `Kernel`       | none/`copy` | fails       | `Fallback`, warned once |
//!
//! The handshake first asks for no features, then requests only the optional
//! shmem features the kernel reported.

use std::sync::Once;

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::io;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(any(target_os = "linux", target_os = "android"))]
use sys_alloc::uffd::{features, Userfaultfd};

use crate::config::{CompactionMode, FaultSourceKind, GcConfig};
use crate::tracing::internal;

static DOWNGRADE_WARNING: Once = Once::new();

#[cfg(any(target_os = "linux", target_os = "android"))]
const WANTED_FEATURES: u64 = features::MISSING_SHMEM | features::MINOR_SHMEM;

#[derive(Debug)]
struct ContextState {
    mode: CompactionMode,
    kernel_faults: bool,
    minor_shmem: bool,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    uffd: Option<Arc<Userfaultfd>>,
    shut_down: bool,
}

/// The compaction mode and kernel facility shared by every cycle.
#[derive(Debug)]
pub struct GcContext {
    forced: Option<CompactionMode>,
    fault_source: FaultSourceKind,
    state: Mutex<ContextState>,
}

impl GcContext {
    /// Probes the platform and picks the mode for `config`.
    #[must_use]
    pub fn init(config: &GcConfig) -> Self {
        Self {
            forced: config.mode,
            fault_source: config.fault_source,
            state: Mutex::new(detect(config.mode, config.fault_source)),
        }
    }

    /// The mode every cycle runs in.
    #[must_use]
    pub fn mode(&self) -> CompactionMode {
        self.state.lock().mode
    }

    /// `true` when faults are intercepted by the kernel rather than by the
    /// heap's accessors.
    #[must_use]
    pub fn uses_kernel_faults(&self) -> bool {
        self.state.lock().kernel_faults
    }

    /// Whether the kernel offered minor faults on shmem. Recorded only; the
    /// moving space is anonymous memory.
    #[must_use]
    pub fn minor_shmem_supported(&self) -> bool {
        self.state.lock().minor_shmem
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn userfaultfd(&self) -> Option<Arc<Userfaultfd>> {
        self.state.lock().uffd.clone()
    }

    /// Drops the descriptor and probes again, for a child process after
    /// `fork`. No-op after [`GcContext::shutdown`].
    pub fn fork_reinit(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            state.uffd = None;
        }
        *state = detect(self.forced, self.fault_source);
    }

    /// Closes the descriptor. Later cycles compact inside the pause.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            state.uffd = None;
        }
        state.kernel_faults = false;
        state.mode = CompactionMode::Fallback;
        state.shut_down = true;
    }

    /// `true` once [`GcContext::shutdown`] ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

fn downgrade(reason: &str, fallback: &str) {
    DOWNGRADE_WARNING.call_once(|| {
        internal::warn(&format!("userfaultfd unavailable ({reason}), {fallback}"));
    });
}

fn emulated(mode: CompactionMode) -> ContextState {
    ContextState {
        mode,
        kernel_faults: false,
        minor_shmem: false,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        uffd: None,
        shut_down: false,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn detect(forced: Option<CompactionMode>, fault_source: FaultSourceKind) -> ContextState {
    match (forced, fault_source) {
        (Some(CompactionMode::Fallback), _) => emulated(CompactionMode::Fallback),
        (Some(CompactionMode::Minor), _) => emulated(CompactionMode::Minor),
        (_, FaultSourceKind::Emulated) => emulated(CompactionMode::Copy),
        (_, kind) => select(kind, Userfaultfd::open_supported(WANTED_FEATURES)),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn select(kind: FaultSourceKind, opened: io::Result<Userfaultfd>) -> ContextState {
    match opened {
        Ok(uffd) => ContextState {
            mode: CompactionMode::Copy,
            kernel_faults: true,
            minor_shmem: uffd.features() & features::MINOR_SHMEM != 0,
            uffd: Some(Arc::new(uffd)),
            shut_down: false,
        },
        Err(err) if kind == FaultSourceKind::Kernel => {
            downgrade(&err.to_string(), "compacting inside the pause");
            emulated(CompactionMode::Fallback)
        }
        Err(err) => {
            downgrade(&err.to_string(), "using emulated faults");
            emulated(CompactionMode::Copy)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn detect(forced: Option<CompactionMode>, fault_source: FaultSourceKind) -> ContextState {
    match (forced, fault_source) {
        (Some(CompactionMode::Fallback), _) => emulated(CompactionMode::Fallback),
        (Some(CompactionMode::Minor), _) => emulated(CompactionMode::Minor),
        (_, FaultSourceKind::Kernel) => {
            downgrade("not a Linux target", "compacting inside the pause");
            emulated(CompactionMode::Fallback)
        }
        _ => emulated(CompactionMode::Copy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_modes_ignore_the_kernel() {
        let ctx = GcContext::init(&GcConfig::default().mode(CompactionMode::Fallback));
        assert_eq!(ctx.mode(), CompactionMode::Fallback);
        assert!(!ctx.uses_kernel_faults());

        let ctx = GcContext::init(&GcConfig::default().mode(CompactionMode::Minor));
        assert_eq!(ctx.mode(), CompactionMode::Minor);
        assert!(!ctx.uses_kernel_faults());
    }

    #[test]
    fn test_emulated_copy() {
        let ctx = GcContext::init(&GcConfig::default().fault_source(FaultSourceKind::Emulated));
        assert_eq!(ctx.mode(), CompactionMode::Copy);
        assert!(!ctx.uses_kernel_faults());
    }

    #[test]
    fn test_kernel_source_never_emulates() {
        let ctx = GcContext::init(&GcConfig::default().fault_source(FaultSourceKind::Kernel));
        match ctx.mode() {
            CompactionMode::Copy => assert!(ctx.uses_kernel_faults()),
            CompactionMode::Fallback => assert!(!ctx.uses_kernel_faults()),
            CompactionMode::Minor => panic!("minor mode was not requested"),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_failed_handshake_downgrades_per_source() {
        let enosys = || io::Error::from_raw_os_error(libc::ENOSYS);

        let state = select(FaultSourceKind::Auto, Err(enosys()));
        assert_eq!(state.mode, CompactionMode::Copy);
        assert!(!state.kernel_faults);
        assert!(state.uffd.is_none());

        let state = select(FaultSourceKind::Kernel, Err(enosys()));
        assert_eq!(state.mode, CompactionMode::Fallback);
        assert!(!state.kernel_faults);
        assert!(DOWNGRADE_WARNING.is_completed());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_kernel_source_opens_whenever_a_bare_handshake_does() {
        if Userfaultfd::open(0).is_err() {
            return;
        }
        let ctx = GcContext::init(&GcConfig::default().fault_source(FaultSourceKind::Kernel));
        assert_eq!(ctx.mode(), CompactionMode::Copy);
        assert!(ctx.uses_kernel_faults());
        assert!(ctx.userfaultfd().is_some());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = GcContext::init(&GcConfig::default().fault_source(FaultSourceKind::Emulated));
        ctx.shutdown();
        ctx.shutdown();
        ctx.fork_reinit();
        assert!(ctx.is_shut_down());
        assert_eq!(ctx.mode(), CompactionMode::Fallback);
    }
}
