//! Where page faults come from and how pages get installed.
//!
//! The kernel source reads `userfaultfd` events; [`SoftFaults`] is an
//! in-process queue fed by the heap's accessors. Both hand out an
//! [`Installer`] that places finished pages into the moving space.

use std::ptr;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::page_state::{PageState, PageStates};

/// One unit of work for a fault worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A thread touched the page starting at this address.
    Page(usize),
    /// The worker must leave its loop.
    Terminate,
}

/// Places finished pages into the moving space.
pub trait Installer: Send + Sync {
    /// Installs `len` bytes from `src` at `dst` and wakes anyone blocked on
    /// them.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes and `dst` must be page
    /// aligned inside the moving space.
    unsafe fn copy(&self, dst: usize, src: usize, len: usize);

    /// Installs zero pages over `[dst, dst + len)`.
    fn zero(&self, dst: usize, len: usize);

    /// Maps already-compacted shadow pages at `dst`.
    ///
    /// # Safety
    ///
    /// `shadow` must hold `len` finished bytes.
    unsafe fn map_shadow(&self, dst: usize, shadow: usize, len: usize);

    /// Wakes threads blocked on `[dst, dst + len)` without installing.
    fn wake(&self, _dst: usize, _len: usize) {}
}

/// A stream of page faults on the moving space.
pub trait FaultSource: Send + Sync {
    /// Blocks until the next fault or termination request.
    fn next_fault(&self) -> Fault;

    /// Called by a mutator about to touch page `idx` (at `addr`) that is
    /// not yet mapped. Returns once it is.
    fn request(&self, pages: &PageStates, idx: usize, addr: usize);

    /// Called after one or more pages turned [`PageState::Mapped`].
    fn mapped(&self) {}

    /// Makes `workers` threads blocked in [`FaultSource::next_fault`]
    /// return [`Fault::Terminate`]. Every page is installed when this is
    /// called.
    fn terminate(&self, pages: &PageStates, workers: usize);

    /// The installer matching this source.
    fn installer(&self) -> &dyn Installer;

    /// Called once the phase is over and every worker has exited.
    fn finish(&self) {}

    /// `true` if mutator accesses fault on their own, so the heap's
    /// accessors need not call [`FaultSource::request`].
    fn traps_accesses(&self) -> bool {
        false
    }
}

// ============================================================================
// In-process installer
// ============================================================================

/// Installs pages with plain memory copies.
///
/// Moving-space pages that were never written read as zero, so installing
/// a zero page is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryInstaller;

impl Installer for MemoryInstaller {
    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        // SAFETY: guaranteed by the caller; the moving space and the
        // buffers never overlap.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
    }

    fn zero(&self, _dst: usize, _len: usize) {}

    unsafe fn map_shadow(&self, dst: usize, shadow: usize, len: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.copy(dst, shadow, len) };
    }
}

// ============================================================================
// SoftFaults
// ============================================================================

/// In-process fault source.
///
/// Mutators post the page they need on a channel and sleep on a condition
/// variable until a worker or the collector marks it mapped.
pub struct SoftFaults {
    tx: Sender<Fault>,
    rx: Receiver<Fault>,
    lock: Mutex<()>,
    cond: Condvar,
    installer: MemoryInstaller,
}

impl SoftFaults {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            lock: Mutex::new(()),
            cond: Condvar::new(),
            installer: MemoryInstaller,
        }
    }

    /// Faults posted but not yet taken by a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for SoftFaults {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftFaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftFaults").field("pending", &self.pending()).finish()
    }
}

impl FaultSource for SoftFaults {
    fn next_fault(&self) -> Fault {
        // The sender lives in `self`, so the channel never disconnects.
        self.rx.recv().unwrap_or(Fault::Terminate)
    }

    fn request(&self, pages: &PageStates, idx: usize, addr: usize) {
        if pages.get(idx) == PageState::Mapped {
            return;
        }
        let _ = self.tx.send(Fault::Page(addr));
        let mut guard = self.lock.lock();
        while pages.get(idx) != PageState::Mapped {
            self.cond.wait(&mut guard);
        }
    }

    fn mapped(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn terminate(&self, pages: &PageStates, workers: usize) {
        // Pages past the compacted range are never claimed by the collector.
        // Nothing lives there yet, so they can be declared mapped as is.
        for idx in 0..pages.len() {
            let _ = pages.try_claim(idx, PageState::Mapped);
        }
        self.mapped();
        for _ in 0..workers {
            let _ = self.tx.send(Fault::Terminate);
        }
    }

    fn installer(&self) -> &dyn Installer {
        &self.installer
    }
}
