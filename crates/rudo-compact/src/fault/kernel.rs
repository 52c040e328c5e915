//! `userfaultfd`-backed fault source.
//!
//! The moving space is registered in missing mode for the compaction phase.
//! Mutators touching an absent page block in the kernel until a worker
//! installs it with `UFFDIO_COPY` or `UFFDIO_ZEROPAGE`.
//!
//! Workers are stopped through a separate termination page registered the
//! same way: the collector reads it and every worker that sees that fault
//! exits. All but the last wake the collector, which re-faults, and the
//! last one installs the page so the read completes.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sys_alloc::uffd::{RegisterMode, Userfaultfd};
use sys_alloc::{Mmap, MmapOptions};

use crate::error::fatal;
use crate::space::align_down;

use super::page_state::PageStates;
use super::source::{Fault, FaultSource, Installer};

/// Retries `op` while the kernel reports `EAGAIN`, which happens when the
/// address space changes under the ioctl.
fn retry_eagain<T>(what: &str, mut op: impl FnMut() -> io::Result<T>) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {}
            Err(err) => fatal::resource_exhausted(what, &err),
        }
    }
}

/// Installs pages with `userfaultfd` ioctls.
#[derive(Debug)]
pub(crate) struct KernelInstaller {
    uffd: Arc<Userfaultfd>,
}

impl Installer for KernelInstaller {
    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        // SAFETY: guaranteed by the caller. EEXIST (lost race) is reported
        // as `AlreadyMapped` and ignored.
        retry_eagain("UFFDIO_COPY", || unsafe { self.uffd.copy(dst, src as *const u8, len) });
    }

    fn zero(&self, dst: usize, len: usize) {
        retry_eagain("UFFDIO_ZEROPAGE", || self.uffd.zeropage(dst, len));
    }

    unsafe fn map_shadow(&self, dst: usize, _shadow: usize, len: usize) {
        retry_eagain("UFFDIO_CONTINUE", || self.uffd.continue_range(dst, len));
    }

    fn wake(&self, dst: usize, len: usize) {
        retry_eagain("UFFDIO_WAKE", || self.uffd.wake(dst, len));
    }
}

/// Kernel fault source for one compaction phase.
#[derive(Debug)]
pub(crate) struct KernelFaults {
    installer: KernelInstaller,
    page_size: usize,
    moving_begin: usize,
    moving_len: usize,
    termination: Mmap,
    remaining_workers: AtomicUsize,
}

impl KernelFaults {
    /// Registers `[moving_begin, moving_begin + moving_len)` and a fresh
    /// termination page for missing faults.
    ///
    /// # Errors
    ///
    /// Returns the mapping or registration error.
    pub(crate) fn new(
        uffd: Arc<Userfaultfd>,
        page_size: usize,
        moving_begin: usize,
        moving_len: usize,
    ) -> io::Result<Self> {
        // SAFETY: owned by the returned source.
        let termination = unsafe { MmapOptions::new().len(page_size).map_anon()? };
        uffd.register(termination.ptr() as usize, page_size, RegisterMode::Missing)?;
        if let Err(err) = uffd.register(moving_begin, moving_len, RegisterMode::Missing) {
            let _ = uffd.unregister(termination.ptr() as usize, page_size);
            return Err(err);
        }
        Ok(Self {
            installer: KernelInstaller { uffd },
            page_size,
            moving_begin,
            moving_len,
            termination,
            remaining_workers: AtomicUsize::new(0),
        })
    }

    fn termination_page(&self) -> usize {
        self.termination.ptr() as usize
    }
}

impl FaultSource for KernelFaults {
    fn next_fault(&self) -> Fault {
        let event = match self.installer.uffd.read_event() {
            Ok(event) => event,
            Err(err) => fatal::resource_exhausted("reading userfaultfd events", &err),
        };
        let page = align_down(event.address, self.page_size);
        if page != self.termination_page() {
            return Fault::Page(page);
        }
        if self.remaining_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.installer.zero(page, self.page_size);
        } else {
            self.installer.wake(page, self.page_size);
        }
        Fault::Terminate
    }

    fn request(&self, _pages: &PageStates, _idx: usize, _addr: usize) {}

    fn traps_accesses(&self) -> bool {
        true
    }

    fn terminate(&self, _pages: &PageStates, workers: usize) {
        if workers == 0 {
            return;
        }
        self.remaining_workers.store(workers, Ordering::Release);
        // SAFETY: the termination page is mapped; the read blocks until the
        // last worker installs it.
        unsafe { ptr::read_volatile(self.termination.ptr()) };
    }

    fn installer(&self) -> &dyn Installer {
        &self.installer
    }

    /// Stops watching the moving space. Threads still blocked on it retry
    /// their access against the now plain mapping.
    fn finish(&self) {
        let uffd = &self.installer.uffd;
        if let Err(err) = uffd.unregister(self.moving_begin, self.moving_len) {
            fatal::resource_exhausted("unregistering the moving space", &err);
        }
        let _ = uffd.unregister(self.termination_page(), self.page_size);
    }
}
