use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::RemapKind;

#[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple", target_os = "netbsd"))]
const NORESERVE_FLAG: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple", target_os = "netbsd")))]
const NORESERVE_FLAG: libc::c_int = 0;

// Linux 5.7+. Older libc releases do not export it.
#[cfg(any(target_os = "linux", target_os = "android"))]
const MREMAP_DONTUNMAP: libc::c_int = 4;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The system page size. Queried once.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(queried, Ordering::Relaxed);
    queried
}

/// An owned `PROT_READ | PROT_WRITE` private anonymous region.
pub struct MmapInner {
    base: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves `len` bytes of zeroed memory. With `no_reserve` the kernel
    /// does not account swap for the range up front.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero.
    pub unsafe fn reserve(len: usize, no_reserve: bool) -> io::Result<Self> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        if no_reserve {
            flags |= NORESERVE_FLAG;
        }
        // SAFETY: a fresh anonymous mapping at a kernel-chosen address
        // cannot alias existing memory.
        let base = unsafe {
            libc::mmap(ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, flags, -1, 0)
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { base, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.base.cast()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Drops the physical pages backing `[offset, offset + len)`.
    ///
    /// Private anonymous pages read back as zero afterwards and, on Linux,
    /// become "missing" again for userfaultfd purposes.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the caller checked the range against `self.len`.
        let start = unsafe { self.ptr().add(offset) };
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: the range lies inside this mapping.
            if unsafe { libc::madvise(start.cast(), len, libc::MADV_DONTNEED) } != 0 {
                return Err(Error::last_os_error());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        // SAFETY: the range lies inside this mapping.
        unsafe {
            ptr::write_bytes(start, 0, len);
        }
        Ok(())
    }

    /// Moves this mapping's pages on top of `target` without copying.
    ///
    /// The source range stays mapped but empty. Falls back to a copy
    /// followed by a discard when the kernel rejects `MREMAP_DONTUNMAP`.
    pub fn remap_into(&self, target: &Self) -> io::Result<RemapKind> {
        debug_assert_eq!(self.len, target.len);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let flags = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED | MREMAP_DONTUNMAP;
            // SAFETY: both ranges are owned mappings of the same length;
            // `target`'s old pages are replaced, not leaked.
            let moved = unsafe { libc::mremap(self.base, self.len, self.len, flags, target.base) };
            if moved == target.base {
                return Ok(RemapKind::Moved);
            }
            let err = Error::last_os_error();
            // EINVAL before 5.7, EPERM for shmem before 5.13.
            if !matches!(err.raw_os_error(), Some(libc::EINVAL | libc::EPERM)) {
                return Err(err);
            }
        }
        // SAFETY: distinct mappings of equal length.
        unsafe { ptr::copy_nonoverlapping(self.ptr(), target.ptr(), self.len) };
        self.discard(0, self.len)?;
        Ok(RemapKind::Copied)
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: `base` came from mmap with this length and is unmapped once.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

// SAFETY: the region is plain memory; synchronising access to its contents
// is up to the owner.
unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
