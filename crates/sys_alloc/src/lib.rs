//! Low-level virtual-memory primitives for the compacting collector.
//!
//! Anonymous mappings, page discard, no-copy remapping and (on Linux) a thin
//! `userfaultfd` wrapper. Everything here returns [`std::io::Result`]; policy
//! decisions such as falling back when a kernel feature is missing belong to
//! the caller.

use std::io;

#[cfg(not(unix))]
compile_error!("sys_alloc only supports unix targets");

mod unix;
use unix as os;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod uffd;

pub use os::page_size;

/// How [`Mmap::remap_into`] transferred the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapKind {
    /// Pages were moved by the kernel; the source range is now empty.
    Moved,
    /// The kernel refused the move, so the bytes were copied and the source
    /// range discarded.
    Copied,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Mappings created through
    /// [`MmapOptions::map_anon`] never are.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the address one past the end of the mapping.
    pub fn end(&self) -> usize {
        self.ptr() as usize + self.len()
    }

    /// Releases the physical pages of `[offset, offset + len)`. The range
    /// reads back as zero afterwards.
    ///
    /// # Errors
    ///
    /// Returns the `madvise` error, or `InvalidInput` if the range is out of
    /// bounds.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => self.inner.discard(offset, len),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range out of bounds",
            )),
        }
    }

    /// Moves the contents of this mapping on top of `target`, which must have
    /// the same length. Afterwards this mapping is still mapped but every page
    /// is missing (reads as zero or faults if registered with userfaultfd).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on a length mismatch, or the OS error when both
    /// the move and the copy fallback fail.
    pub fn remap_into(&self, target: &Self) -> io::Result<RemapKind> {
        if self.len() != target.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remap target must have the same length",
            ));
        }
        self.inner.remap_into(&target.inner)
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Builder for anonymous private mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapOptions {
    len: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Starts a zero-length request. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            no_reserve: false,
        }
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Skips swap accounting for the range (`MAP_NORESERVE`), for large
    /// reservations that are only partly touched.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates the mapping. Its pages read as zero until written.
    ///
    /// # Safety
    ///
    /// Raw pointers derived from [`Mmap::ptr`] must not outlive the
    /// returned mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the `mmap` error.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        // SAFETY: the length is non-zero.
        let inner = unsafe { os::MmapInner::reserve(self.len, self.no_reserve)? };
        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn map(len: usize) -> Mmap {
        unsafe { MmapOptions::new().len(len).map_anon().expect("failed to map") }
    }

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = unsafe { MmapOptions::new().map_anon() }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_discard_zeroes_range() {
        let ps = page_size();
        let mmap = map(2 * ps);
        unsafe {
            ptr::write_bytes(mmap.ptr(), 0xAB, 2 * ps);
        }
        mmap.discard(ps, ps).unwrap();
        unsafe {
            assert_eq!(ptr::read_volatile(mmap.ptr()), 0xAB);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(ps)), 0);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(2 * ps - 1)), 0);
        }
    }

    #[test]
    fn test_discard_out_of_bounds() {
        let ps = page_size();
        let mmap = map(ps);
        assert!(mmap.discard(ps, 1).is_err());
        assert!(mmap.discard(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_remap_into_moves_contents() {
        let ps = page_size();
        let source = map(4 * ps);
        let target = map(4 * ps);
        for i in 0..4 {
            unsafe { ptr::write_volatile(source.ptr().add(i * ps), i as u8 + 1) };
        }

        let kind = source.remap_into(&target).unwrap();
        assert!(matches!(kind, RemapKind::Moved | RemapKind::Copied));

        for i in 0..4 {
            unsafe {
                assert_eq!(ptr::read_volatile(target.ptr().add(i * ps)), i as u8 + 1);
                assert_eq!(ptr::read_volatile(source.ptr().add(i * ps)), 0);
            }
        }
    }

    #[test]
    fn test_remap_length_mismatch() {
        let ps = page_size();
        let a = map(ps);
        let b = map(2 * ps);
        assert_eq!(
            a.remap_into(&b).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
