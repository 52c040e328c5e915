//! Minimal `userfaultfd(2)` wrapper.
//!
//! Only the pieces a page-granular compactor needs: the API handshake, range
//! registration in missing or minor mode, a blocking fault read, and the
//! copy / zeropage / continue / wake ioctls. The kernel ABI structs are
//! declared here because libc does not export them.

use std::io::{self, Error};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const UFFD_API: u64 = 0xAA;
const UFFD_USER_MODE_ONLY: libc::c_int = 1;
const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

const UFFDIO_API: u64 = 0xC018_AA3F;
const UFFDIO_REGISTER: u64 = 0xC020_AA00;
const UFFDIO_UNREGISTER: u64 = 0x8010_AA01;
const UFFDIO_WAKE: u64 = 0x8010_AA02;
const UFFDIO_COPY: u64 = 0xC028_AA03;
const UFFDIO_ZEROPAGE: u64 = 0xC020_AA04;
const UFFDIO_CONTINUE: u64 = 0xC020_AA07;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_MINOR: u64 = 1 << 2;

/// Kernel feature bits negotiated through the API handshake.
pub mod features {
    /// Missing-mode faults on shmem mappings.
    pub const MISSING_SHMEM: u64 = 1 << 5;
    /// Minor-mode faults on shmem mappings.
    pub const MINOR_SHMEM: u64 = 1 << 10;
}

#[repr(C)]
#[derive(Default)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioZeropage {
    range: UffdioRange,
    mode: u64,
    zeropage: i64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioContinue {
    range: UffdioRange,
    mode: u64,
    mapped: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    flags: u64,
    address: u64,
    ptid: u64,
}

/// Registration mode for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fault when a page is not present at all.
    Missing,
    /// Fault when the page is present in the page cache but not mapped.
    Minor,
}

/// Outcome of an install ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    /// The page was installed by this call.
    Installed,
    /// Another thread installed the page first (`EEXIST`).
    AlreadyMapped,
}

/// A single page-fault notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Faulting address (not page aligned).
    pub address: usize,
    /// Raw `uffd_msg.arg.pagefault.flags`.
    pub flags: u64,
}

/// An open userfaultfd descriptor.
#[derive(Debug)]
pub struct Userfaultfd {
    fd: OwnedFd,
    features: u64,
}

impl Userfaultfd {
    /// Opens a userfaultfd and performs the API handshake requesting
    /// `wanted_features`. User-mode-only descriptors are tried first because
    /// they work without `CAP_SYS_PTRACE` on hardened kernels.
    ///
    /// # Errors
    ///
    /// Returns the syscall or ioctl error; `ENOSYS`/`EPERM` mean the facility
    /// is unavailable to this process.
    pub fn open(wanted_features: u64) -> io::Result<Self> {
        let flags = libc::O_CLOEXEC;
        let mut raw = unsafe { libc::syscall(libc::SYS_userfaultfd, flags | UFFD_USER_MODE_ONLY) };
        if raw < 0 && Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
            raw = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
        }
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let mut api = UffdioApi {
            api: UFFD_API,
            features: wanted_features,
            ioctls: 0,
        };
        ioctl(fd.as_raw_fd(), UFFDIO_API, &mut api)?;
        Ok(Self {
            fd,
            features: api.features,
        })
    }

    /// Probes which of `wanted_features` the kernel supports. A descriptor
    /// can only complete one handshake, so the probe uses a throwaway fd.
    ///
    /// # Errors
    ///
    /// Same as [`Userfaultfd::open`].
    pub fn probe_features(wanted_features: u64) -> io::Result<u64> {
        Self::open(0).map(|fd| fd.features & wanted_features)
    }

    /// Opens a descriptor asking only for the part of `wanted_features` the
    /// kernel offers. Kernels reject unknown feature bits with `EINVAL`, so
    /// optional features must not be requested blindly.
    ///
    /// # Errors
    ///
    /// Same as [`Userfaultfd::open`].
    pub fn open_supported(wanted_features: u64) -> io::Result<Self> {
        let supported = Self::probe_features(wanted_features)?;
        Self::open(supported)
    }

    /// Features granted during the handshake.
    pub const fn features(&self) -> u64 {
        self.features
    }

    /// Registers `[start, start + len)` for fault notification.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error (e.g. `EINVAL` for a mode the mapping type
    /// does not support).
    pub fn register(&self, start: usize, len: usize, mode: RegisterMode) -> io::Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: start as u64,
                len: len as u64,
            },
            mode: match mode {
                RegisterMode::Missing => UFFDIO_REGISTER_MODE_MISSING,
                RegisterMode::Minor => UFFDIO_REGISTER_MODE_MINOR,
            },
            ioctls: 0,
        };
        ioctl(self.fd.as_raw_fd(), UFFDIO_REGISTER, &mut reg)
    }

    /// Unregisters a previously registered range.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error.
    pub fn unregister(&self, start: usize, len: usize) -> io::Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        ioctl(self.fd.as_raw_fd(), UFFDIO_UNREGISTER, &mut range)
    }

    /// Blocks until the next page-fault event. Non-fault events are skipped
    /// and `EINTR` is retried.
    ///
    /// # Errors
    ///
    /// Returns the `read` error.
    pub fn read_event(&self) -> io::Result<FaultEvent> {
        loop {
            let mut msg = std::mem::MaybeUninit::<UffdMsg>::zeroed();
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    msg.as_mut_ptr().cast(),
                    std::mem::size_of::<UffdMsg>(),
                )
            };
            if n < 0 {
                let err = Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            if n as usize != std::mem::size_of::<UffdMsg>() {
                return Err(Error::new(io::ErrorKind::UnexpectedEof, "short uffd_msg read"));
            }
            let msg = unsafe { msg.assume_init() };
            if msg.event == UFFD_EVENT_PAGEFAULT {
                return Ok(FaultEvent {
                    address: msg.address as usize,
                    flags: msg.flags,
                });
            }
        }
    }

    /// Atomically installs `len` bytes from `src` at `dst` and wakes waiters.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes; `dst` must be inside a range
    /// registered in missing mode.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error other than `EEXIST`.
    pub unsafe fn copy(&self, dst: usize, src: *const u8, len: usize) -> io::Result<Install> {
        let mut copy = UffdioCopy {
            dst: dst as u64,
            src: src as u64,
            len: len as u64,
            mode: 0,
            copy: 0,
        };
        install_result(ioctl(self.fd.as_raw_fd(), UFFDIO_COPY, &mut copy))
    }

    /// Installs zero pages over `[dst, dst + len)` and wakes waiters.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error other than `EEXIST`.
    pub fn zeropage(&self, dst: usize, len: usize) -> io::Result<Install> {
        let mut zero = UffdioZeropage {
            range: UffdioRange {
                start: dst as u64,
                len: len as u64,
            },
            mode: 0,
            zeropage: 0,
        };
        install_result(ioctl(self.fd.as_raw_fd(), UFFDIO_ZEROPAGE, &mut zero))
    }

    /// Maps the already-populated page-cache pages of `[dst, dst + len)`.
    /// Contiguous pages can be resolved in one call.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error other than `EEXIST`.
    pub fn continue_range(&self, dst: usize, len: usize) -> io::Result<Install> {
        let mut cont = UffdioContinue {
            range: UffdioRange {
                start: dst as u64,
                len: len as u64,
            },
            mode: 0,
            mapped: 0,
        };
        install_result(ioctl(self.fd.as_raw_fd(), UFFDIO_CONTINUE, &mut cont))
    }

    /// Wakes threads blocked on faults in the range without installing.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error.
    pub fn wake(&self, start: usize, len: usize) -> io::Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        ioctl(self.fd.as_raw_fd(), UFFDIO_WAKE, &mut range)
    }
}

impl AsRawFd for Userfaultfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn install_result(res: io::Result<()>) -> io::Result<Install> {
    match res {
        Ok(()) => Ok(Install::Installed),
        Err(err) if err.raw_os_error() == Some(libc::EEXIST) => Ok(Install::AlreadyMapped),
        Err(err) => Err(err),
    }
}

fn ioctl<T>(fd: RawFd, request: u64, arg: &mut T) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as _, std::ptr::from_mut(arg)) };
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}
