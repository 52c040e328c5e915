//! Errors and fatal diagnostics.
//!
//! Only heap construction, allocation and API misuse return [`GcError`].
//! Inside a collection cycle nothing is recoverable: a failure either is a
//! benign race that the caller tolerates, or ends in [`fatal`].

use std::fmt;
use std::io;

/// Error returned by the heap's public API.
#[derive(Debug)]
pub enum GcError {
    /// Reserving or mapping memory failed.
    Map(io::Error),
    /// A space has no room left for the request.
    OutOfMemory {
        /// Name of the exhausted space.
        space: &'static str,
        /// Bytes requested.
        requested: usize,
    },
    /// The operation is not allowed in the heap's current state.
    Unsupported(&'static str),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(err) => write!(f, "failed to map heap memory: {err}"),
            Self::OutOfMemory { space, requested } => {
                write!(f, "{space} space exhausted allocating {requested} bytes")
            }
            Self::Unsupported(what) => write!(f, "unsupported operation: {what}"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GcError {
    fn from(err: io::Error) -> Self {
        Self::Map(err)
    }
}

pub mod fatal {
    //! Aborting error paths.

    use std::fmt;

    use crate::tracing::internal;

    /// Bounds of one space, for corruption reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpaceExtent {
        /// Space name.
        pub name: &'static str,
        /// First address.
        pub begin: usize,
        /// One past the last address in use.
        pub end: usize,
    }

    /// Everything known about a reference that points nowhere.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CorruptionReport {
        /// What was being done when the bad value was found.
        pub context: &'static str,
        /// Object holding the reference, if it came from a heap slot.
        pub holder: Option<usize>,
        /// Byte offset of the slot inside `holder`.
        pub offset: usize,
        /// The offending value.
        pub reference: usize,
        /// Every space known to the heap.
        pub spaces: Vec<SpaceExtent>,
        /// Words around `holder` as `(address, value)`.
        pub words: Vec<(usize, u64)>,
    }

    impl CorruptionReport {
        /// Starts a report with no memory dump.
        #[must_use]
        pub const fn new(context: &'static str, reference: usize) -> Self {
            Self {
                context,
                holder: None,
                offset: 0,
                reference,
                spaces: Vec::new(),
                words: Vec::new(),
            }
        }

        /// Records the holder and dumps up to `radius` words on each side of
        /// it that fall inside a known space.
        ///
        /// # Safety
        ///
        /// Every address inside the listed spaces must be readable.
        #[must_use]
        pub unsafe fn with_holder(mut self, holder: usize, offset: usize, radius: usize) -> Self {
            self.holder = Some(holder);
            self.offset = offset;
            let from = holder.saturating_sub(radius * 8);
            let to = holder.saturating_add(radius * 8);
            let mut addr = from & !7;
            while addr <= to {
                if self.spaces.iter().any(|s| addr >= s.begin && addr < s.end) {
                    let value = unsafe { std::ptr::read_volatile(addr as *const u64) };
                    self.words.push((addr, value));
                }
                addr += 8;
            }
            self
        }

        /// Adds space bounds.
        #[must_use]
        pub fn with_spaces(mut self, spaces: impl IntoIterator<Item = SpaceExtent>) -> Self {
            self.spaces.extend(spaces);
            self
        }
    }

    impl fmt::Display for CorruptionReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "heap corruption during {}: reference {:#x}", self.context, self.reference)?;
            if let Some(holder) = self.holder {
                write!(f, " in slot +{} of object {holder:#x}", self.offset)?;
            }
            for space in &self.spaces {
                write!(f, "\n  {:<12} [{:#x}, {:#x})", space.name, space.begin, space.end)?;
            }
            for (addr, value) in &self.words {
                let marker = if Some(*addr) == self.holder { ">" } else { " " };
                write!(f, "\n {marker}{addr:#014x}: {value:#018x}")?;
            }
            Ok(())
        }
    }

    /// Logs the report and aborts.
    #[cold]
    pub fn heap_corruption(report: &CorruptionReport) -> ! {
        internal::fatal(&report.to_string());
        std::process::abort()
    }

    /// Logs a failed scratch-memory request and aborts.
    #[cold]
    pub fn resource_exhausted(what: &str, err: &dyn std::error::Error) -> ! {
        internal::fatal(&format!("cannot continue compaction, {what}: {err}"));
        std::process::abort()
    }

    /// Logs an impossible page-state observation and aborts.
    #[cold]
    pub fn bad_page_state(page: usize, state: u8, context: &str) -> ! {
        internal::fatal(&format!("page {page} in unexpected state {state} while {context}"));
        std::process::abort()
    }
}
