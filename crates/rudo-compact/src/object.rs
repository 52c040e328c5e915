//! Object layout.
//!
//! Every object starts with one header word followed by its reference slots
//! and then opaque payload words:
//!
//! ```text
//! +----------------------+------------------+-----------------+
//! | header (size|n|kind) | n reference slots | payload words  |
//! +----------------------+------------------+-----------------+
//! ```
//!
//! A header of zero is never a valid object. Inside a TLAB it marks the end
//! of the used portion, which the collector relies on when walking blocks
//! allocated after the marking pause.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every object, in bytes.
pub const OBJECT_ALIGNMENT: usize = 8;
/// Size of the header word.
pub const HEADER_SIZE: usize = 8;
/// Size of a reference slot.
pub const REF_SIZE: usize = 8;

const SIZE_MASK: u64 = 0xFFFF_FFFF;
const REFS_SHIFT: u32 = 32;
const REFS_MASK: u64 = 0xFFFF;
const KIND_SHIFT: u32 = 48;

/// Rounds `value` up to the object alignment.
#[inline]
pub const fn align_object(value: usize) -> usize {
    (value + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// What the collector should do with slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// All slots are strong.
    Plain = 0,
    /// Slot 0 is a weak referent handed to the reference processor.
    WeakReference = 1,
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(u64);

impl Header {
    /// Encodes a header. `size` must already be aligned and cover the header
    /// and all slots.
    #[must_use]
    pub const fn new(size: usize, num_refs: usize, kind: ObjectKind) -> Self {
        Self(
            (size as u64 & SIZE_MASK)
                | ((num_refs as u64 & REFS_MASK) << REFS_SHIFT)
                | ((kind as u64) << KIND_SHIFT),
        )
    }

    /// Wraps a raw header word.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw header word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// `true` for the TLAB end marker.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Object size in bytes, including the header.
    #[must_use]
    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    /// Number of reference slots.
    #[must_use]
    pub const fn num_refs(self) -> usize {
        ((self.0 >> REFS_SHIFT) & REFS_MASK) as usize
    }

    /// Object kind.
    #[must_use]
    pub const fn kind(self) -> ObjectKind {
        if (self.0 >> KIND_SHIFT) & 0xFF == ObjectKind::WeakReference as u64 {
            ObjectKind::WeakReference
        } else {
            ObjectKind::Plain
        }
    }
}

/// Size in bytes of an object with the given shape.
#[must_use]
pub const fn object_size(num_refs: usize, payload_words: usize) -> usize {
    HEADER_SIZE + REF_SIZE * num_refs + 8 * payload_words
}

/// Byte offset of reference slot `index` from the object start.
#[must_use]
pub const fn slot_offset(index: usize) -> usize {
    HEADER_SIZE + REF_SIZE * index
}

/// A reference to a heap object: its non-null, aligned start address.
///
/// `ObjRef` does not keep anything alive. The collector moves objects, so an
/// `ObjRef` held outside a root slot goes stale at the next compaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// Wraps a raw address. Returns `None` for null.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// The object's start address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Wraps the address of a fresh allocation.
    ///
    /// # Safety
    ///
    /// `addr` must not be zero.
    pub(crate) const unsafe fn new_unchecked(addr: usize) -> Self {
        // SAFETY: guaranteed by the caller.
        Self(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    /// Converts an optional reference to its slot encoding.
    #[must_use]
    pub const fn to_slot(this: Option<Self>) -> usize {
        match this {
            Some(r) => r.addr(),
            None => 0,
        }
    }

    /// Total size in bytes, header included.
    ///
    /// # Safety
    ///
    /// The object's page must be readable.
    #[must_use]
    pub unsafe fn size(self) -> usize {
        unsafe { read_header(self.addr()) }.size()
    }

    /// Number of reference slots.
    ///
    /// # Safety
    ///
    /// As for [`ObjRef::size`].
    #[must_use]
    pub unsafe fn num_refs(self) -> usize {
        unsafe { read_header(self.addr()) }.num_refs()
    }

    /// # Safety
    ///
    /// As for [`ObjRef::size`].
    #[must_use]
    pub unsafe fn kind(self) -> ObjectKind {
        unsafe { read_header(self.addr()) }.kind()
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// Reads the header word at `addr`.
///
/// # Safety
///
/// `addr` must be readable and 8-byte aligned.
#[inline]
#[must_use]
pub unsafe fn read_header(addr: usize) -> Header {
    Header(unsafe { (*(addr as *const AtomicUsize)).load(Ordering::Acquire) } as u64)
}

/// Writes a header word. Publication happens through the release store of
/// the first reference to the object.
///
/// # Safety
///
/// `addr` must be writable and 8-byte aligned.
#[inline]
pub unsafe fn write_header(addr: usize, header: Header) {
    unsafe { (*(addr as *const AtomicUsize)).store(header.raw() as usize, Ordering::Relaxed) };
}

/// Loads a reference slot (`0` means null).
///
/// # Safety
///
/// `slot` must be a readable, aligned reference slot.
#[inline]
#[must_use]
pub unsafe fn load_slot(slot: usize) -> usize {
    unsafe { (*(slot as *const AtomicUsize)).load(Ordering::Acquire) }
}

/// Stores a reference slot.
///
/// # Safety
///
/// `slot` must be a writable, aligned reference slot.
#[inline]
pub unsafe fn store_slot(slot: usize, value: usize) {
    unsafe { (*(slot as *const AtomicUsize)).store(value, Ordering::Release) };
}

/// Visits the reference slots of the object whose header lives at
/// `header_addr`, calling `visitor` with each slot's byte offset that falls
/// inside `[begin_offset, end_offset)`. Returns the object size.
///
/// The header may be read from a different copy of the object (for example
/// the from-space snapshot) than the one the visitor writes to; the visitor
/// only receives offsets.
///
/// # Safety
///
/// `header_addr` must point at a valid header.
#[inline]
pub unsafe fn visit_refs_for_compaction(
    header_addr: usize,
    begin_offset: usize,
    end_offset: usize,
    mut visitor: impl FnMut(usize),
) -> usize {
    let header = unsafe { read_header(header_addr) };
    let refs_end = slot_offset(header.num_refs()).min(end_offset);
    let mut offset = if begin_offset <= HEADER_SIZE {
        HEADER_SIZE
    } else {
        // Round up to the next slot boundary.
        align_object(begin_offset)
    };
    while offset < refs_end {
        visitor(offset);
        offset += REF_SIZE;
    }
    header.size()
}
