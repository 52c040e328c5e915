//! Immune space: objects created at heap bring-up.
//!
//! Never collected and always considered marked. References out of it are
//! found through dirty cards, which the mod-union table keeps across cycles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sys_alloc::Mmap;

use super::{align_up, reserve};
use crate::accounting::{CardTable, ModUnionTable, SpaceBitmap};
use crate::error::GcError;
use crate::object::OBJECT_ALIGNMENT;

/// Boot-image stand-in.
#[derive(Debug)]
pub struct ImmuneSpace {
    mem: Mmap,
    end: AtomicUsize,
    live: SpaceBitmap,
    cards: CardTable,
    mod_union: ModUnionTable,
    sealed: AtomicBool,
}

impl ImmuneSpace {
    /// Reserves `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Map`] if the reservation fails.
    pub fn new(capacity: usize) -> Result<Self, GcError> {
        let mem = reserve(capacity)?;
        let begin = mem.ptr() as usize;
        let len = mem.len();
        Ok(Self {
            end: AtomicUsize::new(begin),
            live: SpaceBitmap::new("immune live", begin, len),
            cards: CardTable::new(begin, len),
            mod_union: ModUnionTable::new(begin, begin + len),
            sealed: AtomicBool::new(false),
            mem,
        })
    }

    /// First address of the space.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> usize {
        self.mem.ptr() as usize
    }

    /// One past the last allocated byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// `true` if `addr` lies inside the reservation.
    #[inline]
    #[must_use]
    pub fn has_address(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.begin()) < self.mem.len()
    }

    /// Every object of the space.
    #[must_use]
    pub const fn live_bitmap(&self) -> &SpaceBitmap {
        &self.live
    }

    /// Card table for the write barrier.
    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Cards holding references out of the space.
    #[must_use]
    pub const fn mod_union(&self) -> &ModUnionTable {
        &self.mod_union
    }

    /// Stops further allocation. Called when the first cycle starts.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Allocates `bytes` of zeroed memory.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Unsupported`] once sealed and
    /// [`GcError::OutOfMemory`] when the space is full.
    pub fn alloc(&self, bytes: usize) -> Result<usize, GcError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(GcError::Unsupported(
                "immune allocation after the first collection",
            ));
        }
        let bytes = align_up(bytes, OBJECT_ALIGNMENT);
        let limit = self.mem.end();
        let addr = self
            .end
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |end| {
                (bytes <= limit - end).then_some(end + bytes)
            })
            .map_err(|_| GcError::OutOfMemory {
                space: "immune",
                requested: bytes,
            })?;
        self.live.set(addr);
        Ok(addr)
    }
}
