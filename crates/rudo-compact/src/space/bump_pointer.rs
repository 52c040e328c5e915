//! The moving space.
//!
//! A single contiguous arena filled by bumping `end`. Everything below the
//! first TLAB is the *main block*; every TLAB handed out afterwards is
//! recorded as its own block so the collector can walk objects that were
//! allocated after the marking pause without a bitmap:
//!
//! ```text
//! begin                main block end
//!   |  main block         |  tlab 0  |  tlab 1  | ... |   end         limit
//!   +---------------------+----------+----------+-----+----+-----------+
//! ```
//!
//! Inside a block objects are laid out back to back. The first zero header
//! ends the used part of a block; the rest of it reads as zero.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Mmap;

use super::{align_up, reserve};
use crate::accounting::{CardTable, SpaceBitmap};
use crate::error::GcError;
use crate::object::{read_header, OBJECT_ALIGNMENT};

#[derive(Debug, Default)]
struct Blocks {
    main_block_size: usize,
    block_sizes: VecDeque<usize>,
}

/// Bump-pointer arena whose objects the collector slides.
#[derive(Debug)]
pub struct BumpPointerSpace {
    mem: Mmap,
    end: AtomicUsize,
    blocks: Mutex<Blocks>,
    mark_bitmap: SpaceBitmap,
    cards: CardTable,
}

impl BumpPointerSpace {
    /// Reserves `capacity` bytes, rounded up to whole pages.
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
            blocks: Mutex::new(Blocks::default()),
            mark_bitmap: SpaceBitmap::new("moving space mark", begin, len),
            cards: CardTable::new(begin, len),
            mem,
        })
    }

    /// First address of the space.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> usize {
        self.mem.ptr() as usize
    }

    /// One past the last reservable address.
    #[inline]
    #[must_use]
    pub fn limit(&self) -> usize {
        self.mem.end()
    }

    /// Reserved bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Current bump pointer.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn size(&self) -> usize {
        self.end() - self.begin()
    }

    /// `true` if `addr` lies inside the reservation.
    #[inline]
    #[must_use]
    pub fn has_address(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.begin()) < self.capacity()
    }

    /// Object-start bitmap. Marking records marked objects here; during the
    /// compaction pause it also records objects of TLABs that start in the
    /// middle of a page.
    #[must_use]
    pub const fn mark_bitmap(&self) -> &SpaceBitmap {
        &self.mark_bitmap
    }

    /// Card table for the write barrier.
    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    pub(crate) const fn mem(&self) -> &Mmap {
        &self.mem
    }

    /// Carves a new block of `bytes` off the end of the space. Returns its
    /// start, or `None` if the space is exhausted.
    pub fn alloc_tlab(&self, bytes: usize) -> Option<usize> {
        let bytes = align_up(bytes, OBJECT_ALIGNMENT);
        let mut blocks = self.blocks.lock();
        let end = self.end.load(Ordering::Relaxed);
        if bytes > self.limit() - end {
            return None;
        }
        if blocks.block_sizes.is_empty() {
            blocks.main_block_size = end - self.begin();
        }
        blocks.block_sizes.push_back(bytes);
        self.end.store(end + bytes, Ordering::Release);
        Some(end)
    }

    /// Pads the last block so `end` becomes a multiple of `alignment`, and
    /// returns the new end.
    pub fn align_end(&self, alignment: usize) -> usize {
        let mut blocks = self.blocks.lock();
        let end = self.end.load(Ordering::Relaxed);
        let aligned = align_up(end, alignment).min(self.limit());
        let diff = aligned - end;
        if diff > 0 {
            self.end.store(aligned, Ordering::Release);
            match blocks.block_sizes.back_mut() {
                Some(last) => *last += diff,
                None => blocks.main_block_size = aligned - self.begin(),
            }
        }
        aligned
    }

    /// Snapshot of the block layout: the main block size and, if any TLAB
    /// was handed out, the sizes of the blocks that follow it.
    #[must_use]
    pub fn block_sizes(&self) -> (usize, Option<Vec<usize>>) {
        let blocks = self.blocks.lock();
        if blocks.block_sizes.is_empty() {
            (self.end.load(Ordering::Relaxed) - self.begin(), None)
        } else {
            (
                blocks.main_block_size,
                Some(blocks.block_sizes.iter().copied().collect()),
            )
        }
    }

    /// Replaces the main block and drops the first `consumed` blocks, which
    /// the caller has merged into it. `end` is recomputed from the result.
    pub fn set_block_sizes(&self, main_block_size: usize, consumed: usize) {
        let mut blocks = self.blocks.lock();
        blocks.main_block_size = main_block_size;
        let consumed = consumed.min(blocks.block_sizes.len());
        blocks.block_sizes.drain(..consumed);
        let size = main_block_size + blocks.block_sizes.iter().sum::<usize>();
        debug_assert_eq!(size % OBJECT_ALIGNMENT, 0);
        self.end.store(self.begin() + size, Ordering::Release);
    }

    /// Calls `visitor(addr, size)` for every object, block by block.
    ///
    /// # Safety
    ///
    /// No thread may allocate concurrently and every page up to `end` must
    /// be readable without a fault.
    pub unsafe fn walk(&self, mut visitor: impl FnMut(usize, usize)) {
        let (main, blocks) = self.block_sizes();
        let mut block_begin = self.begin();
        let mut walk_block = |begin: usize, end: usize| {
            let mut addr = begin;
            while addr < end {
                // SAFETY: `addr` is inside the used part of the space.
                let header = unsafe { read_header(addr) };
                if header.is_null() {
                    break;
                }
                visitor(addr, header.size());
                addr += align_up(header.size(), OBJECT_ALIGNMENT);
            }
        };
        walk_block(block_begin, block_begin + main);
        block_begin += main;
        for size in blocks.unwrap_or_default() {
            walk_block(block_begin, block_begin + size);
            block_begin += size;
        }
    }

    /// Returns the pages past the page-aligned end to the kernel.
    pub(crate) fn release_tail(&self) -> io::Result<()> {
        let _blocks = self.blocks.lock();
        let tail = align_up(self.end.load(Ordering::Relaxed), sys_alloc::page_size());
        let offset = tail - self.begin();
        self.mem.discard(offset, self.capacity() - offset)
    }
}
