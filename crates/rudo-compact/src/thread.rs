//! Mutator thread registry, checkpoints and suspension.
//!
//! A mutator is *runnable* while it holds the shared side of the mutator
//! lock and *native* otherwise. The collector reaches every thread in one of
//! two ways:
//!
//! - [`ThreadList::run_checkpoint`] runs a closure on behalf of each thread:
//!   immediately for native threads, or at the thread's next safepoint for
//!   runnable ones. Every run passes a shared [`Barrier`].
//! - [`ThreadList::suspend_all`] takes the mutator lock exclusively, which
//!   waits for every runnable thread to leave its runnable section.
//!
//! # Lock Ordering
//!
//! `MutatorLock` (1) is taken before `ThreadListLock` (3). A thread's own
//! control-block lock is untracked; checkpoint closures run under it and may
//! only take `MarkStackLock` (4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};

use crate::heap::Heap;
use crate::sync::{LockGuard, LockOrder};

/// Work run on behalf of a mutator thread.
pub type Checkpoint = Arc<dyn Fn(&Heap, &mut ThreadData) + Send + Sync>;

// ============================================================================
// Barrier
// ============================================================================

/// Counting barrier used to wait for checkpoint completion.
///
/// The count may go negative: threads can pass before the waiter has added
/// the number of expected passes.
#[derive(Debug, Default)]
pub struct Barrier {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Barrier {
    /// Creates a barrier with the given count.
    #[must_use]
    pub const fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Resets the count.
    pub fn init(&self, count: isize) {
        *self.count.lock() = count;
    }

    /// Decrements the count, waking the waiter when it reaches zero.
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Adds `delta` and blocks until the count drops to zero.
    pub fn increment(&self, delta: isize) {
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> isize {
        *self.count.lock()
    }
}

// ============================================================================
// Per-thread data
// ============================================================================

/// Thread-local allocation buffer inside the moving space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tlab {
    /// First byte of the buffer.
    pub start: usize,
    /// Next free byte.
    pub pos: usize,
    /// One past the last byte.
    pub end: usize,
}

impl Tlab {
    /// Bumps `pos` by `size`, returning the old position.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        if size <= self.end - self.pos {
            let addr = self.pos;
            self.pos += size;
            Some(addr)
        } else {
            None
        }
    }

    /// `true` when no buffer is installed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Moves the buffer down by `diff` bytes.
    pub fn slide(&mut self, diff: usize) {
        self.start -= diff;
        self.pos -= diff;
        self.end -= diff;
    }

    /// Drops the buffer. Its unused tail stays zero.
    pub fn revoke(&mut self) {
        *self = Self::default();
    }
}

/// Everything the collector may touch on behalf of a thread.
#[derive(Debug, Default)]
pub struct ThreadData {
    /// Root slots, each an object address or 0.
    pub roots: Vec<usize>,
    /// Current TLAB.
    pub tlab: Tlab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Runnable,
    Native,
}

struct ThreadShared {
    state: ThreadState,
    data: ThreadData,
    pending: Vec<Checkpoint>,
}

/// Registry entry of one mutator thread.
pub(crate) struct ThreadControlBlock {
    id: u64,
    shared: Mutex<ThreadShared>,
}

impl ThreadControlBlock {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Runs `f` on this thread's data. Only the owning thread, or the
    /// collector while every thread is suspended, may call this.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&mut ThreadData) -> R) -> R {
        f(&mut self.shared.lock().data)
    }

    fn run_pending(&self, heap: &Heap) {
        let mut shared = self.shared.lock();
        let pending = std::mem::take(&mut shared.pending);
        for checkpoint in pending {
            checkpoint(heap, &mut shared.data);
        }
    }
}

impl std::fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControlBlock").field("id", &self.id).finish()
    }
}

// ============================================================================
// ThreadList
// ============================================================================

/// Registry of mutator threads plus the mutator lock.
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Mutex<Vec<Arc<ThreadControlBlock>>>,
    mutator_lock: RwLock<()>,
    suspend_requested: AtomicBool,
    next_id: AtomicU64,
}

/// Proof that every mutator is suspended. Resumes them on drop.
#[must_use = "mutators resume as soon as the guard is dropped"]
pub struct SuspendAll<'a> {
    // Field order matters: the lock is released before the order record.
    _guard: RwLockWriteGuard<'a, ()>,
    _order: LockGuard,
}

impl ThreadList {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// `true` when no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    pub(crate) fn register(&self) -> Arc<ThreadControlBlock> {
        let tcb = Arc::new(ThreadControlBlock {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shared: Mutex::new(ThreadShared {
                state: ThreadState::Native,
                data: ThreadData::default(),
                pending: Vec::new(),
            }),
        });
        let _order = LockGuard::new(LockOrder::ThreadListLock);
        self.threads.lock().push(Arc::clone(&tcb));
        tcb
    }

    /// Removes a native thread, first running anything still queued for it.
    pub(crate) fn unregister(&self, heap: &Heap, tcb: &Arc<ThreadControlBlock>) {
        let _order = LockGuard::new(LockOrder::ThreadListLock);
        let mut threads = self.threads.lock();
        tcb.run_pending(heap);
        threads.retain(|t| !Arc::ptr_eq(t, tcb));
    }

    /// Enters the runnable state: blocks while a suspension is in progress.
    pub(crate) fn transition_to_runnable(&self, tcb: &ThreadControlBlock) -> LockGuard {
        let order = LockGuard::new(LockOrder::MutatorLock);
        std::mem::forget(self.mutator_lock.read());
        tcb.shared.lock().state = ThreadState::Runnable;
        order
    }

    /// Leaves the runnable state after running queued checkpoints.
    ///
    /// # Safety
    ///
    /// Must pair with a preceding [`ThreadList::transition_to_runnable`] on
    /// the same thread.
    pub(crate) unsafe fn transition_to_native(&self, heap: &Heap, tcb: &ThreadControlBlock) {
        {
            let mut shared = tcb.shared.lock();
            let pending = std::mem::take(&mut shared.pending);
            for checkpoint in pending {
                checkpoint(heap, &mut shared.data);
            }
            shared.state = ThreadState::Native;
        }
        // SAFETY: the shared lock was leaked by `transition_to_runnable`.
        unsafe { self.mutator_lock.force_unlock_read() };
    }

    /// Runs queued checkpoints and, if a suspension is pending, lets it
    /// proceed before returning. The caller must be runnable.
    pub(crate) fn safepoint(&self, heap: &Heap, tcb: &ThreadControlBlock) {
        tcb.run_pending(heap);
        if self.suspend_requested.load(Ordering::Acquire) {
            tcb.shared.lock().state = ThreadState::Native;
            // SAFETY: the caller is runnable, so it holds one leaked read
            // lock which is re-acquired right away.
            unsafe { self.mutator_lock.force_unlock_read() };
            std::mem::forget(self.mutator_lock.read());
            tcb.shared.lock().state = ThreadState::Runnable;
        }
    }

    /// Runs `checkpoint` for every thread: native threads right away on the
    /// calling thread, runnable threads at their next safepoint. Returns the
    /// number of threads the checkpoint was run or queued for, each of which
    /// passes the caller's barrier once.
    pub fn run_checkpoint(&self, heap: &Heap, checkpoint: &Checkpoint) -> usize {
        let _order = LockGuard::new(LockOrder::ThreadListLock);
        let threads = self.threads.lock();
        for tcb in threads.iter() {
            let mut shared = tcb.shared.lock();
            match shared.state {
                ThreadState::Native => checkpoint(heap, &mut shared.data),
                ThreadState::Runnable => shared.pending.push(Arc::clone(checkpoint)),
            }
        }
        threads.len()
    }

    /// Suspends every mutator. They resume when the guard is dropped.
    pub fn suspend_all(&self) -> SuspendAll<'_> {
        let order = LockGuard::new(LockOrder::MutatorLock);
        self.suspend_requested.store(true, Ordering::Release);
        let guard = self.mutator_lock.write();
        self.suspend_requested.store(false, Ordering::Release);
        SuspendAll {
            _guard: guard,
            _order: order,
        }
    }

    /// Calls `visitor` on every thread's data.
    pub fn for_each_thread(&self, _suspended: &SuspendAll<'_>, mut visitor: impl FnMut(&mut ThreadData)) {
        let _order = LockGuard::new(LockOrder::ThreadListLock);
        for tcb in self.threads.lock().iter() {
            tcb.with_data(&mut visitor);
        }
    }

    /// Suspends every mutator, runs `pause` and then `thread_visitor` on
    /// each thread, and resumes them. Returns what `pause` returned.
    pub fn flip_thread_roots<R>(
        &self,
        thread_visitor: impl FnMut(&mut ThreadData),
        pause: impl FnOnce(&SuspendAll<'_>) -> R,
    ) -> R {
        let suspended = self.suspend_all();
        let result = pause(&suspended);
        self.for_each_thread(&suspended, thread_visitor);
        result
    }
}
