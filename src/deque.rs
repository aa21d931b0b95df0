//! The work-stealing deque owned by each worker: single-owner push/pop at
//! the bottom, multi-thief steal at the top. This is the Chase–Lev deque
//! ("Dynamic Circular Work-Stealing Deque") with dynamic growth; buffers
//! replaced by growth are retired, not freed, because a thief may still be
//! reading from one. Retired buffers die with the deque.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::handle::{Queued, TaskLifetime};

/// Initial capacity of a worker deque. Must be a power of two.
const DEFAULT_CAPACITY: u64 = 512;
/// Growth factor when the ring fills.
const GROWTH: u64 = 4;

/// Power-of-two ring of queue entries. Positions are taken modulo the
/// capacity, so the live window `[top, bottom)` may wrap.
struct RingBuffer {
    capacity: u64,
    mask: u64,
    slots: Box<[UnsafeCell<Queued>]>,
}

impl RingBuffer {
    fn alloc(capacity: u64) -> *mut RingBuffer {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| UnsafeCell::new(Queued::noop())).collect();
        Box::into_raw(Box::new(RingBuffer {
            capacity,
            mask: capacity - 1,
            slots,
        }))
    }

    /// # Safety
    ///
    /// Owner-only, and the slot at `pos` must not hold a live entry a thief
    /// could still win.
    unsafe fn put(&self, pos: u64, entry: Queued) {
        unsafe { *self.slots[(pos & self.mask) as usize].get() = entry };
    }

    /// # Safety
    ///
    /// The read may race an owner overwrite and return a stale entry; the
    /// caller must validate it (via the `top` CAS) before using it.
    unsafe fn get(&self, pos: u64) -> Queued {
        unsafe { *self.slots[(pos & self.mask) as usize].get() }
    }
}

// SAFETY: slots are plain cells; the deque protocol (CAS-validated reads,
// single-owner writes) is what keeps their use sound.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

pub(crate) struct Deque {
    top: CachePadded<AtomicU64>,
    bottom: CachePadded<AtomicU64>,
    buffer: AtomicPtr<RingBuffer>,
    /// Buffers replaced by growth. Owner-only; freed on drop.
    retired: UnsafeCell<Vec<*mut RingBuffer>>,
}

// SAFETY: `bottom`, `retired`, and buffer replacement are owner-only;
// thieves only CAS `top` and read slots, and a stale slot read is discarded
// when the CAS fails.
unsafe impl Send for Deque {}
unsafe impl Sync for Deque {}

impl Deque {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: u64) -> Self {
        Deque {
            top: CachePadded::new(AtomicU64::new(1)),
            bottom: CachePadded::new(AtomicU64::new(1)),
            buffer: AtomicPtr::new(RingBuffer::alloc(capacity)),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Push onto the bottom end. Owner-only.
    pub(crate) fn push_bottom(&self, entry: Queued) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // SAFETY: only the owner replaces the buffer pointer.
        if b - t >= unsafe { (*buffer).capacity } {
            buffer = self.grow(buffer, t, b);
        }

        // SAFETY: position `b` is outside the live window until the release
        // store below publishes it.
        unsafe { (*buffer).put(b, entry) };
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// Replace the full buffer with one `GROWTH` times larger, keeping the
    /// old one alive for thieves that still hold its pointer.
    fn grow(&self, old: *mut RingBuffer, top: u64, bottom: u64) -> *mut RingBuffer {
        // SAFETY: owner-only; thieves never dereference `retired`.
        let grown = unsafe {
            let grown = RingBuffer::alloc((*old).capacity * GROWTH);
            for i in top..bottom {
                (*grown).put(i, (*old).get(i));
            }
            (*self.retired.get()).push(old);
            grown
        };
        self.buffer.store(grown, Ordering::Relaxed);
        grown
    }

    /// Pop from the bottom end. Owner-only. On the last element this races
    /// the thieves through a CAS on `top`; exactly one side wins.
    pub(crate) fn pop_bottom(&self) -> Option<Queued> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // empty; undo the speculative decrement
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `b` is below the published bottom, so no owner write can
        // land there; thieves past `t == b` are excluded by the CAS below.
        let entry = unsafe { (*buffer).get(b) };
        if t == b {
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // a thief got the last element first
                self.bottom.store(b + 1, Ordering::Relaxed);
                return None;
            }
            self.bottom.store(b + 1, Ordering::Relaxed);
        }
        Some(entry)
    }

    /// Steal from the top end. Any thread.
    pub(crate) fn steal(&self) -> Option<Queued> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t < b {
            // SAFETY: the entry may be stale if the owner wrapped past us;
            // the CAS on `top` rejects exactly that case.
            let buffer = self.buffer.load(Ordering::Acquire);
            let entry = unsafe { (*buffer).get(t) };
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            return Some(entry);
        }
        None
    }

    #[cfg(test)]
    fn capacity(&self) -> u64 {
        // SAFETY: the pointer is always valid; the value may be stale off
        // the owner thread.
        unsafe { (*self.buffer.load(Ordering::Relaxed)).capacity }
    }

    #[cfg(test)]
    fn retired_buffers(&self) -> usize {
        // SAFETY: test-only, called with no concurrent owner.
        unsafe { (*self.retired.get()).len() }
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the pool joins its workers before the
        // deques die.
        unsafe {
            for old in (*self.retired.get()).drain(..) {
                drop(Box::from_raw(old));
            }

            // Whatever is still queued is discarded work. The pool owns the
            // pool-managed frames; scope-managed frames belong to a live
            // owner above us and must be left alone.
            let buffer = self.buffer.load(Ordering::Relaxed);
            let t = self.top.load(Ordering::Relaxed);
            let b = self.bottom.load(Ordering::Relaxed);
            for i in t..b {
                let entry = (*buffer).get(i);
                if entry.lifetime == TaskLifetime::PoolManaged {
                    entry.handle.destroy();
                }
            }
            drop(Box::from_raw(buffer));
        }
    }
}
