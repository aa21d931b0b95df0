use std::ptr;

/// Who destroys a frame that is still sitting in a queue when the pool
/// discards work at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskLifetime {
    /// A live owner above the pool (a `Task`, an awaitable, or a start
    /// handle) frees the frame; the pool must never touch it.
    ScopeManaged,
    /// The pool frees the frame if the work is discarded before running.
    PoolManaged,
    /// The noop sentinel; there is nothing to free.
    Noop,
}

/// Operations on a type-erased frame.
pub(crate) struct FrameVtable {
    /// Advance the frame to its next suspension point and return the frame
    /// to run next. Returning the noop handle hands control back to the
    /// worker loop; returning anything else is a symmetric transfer.
    pub(crate) resume: unsafe fn(*const ()) -> RawHandle,
    /// Free the frame. Only valid while no other handle to it is in use.
    pub(crate) destroy: unsafe fn(*const ()),
    /// Record the frame to resume after this one finishes. Only task frames
    /// support this; internal frames wire their hand-off through a barrier.
    pub(crate) set_continuation: unsafe fn(*const (), RawHandle),
    /// Whether the frame has reached its final suspension.
    pub(crate) is_finished: unsafe fn(*const ()) -> bool,
}

unsafe fn noop_resume(_ptr: *const ()) -> RawHandle {
    RawHandle::noop()
}

unsafe fn noop_destroy(_ptr: *const ()) {}

unsafe fn noop_set_continuation(_ptr: *const (), _continuation: RawHandle) {}

unsafe fn noop_is_finished(_ptr: *const ()) -> bool {
    true
}

static NOOP_VTABLE: FrameVtable = FrameVtable {
    resume: noop_resume,
    destroy: noop_destroy,
    set_continuation: noop_set_continuation,
    is_finished: noop_is_finished,
};

/// Type-erased pointer to a heap-allocated frame. A null data pointer is the
/// noop sentinel: resuming it does nothing, which makes it both the default
/// continuation ("return to the scheduler loop") and the idle result of an
/// empty work queue.
#[derive(Clone, Copy)]
pub(crate) struct RawHandle {
    ptr: *const (),
    vtable: &'static FrameVtable,
}

// SAFETY: a handle is just an address plus a vtable; the frames it points to
// are only ever advanced by one thread at a time (whichever worker popped or
// stole the handle), and cross-thread visibility of their contents is
// provided by the queue and barrier orderings.
unsafe impl Send for RawHandle {}

impl RawHandle {
    pub(crate) fn new(ptr: *const (), vtable: &'static FrameVtable) -> Self {
        RawHandle { ptr, vtable }
    }

    pub(crate) fn noop() -> Self {
        RawHandle {
            ptr: ptr::null(),
            vtable: &NOOP_VTABLE,
        }
    }

    pub(crate) fn is_noop(self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) fn ptr(self) -> *const () {
        self.ptr
    }

    /// # Safety
    ///
    /// The frame must be live and not currently running on another thread.
    pub(crate) unsafe fn resume(self) -> RawHandle {
        unsafe { (self.vtable.resume)(self.ptr) }
    }

    /// # Safety
    ///
    /// The caller must own the frame and no other handle to it may be used
    /// afterwards.
    pub(crate) unsafe fn destroy(self) {
        unsafe { (self.vtable.destroy)(self.ptr) }
    }

    /// # Safety
    ///
    /// The frame must be live and must be a task frame.
    pub(crate) unsafe fn set_continuation(self, continuation: RawHandle) {
        unsafe { (self.vtable.set_continuation)(self.ptr, continuation) }
    }

    /// # Safety
    ///
    /// The frame must be live.
    pub(crate) unsafe fn is_finished(self) -> bool {
        unsafe { (self.vtable.is_finished)(self.ptr) }
    }

    /// A handle carrying an arbitrary pointer payload on the noop vtable,
    /// for queue tests that only care about entry identity.
    #[cfg(test)]
    pub(crate) fn fake(tag: usize) -> Self {
        RawHandle {
            ptr: tag as *const (),
            vtable: &NOOP_VTABLE,
        }
    }

    #[cfg(test)]
    pub(crate) fn tag(self) -> usize {
        self.ptr as usize
    }
}

/// What the deques and the intake queue carry: a frame handle tagged with
/// who is responsible for the frame if the work is discarded.
#[derive(Clone, Copy)]
pub(crate) struct Queued {
    pub(crate) handle: RawHandle,
    pub(crate) lifetime: TaskLifetime,
}

impl Queued {
    pub(crate) fn noop() -> Self {
        Queued {
            handle: RawHandle::noop(),
            lifetime: TaskLifetime::Noop,
        }
    }
}
