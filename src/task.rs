use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::handle::{FrameVtable, RawHandle};
use crate::pool::ctx;

/// What a finished task produced: the returned value, or the payload of the
/// panic that escaped the body.
pub type TaskResult<T> = std::thread::Result<T>;

/// The part of a frame the owning [`Task`] reads: the result slot and the
/// continuation to hand control to after final suspension.
///
/// [`Frame`] is `#[repr(C)]` with this as its first field, so once the body
/// type is erased a frame pointer still resolves the result slot through the
/// output type alone.
#[repr(C)]
struct FrameCore<T> {
    /// Frame to resume when this one finishes. Defaults to the noop handle,
    /// which returns control to the worker loop.
    continuation: Cell<RawHandle>,
    /// Written exactly once, at final suspension.
    result: UnsafeCell<Option<TaskResult<T>>>,
}

/// A heap-allocated coroutine frame: suspended body, result slot,
/// continuation. Never moves once allocated.
#[repr(C)]
struct Frame<F: Future> {
    core: FrameCore<F::Output>,
    /// The coroutine state. `None` once the body has finished: locals die at
    /// final suspension while the result slot lives on until the owning
    /// `Task` is dropped.
    body: UnsafeCell<Option<F>>,
}

impl<F: Future> Frame<F> {
    const VTABLE: FrameVtable = FrameVtable {
        resume: Self::resume,
        destroy: Self::destroy,
        set_continuation: Self::set_continuation,
        is_finished: Self::is_finished,
    };

    unsafe fn resume(ptr: *const ()) -> RawHandle {
        let frame = unsafe { &*(ptr as *const Frame<F>) };
        let this = RawHandle::new(ptr, &Self::VTABLE);

        // Make this frame the current one for the duration of the poll, so
        // awaitables inside the body can name it as a continuation.
        let previous = ctx::replace_current_frame(this);

        let polled = {
            // SAFETY: only the thread resuming the frame touches the body,
            // and the frame is heap-allocated and never moves, so pinning
            // the body in place is sound.
            let body = unsafe { &mut *frame.body.get() }
                .as_mut()
                .expect("resumed a task frame that already finished");
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            panic::catch_unwind(AssertUnwindSafe(|| {
                let body = unsafe { Pin::new_unchecked(body) };
                body.poll(&mut cx)
            }))
        };

        ctx::replace_current_frame(previous);

        match polled {
            // The suspension point named where control goes next; the
            // trampoline picks it up from the worker context.
            Ok(Poll::Pending) => ctx::take_transfer(),
            Ok(Poll::Ready(value)) => unsafe { frame.finish(Ok(value)) },
            Err(payload) => unsafe { frame.finish(Err(payload)) },
        }
    }

    /// Store the outcome, drop the body, and hand control to the recorded
    /// continuation. Failures are captured here and never escape `resume`.
    unsafe fn finish(&self, outcome: TaskResult<F::Output>) -> RawHandle {
        // SAFETY: final suspension is reached at most once; nobody reads the
        // slot before the continuation hand-off (or the start latch)
        // publishes it.
        unsafe {
            *self.core.result.get() = Some(outcome);
            *self.body.get() = None;
        }
        self.core.continuation.get()
    }

    unsafe fn destroy(ptr: *const ()) {
        // SAFETY: per the vtable contract the caller owns the frame.
        drop(unsafe { Box::from_raw(ptr as *mut Frame<F>) });
    }

    unsafe fn set_continuation(ptr: *const (), continuation: RawHandle) {
        let frame = unsafe { &*(ptr as *const Frame<F>) };
        frame.core.continuation.set(continuation);
    }

    unsafe fn is_finished(ptr: *const ()) -> bool {
        let frame = unsafe { &*(ptr as *const Frame<F>) };
        // SAFETY: written once at final suspension; callers only ask on the
        // thread that will (or did) run the frame.
        unsafe { (*frame.core.result.get()).is_some() }
    }
}

/// A lazily started computation and the slot its outcome lands in.
///
/// Constructed from an `async` body with [`Task::new`]; the body does not
/// run until the runtime first resumes the frame. A task is move-only and
/// owns its frame exclusively: dropping the task frees the frame, results
/// and all.
///
/// Inside a running task, awaiting [`Task::join`] hands the worker to the
/// child and resumes the parent when the child finishes. Siblings are run in
/// parallel with [`wait_tasks`](crate::wait_tasks) and friends; the parent
/// reads each child's outcome afterwards through the observers here.
/// Failures (panics escaping the body) are captured into the slot, not
/// propagated: `start_sync(&pool, &t)` always returns and `t.error()` tells
/// you what happened.
pub struct Task<T> {
    raw: RawHandle,
    _result: PhantomData<T>,
}

// SAFETY: the frame behind `raw` is advanced by one worker at a time, and
// every cross-thread read of the result slot is ordered after the write by a
// join barrier decrement or the start latch.
unsafe impl<T: Send> Send for Task<T> {}
// SAFETY: `&Task` only exposes the result slot, which is immutable from the
// first moment the owner can observe it as filled.
unsafe impl<T: Send> Sync for Task<T> {}

impl<T: Send + 'static> Task<T> {
    /// Wrap an `async` body into a suspended task frame. The body is not
    /// polled here.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let frame: Box<Frame<F>> = Box::new(Frame {
            core: FrameCore {
                continuation: Cell::new(RawHandle::noop()),
                result: UnsafeCell::new(None),
            },
            body: UnsafeCell::new(Some(body)),
        });
        Task {
            raw: RawHandle::new(Box::into_raw(frame) as *const (), &Frame::<F>::VTABLE),
            _result: PhantomData,
        }
    }
}

impl<T> Task<T> {
    fn core(&self) -> &FrameCore<T> {
        // SAFETY: `raw` points to a live `Frame` whose first (repr(C)) field
        // is a `FrameCore<T>`.
        unsafe { &*(self.raw.ptr() as *const FrameCore<T>) }
    }

    fn result(&self) -> Option<&TaskResult<T>> {
        // SAFETY: see the `Sync` impl; the slot is write-once.
        unsafe { (*self.core().result.get()).as_ref() }
    }

    /// Whether the task has run to completion (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.result().is_some()
    }

    /// Whether the task finished and produced a value.
    pub fn has_value(&self) -> bool {
        matches!(self.result(), Some(Ok(_)))
    }

    /// The produced value, if there is one.
    pub fn output(&self) -> Option<&T> {
        match self.result() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// The produced value.
    ///
    /// Panics if the task has not finished yet, or if it failed; use
    /// [`output`](Self::output) or [`error`](Self::error) for the checked
    /// forms.
    pub fn value(&self) -> &T {
        match self.result() {
            Some(Ok(value)) => value,
            Some(Err(_)) => panic!("task failed; inspect error() instead of value()"),
            None => panic!("task result read before the task finished"),
        }
    }

    /// The captured failure, if the body panicked.
    pub fn error(&self) -> Option<&(dyn Any + Send)> {
        match self.result() {
            Some(Err(payload)) => Some(payload.as_ref()),
            _ => None,
        }
    }

    /// The produced value, or `default` if the task failed or has not
    /// finished.
    pub fn value_or(&self, default: T) -> T
    where
        T: Clone,
    {
        self.output().cloned().unwrap_or(default)
    }

    /// Consume the task and take its outcome out of the frame.
    ///
    /// Panics if the task has not finished.
    pub fn into_result(self) -> TaskResult<T> {
        // SAFETY: exclusive ownership; after this the frame holds no result
        // and is freed without touching it again.
        let result = unsafe { (*self.core().result.get()).take() };
        let result = result.expect("task consumed before it finished");
        unsafe { self.raw.destroy() };
        mem::forget(self);
        result
    }

    /// Awaitable that runs this task on the current worker and resumes the
    /// awaiting task once it finishes. Must be awaited from inside a running
    /// task.
    pub fn join(&self) -> JoinTask<'_, T> {
        JoinTask { task: self }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Give up ownership of the frame without destroying it.
    pub(crate) fn into_raw(self) -> RawHandle {
        let raw = self.raw;
        mem::forget(self);
        raw
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive ownership; any queue entry for this frame was
        // consumed before the owner could have observed completion.
        unsafe { self.raw.destroy() }
    }
}

impl<T> Deref for Task<T> {
    type Target = T;

    /// Unchecked access to the produced value; panics like
    /// [`value`](Task::value) if the task has not finished.
    fn deref(&self) -> &T {
        self.value()
    }
}

/// Awaitable returned by [`Task::join`].
pub struct JoinTask<'a, T> {
    task: &'a Task<T>,
}

impl<T> Future for JoinTask<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.task.is_finished() {
            return Poll::Ready(());
        }
        let parent = ctx::current_frame();
        assert!(
            !parent.is_noop(),
            "tasks can only be awaited from inside a running task"
        );
        let child = self.task.raw();
        // SAFETY: the child is live (borrowed) and suspended; it runs on
        // this worker until it finishes, then transfers back to the parent.
        unsafe { child.set_continuation(parent) };
        ctx::set_transfer(child);
        Poll::Pending
    }
}

const NOOP_WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(noop_raw_waker_clone, noop_wake, noop_wake, noop_wake);

fn noop_raw_waker_clone(_data: *const ()) -> RawWaker {
    RawWaker::new(ptr::null(), &NOOP_WAKER_VTABLE)
}

fn noop_wake(_data: *const ()) {}

/// The runtime resumes frames by continuation hand-off, never through
/// wakers, so the polls get a waker that does nothing.
fn noop_waker() -> Waker {
    // SAFETY: every vtable entry ignores its data pointer.
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &NOOP_WAKER_VTABLE)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a frame on the current thread until control returns to the
    /// (nonexistent) scheduler loop.
    fn run_inline<T>(task: &Task<T>) {
        let mut handle = task.raw();
        while !handle.is_noop() {
            handle = unsafe { handle.resume() };
        }
    }

    #[test]
    fn test_lazy_start() {
        let t = Task::new(async { 42 });
        assert_eq!(t.has_value(), false);
        assert_eq!(t.is_finished(), false);
        run_inline(&t);
        assert_eq!(t.has_value(), true);
        assert_eq!(*t.value(), 42);
    }

    #[test]
    fn test_unit_task() {
        let t = Task::new(async {});
        assert_eq!(t.is_finished(), false);
        run_inline(&t);
        assert_eq!(t.has_value(), true);
        t.value();
    }

    #[test]
    fn test_non_trivial_value() {
        let t = Task::new(async { String::from("Hello") });
        run_inline(&t);
        assert_eq!(t.value(), "Hello");
        assert_eq!(*t, "Hello");
    }

    #[test]
    #[should_panic(expected = "before the task finished")]
    fn test_value_before_finish() {
        let t = Task::new(async { 42 });
        t.value();
    }

    #[test]
    fn test_failure_capture() {
        let t: Task<i32> = Task::new(async { panic!("boom") });
        run_inline(&t);
        assert_eq!(t.has_value(), false);
        assert_eq!(t.is_finished(), true);
        let payload = t.error().unwrap();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "boom");
    }

    #[test]
    fn test_failure_rethrow() {
        let t: Task<i32> = Task::new(async { panic!("boom") });
        run_inline(&t);
        let payload = t.into_result().unwrap_err();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            std::panic::resume_unwind(payload)
        }));
        let caught = caught.unwrap_err();
        assert_eq!(*caught.downcast_ref::<&str>().unwrap(), "boom");
    }

    #[test]
    fn test_value_or() {
        let t = Task::new(async { String::from("Hello") });
        assert_eq!(t.value_or(String::from("Bye")), "Bye");
        run_inline(&t);
        assert_eq!(t.value_or(String::from("Bye")), "Hello");
    }

    #[test]
    fn test_move_transfers_frame() {
        let t1 = Task::new(async { String::from("Hello") });
        let t2 = t1;
        run_inline(&t2);
        assert_eq!(t2.value(), "Hello");
    }

    #[test]
    fn test_into_result() {
        let t = Task::new(async { 41 + 1 });
        run_inline(&t);
        assert_eq!(t.into_result().unwrap(), 42);
    }

    #[test]
    fn test_drop_unresumed_task() {
        // the frame (and the captured body) must be freed without running
        let t = Task::new(async { String::from("never produced") });
        drop(t);
    }
}
