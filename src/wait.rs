//! Join barriers and the wait frames that drive them.
//!
//! A `wait_tasks(..)` expression suspends the awaiting task, schedules one
//! small wrapper frame per sibling, and resumes the awaiting task exactly
//! once, when the last sibling finishes. Each wrapper frame runs its sibling
//! to completion and then decrements the shared barrier; whichever frame
//! observes the count hit zero carries the parent's continuation back to a
//! worker by symmetric transfer.
//!
//! The asynchronous variant schedules its siblings eagerly at construction
//! so the caller can keep computing before awaiting. That opens a race the
//! structured variant cannot have: the awaiter may find the count already at
//! zero while the last finisher is still deciding whether to resume it. The
//! `handle_ready` exchange arbitrates; exactly one side resumes the parent.

use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::handle::{FrameVtable, Queued, RawHandle, TaskLifetime};
use crate::pool::{ctx, submit_local, ThreadPool};
use crate::task::Task;

/// An erased task placed under a join barrier. Created through [`TaskSet`]
/// or [`OwnedTaskSet`]; not user-constructible.
pub struct Sibling {
    handle: RawHandle,
    /// Owned siblings die with the frame that wraps them; borrowed siblings
    /// stay with the caller, who reads their results afterwards.
    owned: bool,
}

impl Sibling {
    pub(crate) fn handle(&self) -> RawHandle {
        self.handle
    }
}

impl Drop for Sibling {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: an owned sibling's frame has no other owner.
            unsafe { self.handle.destroy() };
        }
    }
}

/// A set of tasks that can be scheduled under one join barrier.
///
/// Implemented for `&Task<T>` (the caller keeps the task and reads its
/// result after the wait), for `Task<T>` by value (the task moves into the
/// runtime and is freed when the wait completes), for tuples freely mixing
/// the two, and for vectors and slices of tasks.
pub trait TaskSet<'a> {
    #[doc(hidden)]
    fn push_siblings(self, out: &mut Vec<Sibling>);
}

impl<'a, T: Send + 'static> TaskSet<'a> for &'a Task<T> {
    fn push_siblings(self, out: &mut Vec<Sibling>) {
        out.push(Sibling {
            handle: self.raw(),
            owned: false,
        });
    }
}

impl<'a, T: Send + 'static> TaskSet<'a> for Task<T> {
    fn push_siblings(self, out: &mut Vec<Sibling>) {
        out.push(Sibling {
            handle: self.into_raw(),
            owned: true,
        });
    }
}

impl<'a, T: Send + 'static> TaskSet<'a> for Vec<Task<T>> {
    fn push_siblings(self, out: &mut Vec<Sibling>) {
        for task in self {
            task.push_siblings(out);
        }
    }
}

impl<'a, T: Send + 'static> TaskSet<'a> for &'a Vec<Task<T>> {
    fn push_siblings(self, out: &mut Vec<Sibling>) {
        self.as_slice().push_siblings(out);
    }
}

impl<'a, T: Send + 'static> TaskSet<'a> for &'a [Task<T>] {
    fn push_siblings(self, out: &mut Vec<Sibling>) {
        for task in self {
            task.push_siblings(out);
        }
    }
}

macro_rules! impl_task_set_for_tuple {
    ($($member:ident),+) => {
        impl<'a, $($member: TaskSet<'a>),+> TaskSet<'a> for ($($member,)+) {
            #[allow(non_snake_case)]
            fn push_siblings(self, out: &mut Vec<Sibling>) {
                let ($($member,)+) = self;
                $($member.push_siblings(out);)+
            }
        }
    };
}

impl_task_set_for_tuple!(A);
impl_task_set_for_tuple!(A, B);
impl_task_set_for_tuple!(A, B, C);
impl_task_set_for_tuple!(A, B, C, D);
impl_task_set_for_tuple!(A, B, C, D, E);
impl_task_set_for_tuple!(A, B, C, D, E, F);
impl_task_set_for_tuple!(A, B, C, D, E, F, G);
impl_task_set_for_tuple!(A, B, C, D, E, F, G, H);

/// A task set whose members are all owned, for the primitives that keep
/// scheduled work alive independently of the caller's borrows
/// ([`wait_tasks_async`], [`enqueue_tasks`](crate::enqueue_tasks)).
pub trait OwnedTaskSet: Send + 'static {
    /// Collect handles without giving up ownership; the set itself must stay
    /// alive until the scheduled work finishes.
    #[doc(hidden)]
    fn borrow_siblings(&self, out: &mut Vec<Sibling>);

    /// Hand the member frames over entirely.
    #[doc(hidden)]
    fn into_siblings(self, out: &mut Vec<Sibling>);
}

impl<T: Send + 'static> OwnedTaskSet for Task<T> {
    fn borrow_siblings(&self, out: &mut Vec<Sibling>) {
        out.push(Sibling {
            handle: self.raw(),
            owned: false,
        });
    }

    fn into_siblings(self, out: &mut Vec<Sibling>) {
        out.push(Sibling {
            handle: self.into_raw(),
            owned: true,
        });
    }
}

impl<T: Send + 'static> OwnedTaskSet for Vec<Task<T>> {
    fn borrow_siblings(&self, out: &mut Vec<Sibling>) {
        for task in self {
            task.borrow_siblings(out);
        }
    }

    fn into_siblings(self, out: &mut Vec<Sibling>) {
        for task in self {
            task.into_siblings(out);
        }
    }
}

macro_rules! impl_owned_task_set_for_tuple {
    ($($member:ident),+) => {
        impl<$($member: OwnedTaskSet),+> OwnedTaskSet for ($($member,)+) {
            #[allow(non_snake_case)]
            fn borrow_siblings(&self, out: &mut Vec<Sibling>) {
                let ($($member,)+) = self;
                $($member.borrow_siblings(out);)+
            }

            #[allow(non_snake_case)]
            fn into_siblings(self, out: &mut Vec<Sibling>) {
                let ($($member,)+) = self;
                $($member.into_siblings(out);)+
            }
        }
    };
}

impl_owned_task_set_for_tuple!(A);
impl_owned_task_set_for_tuple!(A, B);
impl_owned_task_set_for_tuple!(A, B, C);
impl_owned_task_set_for_tuple!(A, B, C, D);
impl_owned_task_set_for_tuple!(A, B, C, D, E);
impl_owned_task_set_for_tuple!(A, B, C, D, E, F);
impl_owned_task_set_for_tuple!(A, B, C, D, E, F, G);
impl_owned_task_set_for_tuple!(A, B, C, D, E, F, G, H);

/// Countdown shared by the wait frames of one structured wait.
///
/// Lives inside the awaitable, which sits pinned in the suspended parent's
/// frame, so its address is stable for as long as any sibling can reach it.
pub(crate) struct JoinBarrier {
    remaining: AtomicU64,
    /// Parent frame to resume. Written by the parent before the wait frames
    /// are published to a queue; read by every finisher, used only by the
    /// one that takes the count to zero.
    continuation: Cell<RawHandle>,
}

// SAFETY: `continuation` is written before the queue push that publishes the
// frames (release) and only read by frames popped or stolen from that queue
// (acquire); the countdown itself is atomic.
unsafe impl Send for JoinBarrier {}
unsafe impl Sync for JoinBarrier {}

impl JoinBarrier {
    pub(crate) fn new(count: u64) -> Self {
        JoinBarrier {
            remaining: AtomicU64::new(count),
            continuation: Cell::new(RawHandle::noop()),
        }
    }

    pub(crate) fn set_continuation(&self, continuation: RawHandle) {
        self.continuation.set(continuation);
    }

    /// Record one finished sibling and say where control goes next: the
    /// parent's continuation for the sibling that took the count to zero,
    /// the noop handle for everyone else.
    ///
    /// AcqRel on the decrement orders every sibling's writes (result slots
    /// included) before the parent's resume.
    pub(crate) fn complete_one(&self) -> RawHandle {
        // Read before the decrement: once the count hits zero the barrier's
        // owner may resume and invalidate it.
        let continuation = self.continuation.get();
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "join barrier decremented past zero");
        if previous == 1 {
            continuation
        } else {
            RawHandle::noop()
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Countdown for [`wait_tasks_async`]: shared by `Arc` because the awaiter
/// and the last finisher race, and either may be the last to need it.
///
/// Everything here is sequentially consistent. The awaiter publishes its
/// continuation and then re-checks the count; the last finisher decrements
/// and then tries to claim the continuation. Under a total order exactly one
/// of them wins the `handle_ready` exchange.
struct AsyncJoinBarrier {
    remaining: AtomicU64,
    /// Written by the awaiter before it raises `handle_ready`; read by a
    /// finisher only after winning the exchange, which orders the accesses.
    continuation: UnsafeCell<RawHandle>,
    handle_ready: AtomicBool,
}

// SAFETY: `continuation` is protected by the `handle_ready` protocol
// described above; all other fields are atomic.
unsafe impl Send for AsyncJoinBarrier {}
unsafe impl Sync for AsyncJoinBarrier {}

impl AsyncJoinBarrier {
    fn new(count: u64) -> Self {
        AsyncJoinBarrier {
            remaining: AtomicU64::new(count),
            continuation: UnsafeCell::new(RawHandle::noop()),
            handle_ready: AtomicBool::new(false),
        }
    }

    fn complete_one(&self) -> RawHandle {
        let previous = self.remaining.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "async join barrier decremented past zero");
        if previous != 1 {
            return RawHandle::noop();
        }
        // Last sibling: race the awaiter for the right to resume the parent.
        if self
            .handle_ready
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: the successful exchange synchronizes with the
            // awaiter's store of the continuation.
            unsafe { *self.continuation.get() }
        } else {
            // the awaiter either never suspended (it will see the zero
            // count) or already reclaimed the handle
            RawHandle::noop()
        }
    }
}

/// Frame that runs one sibling and reports to a [`JoinBarrier`] at its final
/// suspension. Two-state: first resume transfers to the sibling, second
/// resume (the sibling finished and handed control back) decrements the
/// barrier.
pub(crate) struct WaitFrame {
    sibling: Sibling,
    /// Bound when the awaitable suspends, before the frame is published.
    barrier: Cell<*const JoinBarrier>,
}

impl WaitFrame {
    const VTABLE: FrameVtable = FrameVtable {
        resume: Self::resume,
        destroy: Self::destroy,
        set_continuation: frame_is_not_awaitable,
        is_finished: frame_has_no_result,
    };

    pub(crate) fn new(sibling: Sibling) -> Box<WaitFrame> {
        Box::new(WaitFrame {
            sibling,
            barrier: Cell::new(ptr::null()),
        })
    }

    pub(crate) fn bind(&self, barrier: *const JoinBarrier) {
        self.barrier.set(barrier);
    }

    pub(crate) fn handle(&self) -> RawHandle {
        RawHandle::new(self as *const WaitFrame as *const (), &Self::VTABLE)
    }

    unsafe fn resume(ptr: *const ()) -> RawHandle {
        let frame = unsafe { &*(ptr as *const WaitFrame) };
        let sibling = frame.sibling.handle();

        // SAFETY: the sibling is kept alive by this frame (owned) or by the
        // borrow held through the awaitable (borrowed).
        if !unsafe { sibling.is_finished() } {
            unsafe { sibling.set_continuation(RawHandle::new(ptr, &Self::VTABLE)) };
            return sibling;
        }

        // Final suspension. Nothing may touch the frame after the decrement:
        // the resumed parent is free to drop the awaitable that owns it.
        let barrier = frame.barrier.get();
        debug_assert!(!barrier.is_null(), "wait frame resumed before binding");
        unsafe { (*barrier).complete_one() }
    }

    unsafe fn destroy(ptr: *const ()) {
        drop(unsafe { Box::from_raw(ptr as *mut WaitFrame) });
    }
}

/// Same two-state frame for the async barrier. Owns a reference to the
/// barrier: the frame cannot know it is the last finisher until after the
/// decrement, by which point the awaiter may already have dropped its own
/// reference, so every frame keeps the barrier alive across its final step.
struct AsyncWaitFrame {
    sibling: Sibling,
    barrier: Arc<AsyncJoinBarrier>,
}

impl AsyncWaitFrame {
    const VTABLE: FrameVtable = FrameVtable {
        resume: Self::resume,
        destroy: Self::destroy,
        set_continuation: frame_is_not_awaitable,
        is_finished: frame_has_no_result,
    };

    unsafe fn resume(ptr: *const ()) -> RawHandle {
        let frame = unsafe { &*(ptr as *const AsyncWaitFrame) };
        let sibling = frame.sibling.handle();

        if !unsafe { sibling.is_finished() } {
            unsafe { sibling.set_continuation(RawHandle::new(ptr, &Self::VTABLE)) };
            return sibling;
        }

        // Move a barrier reference onto this stack; the frame itself may be
        // freed by the awaiter the moment the count reaches zero.
        let barrier = Arc::clone(&frame.barrier);
        barrier.complete_one()
    }

    unsafe fn destroy(ptr: *const ()) {
        drop(unsafe { Box::from_raw(ptr as *mut AsyncWaitFrame) });
    }
}

unsafe fn frame_is_not_awaitable(_ptr: *const (), _continuation: RawHandle) {
    unreachable!("internal frames cannot be awaited");
}

unsafe fn frame_has_no_result(_ptr: *const ()) -> bool {
    unreachable!("internal frames carry no result");
}

enum SubmitTo<'p> {
    /// The current worker's own deque.
    CurrentWorker,
    /// A foreign pool's intake queue; the parent resumes over there.
    Pool(&'p ThreadPool),
}

/// Awaitable returned by [`wait_tasks`] / [`wait_tasks_on`]. Suspends the
/// awaiting task until every task in the set has finished; the results are
/// then read from the borrowed tasks themselves.
#[must_use = "wait_tasks does nothing until awaited"]
pub struct WaitTasks<'a> {
    target: SubmitTo<'a>,
    frames: Vec<Box<WaitFrame>>,
    barrier: JoinBarrier,
    scheduled: bool,
    /// Borrowed siblings stay alive through this.
    _tasks: PhantomData<&'a ()>,
    /// The wait frames hold the barrier's address once polled.
    _pin: PhantomPinned,
}

// SAFETY: the raw frame pointers inside are either owned by this value or
// borrowed for 'a; sending the suspended awaitable between workers moves
// nothing the wait frames point at.
unsafe impl Send for WaitTasks<'_> {}

/// Suspend the current task until every task in the set has finished.
///
/// The siblings are pushed onto the current worker's own deque, where idle
/// workers steal them from the top while this worker eats the bottom.
/// Failures do not propagate: the parent always resumes and inspects each
/// sibling. Must be awaited from inside a running task.
pub fn wait_tasks<'a>(tasks: impl TaskSet<'a>) -> WaitTasks<'a> {
    WaitTasks::new(SubmitTo::CurrentWorker, tasks)
}

/// Like [`wait_tasks`], but the siblings are handed to `pool`, and the
/// awaiting task resumes on whichever of `pool`'s workers finishes last.
pub fn wait_tasks_on<'a>(pool: &'a ThreadPool, tasks: impl TaskSet<'a>) -> WaitTasks<'a> {
    WaitTasks::new(SubmitTo::Pool(pool), tasks)
}

impl<'a> WaitTasks<'a> {
    fn new(target: SubmitTo<'a>, tasks: impl TaskSet<'a>) -> Self {
        let mut siblings = Vec::new();
        tasks.push_siblings(&mut siblings);
        WaitTasks {
            target,
            barrier: JoinBarrier::new(siblings.len() as u64),
            frames: siblings.into_iter().map(WaitFrame::new).collect(),
            scheduled: false,
            _tasks: PhantomData,
            _pin: PhantomPinned,
        }
    }
}

impl Future for WaitTasks<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: nothing is moved out; the barrier address handed to the
        // wait frames stays valid because the awaitable is pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if this.scheduled {
            // resumed by the last sibling
            debug_assert_eq!(this.barrier.remaining(), 0);
            return Poll::Ready(());
        }

        if this.frames.is_empty() {
            return Poll::Ready(());
        }

        let parent = ctx::current_frame();
        assert!(
            !parent.is_noop(),
            "wait_tasks must be awaited from inside a running task"
        );

        this.scheduled = true;
        this.barrier.set_continuation(parent);
        let barrier = &this.barrier as *const JoinBarrier;

        for frame in &this.frames {
            frame.bind(barrier);
            let entry = Queued {
                handle: frame.handle(),
                lifetime: TaskLifetime::ScopeManaged,
            };
            match this.target {
                SubmitTo::CurrentWorker => submit_local(entry),
                SubmitTo::Pool(pool) => pool.add_task_from_outside(entry),
            }
        }

        // void suspension: hand the worker back to its loop
        Poll::Pending
    }
}

impl Drop for WaitTasks<'_> {
    fn drop(&mut self) {
        // Normally the parent only gets here after resuming, with the count
        // at zero. A parent frame torn down mid-wait would otherwise free
        // frames the workers still hold; wait them out instead.
        if self.scheduled {
            while self.barrier.remaining() != 0 {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }
}

/// Awaitable returned by [`wait_tasks_async`]. The siblings are already
/// running when this exists; awaiting it suspends only if some of them are
/// still unfinished, and yields the task set back to the caller.
#[must_use = "the tasks are already running; await this to synchronize with them"]
pub struct WaitTasksAsync<S: OwnedTaskSet> {
    tasks: Option<S>,
    frames: Vec<Box<AsyncWaitFrame>>,
    barrier: Arc<AsyncJoinBarrier>,
    suspended: bool,
}

/// Schedule the tasks on the current worker's pool *now* and return an
/// awaitable to synchronize with them later.
///
/// The set must be owned (`Task<T>` values, vectors, tuples of those): the
/// scheduled frames have to outlive any scope the caller might exit before
/// awaiting. Ownership comes back out of the `.await`:
///
/// ```ignore
/// let pending = wait_tasks_async((t1, t2));
/// // ... other work ...
/// let (t1, t2) = pending.await;
/// println!("{} {}", *t1, *t2);
/// ```
///
/// Must be called from inside a running task.
pub fn wait_tasks_async<S: OwnedTaskSet>(tasks: S) -> WaitTasksAsync<S> {
    let mut siblings = Vec::new();
    tasks.borrow_siblings(&mut siblings);

    let barrier = Arc::new(AsyncJoinBarrier::new(siblings.len() as u64));
    let frames: Vec<Box<AsyncWaitFrame>> = siblings
        .into_iter()
        .map(|sibling| {
            Box::new(AsyncWaitFrame {
                sibling,
                barrier: Arc::clone(&barrier),
            })
        })
        .collect();

    // eager scheduling: the siblings start before the caller awaits
    for frame in &frames {
        submit_local(Queued {
            handle: RawHandle::new(&**frame as *const AsyncWaitFrame as *const (), &AsyncWaitFrame::VTABLE),
            lifetime: TaskLifetime::ScopeManaged,
        });
    }

    WaitTasksAsync {
        tasks: Some(tasks),
        frames,
        barrier,
        suspended: false,
    }
}

impl<S: OwnedTaskSet> Future for WaitTasksAsync<S> {
    type Output = S;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<S> {
        // SAFETY: the wait frames point at the sibling task frames (heap
        // allocations), never into this value, so nothing here is
        // structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };

        // Fast path, and the path taken when resumed by the last finisher.
        if this.barrier.remaining.load(Ordering::SeqCst) == 0 {
            let tasks = this
                .tasks
                .take()
                .expect("wait_tasks_async awaited after completion");
            return Poll::Ready(tasks);
        }

        if !this.suspended {
            this.suspended = true;
            let parent = ctx::current_frame();
            assert!(
                !parent.is_noop(),
                "wait_tasks_async must be awaited from inside a running task"
            );

            // Publish the continuation, then re-check the count. The last
            // finisher does the mirror image: decrement, then try to claim
            // the continuation.
            // SAFETY: this store happens before the SeqCst store of
            // `handle_ready`, which is what a finisher claims through.
            unsafe { *this.barrier.continuation.get() = parent };
            this.barrier.handle_ready.store(true, Ordering::SeqCst);

            if this.barrier.remaining.load(Ordering::SeqCst) >= 1 {
                // at least one sibling left; its finisher will resume us
                return Poll::Pending;
            }

            // The count hit zero between the publish and the re-check, so a
            // finisher may or may not have seen our handle. Exactly one of
            // us wins the exchange.
            if this
                .barrier
                .handle_ready
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // We reclaimed the handle: nobody will resume us, continue
                // in place.
                let tasks = this
                    .tasks
                    .take()
                    .expect("wait_tasks_async awaited after completion");
                return Poll::Ready(tasks);
            }

            // The finisher took the handle and will transfer to us.
            return Poll::Pending;
        }

        unreachable!("async wait resumed before its siblings finished");
    }
}

impl<S: OwnedTaskSet> Drop for WaitTasksAsync<S> {
    fn drop(&mut self) {
        // The siblings were scheduled at construction and cannot be
        // recalled; the frames (and the task set they point into) must stay
        // alive until the countdown finishes. On the normal path the count
        // is already zero and this falls straight through.
        while self.barrier.remaining.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_barrier_counts_down_once() {
        let barrier = JoinBarrier::new(3);
        barrier.set_continuation(RawHandle::fake(7));

        assert!(barrier.complete_one().is_noop());
        assert!(barrier.complete_one().is_noop());
        let last = barrier.complete_one();
        assert_eq!(last.tag(), 7);
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn test_async_barrier_finisher_wins_when_handle_ready() {
        let barrier = AsyncJoinBarrier::new(1);
        // awaiter publishes first
        unsafe { *barrier.continuation.get() = RawHandle::fake(9) };
        barrier.handle_ready.store(true, Ordering::SeqCst);

        let resumed = barrier.complete_one();
        assert_eq!(resumed.tag(), 9);
        // the handle can only be claimed once
        assert_eq!(barrier.handle_ready.load(Ordering::SeqCst), false);
    }

    #[test]
    fn test_async_barrier_noop_without_awaiter() {
        let barrier = AsyncJoinBarrier::new(2);
        assert!(barrier.complete_one().is_noop());
        // last finisher, but nobody suspended: the awaiter's fast path will
        // observe the zero count instead
        assert!(barrier.complete_one().is_noop());
        assert_eq!(barrier.remaining.load(Ordering::SeqCst), 0);
    }
}
