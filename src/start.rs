use std::cell::Cell;
use std::marker::PhantomData;

use crate::handle::{FrameVtable, Queued, RawHandle, TaskLifetime};
use crate::pool::{submit_local, ThreadPool};
use crate::sync::latch::Latch;
use crate::wait::{JoinBarrier, TaskSet, WaitFrame};

enum SubmitVia {
    /// The start frame is resumed by a worker (it arrived through the
    /// intake), so the wait frames go onto that worker's own deque.
    WorkerDeque,
    /// The start frame is resumed on the submitting thread
    /// ([`start_async`]), which is outside the pool, so the wait frames go
    /// through the intake. The pointer is only read during that resume,
    /// which happens inside `start_async` while the pool borrow is held.
    Intake(*const ThreadPool),
}

/// Frame bridging a non-pool caller into the runtime: schedules wait frames
/// over the caller's root tasks, and opens a one-shot latch at its final
/// suspension. The latch is what the submitting thread blocks on.
struct StartFrame {
    frames: Vec<Box<WaitFrame>>,
    barrier: JoinBarrier,
    latch: Latch,
    started: Cell<bool>,
    submit: SubmitVia,
}

// SAFETY: the frame is advanced by one thread at a time and handed between
// threads through the intake queue; the latch does its own locking.
unsafe impl Send for StartFrame {}
// SAFETY: the submitting thread only ever touches the latch while workers
// advance the rest of the frame; the non-atomic fields are single-thread at
// any point in time.
unsafe impl Sync for StartFrame {}

impl StartFrame {
    const VTABLE: FrameVtable = FrameVtable {
        resume: Self::resume,
        destroy: Self::destroy,
        set_continuation: frame_is_not_awaitable,
        is_finished: frame_has_no_result,
    };

    fn new<'a>(tasks: impl TaskSet<'a>, submit: SubmitVia) -> Box<StartFrame> {
        let mut siblings = Vec::new();
        tasks.push_siblings(&mut siblings);
        Box::new(StartFrame {
            barrier: JoinBarrier::new(siblings.len() as u64),
            frames: siblings.into_iter().map(WaitFrame::new).collect(),
            latch: Latch::new(),
            started: Cell::new(false),
            submit,
        })
    }

    fn handle(&self) -> RawHandle {
        RawHandle::new(self as *const StartFrame as *const (), &Self::VTABLE)
    }

    unsafe fn resume(ptr: *const ()) -> RawHandle {
        let frame = unsafe { &*(ptr as *const StartFrame) };

        if !frame.started.get() {
            frame.started.set(true);

            if frame.frames.is_empty() {
                frame.latch.open();
                return RawHandle::noop();
            }

            frame.barrier.set_continuation(frame.handle());
            let barrier = &frame.barrier as *const JoinBarrier;
            for wait_frame in &frame.frames {
                wait_frame.bind(barrier);
                let entry = Queued {
                    handle: wait_frame.handle(),
                    lifetime: TaskLifetime::ScopeManaged,
                };
                match frame.submit {
                    SubmitVia::WorkerDeque => submit_local(entry),
                    // SAFETY: see `SubmitVia::Intake`.
                    SubmitVia::Intake(pool) => unsafe { (*pool).add_task_from_outside(entry) },
                }
            }
            return RawHandle::noop();
        }

        // All roots finished. Opening the latch must be the last touch of
        // this frame: the blocked submitter frees it as soon as it wakes.
        frame.latch.open();
        RawHandle::noop()
    }

    unsafe fn destroy(ptr: *const ()) {
        drop(unsafe { Box::from_raw(ptr as *mut StartFrame) });
    }
}

unsafe fn frame_is_not_awaitable(_ptr: *const (), _continuation: RawHandle) {
    unreachable!("start frames cannot be awaited");
}

unsafe fn frame_has_no_result(_ptr: *const ()) -> bool {
    unreachable!("start frames carry no result");
}

/// Run the tasks on `pool` and block the calling thread until they have all
/// finished. The results are then ready to read from any borrowed task in
/// the set.
///
/// This is the bridge from outside the runtime in: the calling thread never
/// becomes a worker, it just sleeps on a latch until the pool is done.
pub fn start_sync<'a>(pool: &ThreadPool, tasks: impl TaskSet<'a>) {
    let frame = StartFrame::new(tasks, SubmitVia::WorkerDeque);
    pool.add_task_from_outside(Queued {
        handle: frame.handle(),
        lifetime: TaskLifetime::ScopeManaged,
    });
    frame.latch.wait();
    // frame drops here, after the pool is provably done with it
}

/// Start the tasks on `pool` and return immediately with a handle;
/// [`StartHandle::wait`] blocks until they have all finished.
///
/// The root tasks are scheduled before this returns (through the pool's
/// intake queue, since the caller is not a worker).
pub fn start_async<'s>(pool: &'s ThreadPool, tasks: impl TaskSet<'s>) -> StartHandle<'s> {
    let frame = StartFrame::new(tasks, SubmitVia::Intake(pool as *const ThreadPool));
    // Resume the start frame here on the caller: this schedules the wait
    // frames and suspends.
    let next = unsafe { frame.handle().resume() };
    debug_assert!(next.is_noop());
    StartHandle {
        frame,
        _scope: PhantomData,
    }
}

/// Joinable handle returned by [`start_async`]. Borrows the pool and every
/// task the caller lent to the set, so none of them can go away while the
/// work is in flight.
///
/// Dropping the handle without calling [`wait`](StartHandle::wait) is safe:
/// the drop waits for completion first, then frees the start frame.
#[must_use = "dropping a StartHandle blocks until the tasks finish; call wait()"]
pub struct StartHandle<'s> {
    frame: Box<StartFrame>,
    _scope: PhantomData<&'s ThreadPool>,
}

// SAFETY: the boxed start frame is only advanced by pool workers; the handle
// itself just waits on the latch.
unsafe impl Send for StartHandle<'_> {}

impl StartHandle<'_> {
    /// Block until every task submitted through this handle has finished.
    pub fn wait(&self) {
        self.frame.latch.wait();
    }

    /// Whether the tasks have already finished (a `wait` would not block).
    pub fn is_finished(&self) -> bool {
        self.frame.latch.is_open()
    }
}

impl Drop for StartHandle<'_> {
    fn drop(&mut self) {
        // Wait frames in flight point into this allocation; wait them out.
        self.frame.latch.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::task::Task;
    use crate::wait::{wait_tasks, wait_tasks_async, wait_tasks_on};

    use super::*;

    fn fib(n: u64) -> Task<u64> {
        Task::new(async move {
            if n < 2 {
                return n;
            }
            let a = fib(n - 1);
            let b = fib(n - 2);
            wait_tasks((&a, &b)).await;
            *a + *b
        })
    }

    #[test]
    fn test_start_sync_single_task() {
        let pool = ThreadPool::new(2);
        let task = Task::new(async { 41 + 1 });
        assert_eq!(task.is_finished(), false);
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }

    #[test]
    fn test_start_sync_multiple_tasks() {
        let pool = ThreadPool::new(2);
        let t1 = Task::new(async { String::from("Hello") });
        let t2 = Task::new(async { 2 * 21 });
        start_sync(&pool, (&t1, &t2));
        assert_eq!(t1.value(), "Hello");
        assert_eq!(*t2, 42);
    }

    #[test]
    fn test_recursive_fib() {
        let pool = ThreadPool::new(4);
        let task = fib(20);
        start_sync(&pool, &task);
        assert_eq!(*task, 6765);
    }

    #[test]
    fn test_recursive_fib_deep() {
        let pool = ThreadPool::new(4);
        let task = fib(30);
        start_sync(&pool, &task);
        assert_eq!(*task, 832_040);
    }

    #[test]
    fn test_failure_stays_in_its_task() {
        let pool = ThreadPool::new(2);
        let ok = Task::new(async { 7 });
        let bad: Task<i32> = Task::new(async { panic!("expected failure") });
        start_sync(&pool, (&ok, &bad));
        assert_eq!(*ok, 7);
        assert_eq!(bad.has_value(), false);
        let payload = bad.error().unwrap();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "expected failure");
    }

    #[test]
    fn test_start_sync_empty_set() {
        let pool = ThreadPool::new(1);
        let tasks: Vec<Task<u32>> = Vec::new();
        start_sync(&pool, &tasks);
    }

    #[test]
    fn test_start_sync_owned_vector() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<()>> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Task::new(async move {
                    counter.fetch_add(1, SeqCst);
                })
            })
            .collect();
        start_sync(&pool, tasks);
        assert_eq!(counter.load(SeqCst), 16);
    }

    #[test]
    fn test_start_async_wait() {
        let pool = ThreadPool::new(2);
        let task = fib(15);
        let handle = start_async(&pool, &task);
        handle.wait();
        assert_eq!(*task, 610);
    }

    #[test]
    fn test_start_async_drop_without_wait() {
        let pool = ThreadPool::new(2);
        let task = fib(10);
        let handle = start_async(&pool, &task);
        // dropping the handle waits for completion instead of leaking or
        // double-freeing the start frame
        drop(handle);
        assert_eq!(*task, 55);
    }

    #[test]
    fn test_nested_wait_sets() {
        let pool = ThreadPool::new(4);
        let task = Task::new(async {
            let left = Task::new(async {
                let a = fib(12);
                let b = fib(13);
                wait_tasks((&a, &b)).await;
                *a + *b
            });
            let right = fib(14);
            wait_tasks((&left, &right)).await;
            *left + *right
        });
        start_sync(&pool, &task);
        assert_eq!(*task, 144 + 233 + 377);
    }

    #[test]
    fn test_direct_child_await() {
        let pool = ThreadPool::new(2);
        let task = Task::new(async {
            let child = Task::new(async { 41 });
            child.join().await;
            *child + 1
        });
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }

    #[test]
    fn test_cross_pool_wait_runs_on_other_pool() {
        let pool_a = ThreadPool::new(1);
        // a task body cannot borrow a stack-local pool ('static bound), so
        // cross-pool users hold the foreign pool in an Arc
        let pool_b = Arc::new(ThreadPool::new(1));

        // learn pool B's only worker thread id
        let probe = Task::new(async { std::thread::current().id() });
        start_sync(&pool_b, &probe);
        let pool_b_thread = *probe;

        let pool_b_inner = Arc::clone(&pool_b);
        let task = Task::new(async move {
            let sibling = Task::new(async { std::thread::current().id() });
            wait_tasks_on(&pool_b_inner, &sibling).await;
            *sibling
        });
        start_sync(&pool_a, &task);
        assert_eq!(*task, pool_b_thread);
    }

    #[test]
    fn test_wait_tasks_async_overlaps_with_other_work() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_in = Arc::clone(&counter);
        let task = Task::new(async move {
            let t1 = Task::new(async { 20 * 2 });
            let t2 = Task::new(async { 1 + 1 });
            let pending = wait_tasks_async((t1, t2));
            // other work while the siblings run
            counter_in.fetch_add(1, SeqCst);
            let (t1, t2) = pending.await;
            *t1 + *t2
        });
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn test_wait_tasks_async_fast_path_after_completion() {
        let pool = ThreadPool::new(2);
        let task = Task::new(async {
            let t = Task::new(async { 42 });
            let pending = wait_tasks_async(t);
            // give the sibling ample time to finish so the await takes the
            // no-suspend path
            std::thread::sleep(Duration::from_millis(50));
            let t = pending.await;
            *t
        });
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }

    #[test]
    fn test_async_barrier_race_both_orderings() {
        let pool = ThreadPool::new(4);
        for round in 0..1000u64 {
            let task = Task::new(async move {
                let t1 = Task::new(async move { round });
                let t2 = Task::new(async move { round + 1 });
                let pending = wait_tasks_async((t1, t2));
                // jitter so the awaiter sometimes suspends before and
                // sometimes after the last finisher
                if round % 3 == 0 {
                    std::thread::yield_now();
                }
                let (t1, t2) = pending.await;
                *t1 + *t2
            });
            start_sync(&pool, &task);
            assert_eq!(*task, round * 2 + 1);
        }
    }
}
