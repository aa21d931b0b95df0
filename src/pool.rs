use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use log::{debug, trace};

use crate::deque::Deque;
use crate::handle::{Queued, RawHandle, TaskLifetime};

/// State shared between the pool handle and its workers.
pub(crate) struct PoolShared {
    /// One work-stealing deque per worker.
    deques: Vec<Deque>,
    /// Work submitted from threads that are not workers of this pool. New
    /// work cannot be pushed into a deque from the outside (the bottom end
    /// is owner-only), so it goes through this queue instead.
    intake: SegQueue<Queued>,
    stop: AtomicBool,
    /// Has a worker thread panicked outside a task body?
    has_thread_panicked: AtomicBool,
}

impl PoolShared {
    pub(crate) fn submit_external(&self, entry: Queued) {
        self.intake.push(entry);
    }
}

/// A fixed set of worker threads multiplexing task frames.
///
/// Each worker owns a work-stealing deque and runs a cooperative loop:
/// take a frame (own deque, then a randomized steal sweep over the other
/// workers, then the intake queue), resume it, and follow the chain of
/// symmetric transfers it returns until control comes back to the loop.
///
/// Dropping the pool stops the workers and discards whatever never ran:
/// pool-managed frames are destroyed, scope-managed frames are left to
/// their owners (see [`enqueue_tasks`](crate::enqueue_tasks) vs
/// [`wait_tasks`](crate::wait_tasks)). A running frame cannot be
/// interrupted; stopping only prevents queued work from starting.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// A pool with `threads` workers. Zero workers is legal: submitted work
    /// just sits in the intake queue until the pool is dropped.
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            deques: (0..threads).map(|_| Deque::new()).collect(),
            intake: SegQueue::new(),
            stop: AtomicBool::new(false),
            has_thread_panicked: AtomicBool::new(false),
        });

        debug!("starting task pool with {threads} workers");

        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("forkjoin-worker-{index}"))
                    .spawn(move || work_loop(shared, index))
                    .unwrap()
            })
            .collect();

        ThreadPool { shared, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Submit a frame from any thread that is not a worker of this pool.
    pub(crate) fn add_task_from_outside(&self, entry: Queued) {
        self.shared.submit_external(entry);
    }

    fn stop_threads(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        // only check join results if no worker has already panicked
        let check_for_errors = !self.shared.has_thread_panicked.load(Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let result = handle.join();
            if check_for_errors {
                result.expect("a worker thread panicked while stopping");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop_threads();

        // Discard whatever never made it out of the intake queue. The deques
        // destroy their own pool-managed leftovers when `shared` drops.
        let mut discarded = 0u64;
        while let Some(entry) = self.shared.intake.pop() {
            if entry.lifetime == TaskLifetime::PoolManaged {
                // SAFETY: workers are joined; nothing else holds this frame.
                unsafe { entry.handle.destroy() };
            }
            discarded += 1;
        }
        if discarded > 0 {
            debug!("discarded {discarded} queued frames at pool shutdown");
        }
    }
}

/// Push onto the current worker's own deque. Panics off-pool.
pub(crate) fn submit_local(entry: Queued) {
    ctx::with_worker_deque(|deque| deque.push_bottom(entry));
}

fn work_loop(shared: Arc<PoolShared>, index: usize) {
    // this will poison the pool when the loop unwinds instead of returning
    struct PoisonWhenDropped<'a>(&'a PoolShared);

    impl Drop for PoisonWhenDropped<'_> {
        fn drop(&mut self) {
            self.0.has_thread_panicked.store(true, Ordering::Relaxed);
        }
    }

    let poison_when_dropped = PoisonWhenDropped(shared.as_ref());
    ctx::init_worker(&shared.deques[index], shared.as_ref());
    trace!("worker {index} running");

    while !shared.stop.load(Ordering::Acquire) {
        let mut handle = get_task(&shared, index);
        if handle.is_noop() {
            // nothing anywhere: resuming the noop handle is the idle path
            std::hint::spin_loop();
            std::thread::yield_now();
            continue;
        }
        // Trampoline: each resume returns the frame to run next, so deep
        // await chains hand control around without growing this stack.
        while !handle.is_noop() {
            handle = unsafe { handle.resume() };
        }
    }

    trace!("worker {index} stopping");

    // didn't panic, so forget the poison handler and exit normally
    std::mem::forget(poison_when_dropped);
}

/// One scheduling decision: own deque first, then try to steal from the
/// other workers starting at a random victim, then the intake queue, then
/// give up for this iteration.
fn get_task(shared: &PoolShared, my_index: usize) -> RawHandle {
    let deques = &shared.deques;

    if let Some(entry) = deques[my_index].pop_bottom() {
        return entry.handle;
    }

    let start = ctx::random_victim(deques.len());
    for offset in 0..deques.len() {
        let victim = (start + offset) % deques.len();
        if victim == my_index {
            continue;
        }
        if let Some(entry) = deques[victim].steal() {
            return entry.handle;
        }
    }

    if let Some(entry) = shared.intake.pop() {
        return entry.handle;
    }

    RawHandle::noop()
}

/// Thread-local worker context.
///
/// `MY_DEQUE` / `MY_POOL` / `MY_RNG` are set once when a worker starts and
/// make the scheduling primitives work without an explicit pool argument
/// when called from inside a running task. `CURRENT_FRAME` and `TRANSFER`
/// carry the trampoline protocol: the frame being resumed, and where it
/// wants control to go when it suspends.
pub(crate) mod ctx {
    use std::cell::{Cell, RefCell};
    use std::ptr;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::{Deque, PoolShared, RawHandle};

    std::thread_local! {
        static MY_DEQUE: Cell<*const Deque> = const { Cell::new(ptr::null()) };
        static MY_POOL: Cell<*const PoolShared> = const { Cell::new(ptr::null()) };
        static MY_RNG: RefCell<Option<SmallRng>> = const { RefCell::new(None) };
        static CURRENT_FRAME: Cell<RawHandle> = Cell::new(RawHandle::noop());
        static TRANSFER: Cell<RawHandle> = Cell::new(RawHandle::noop());
    }

    pub(crate) fn init_worker(deque: *const Deque, pool: *const PoolShared) {
        MY_DEQUE.with(|c| c.set(deque));
        MY_POOL.with(|c| c.set(pool));
        MY_RNG.with(|r| *r.borrow_mut() = Some(SmallRng::from_entropy()));
    }

    pub(crate) fn random_victim(count: usize) -> usize {
        MY_RNG.with(|r| {
            r.borrow_mut()
                .as_mut()
                .expect("worker rng not initialised")
                .gen_range(0..count)
        })
    }

    /// The frame currently being resumed on this thread; noop outside of a
    /// resume.
    pub(crate) fn current_frame() -> RawHandle {
        CURRENT_FRAME.with(|c| c.get())
    }

    pub(crate) fn replace_current_frame(handle: RawHandle) -> RawHandle {
        CURRENT_FRAME.with(|c| c.replace(handle))
    }

    /// Name the frame the trampoline should run next; used by awaitables
    /// right before they return `Pending`.
    pub(crate) fn set_transfer(handle: RawHandle) {
        TRANSFER.with(|c| c.set(handle))
    }

    /// Consume the transfer target, leaving the default (noop: hand control
    /// back to the worker loop).
    pub(crate) fn take_transfer() -> RawHandle {
        TRANSFER.with(|c| c.replace(RawHandle::noop()))
    }

    /// Run `f` with the current worker's deque. Panics when called from a
    /// thread that is not a pool worker.
    pub(crate) fn with_worker_deque<R>(f: impl FnOnce(&Deque) -> R) -> R {
        let deque = MY_DEQUE.with(|c| c.get());
        assert!(
            !deque.is_null(),
            "this operation is only valid on a pool worker thread"
        );
        // SAFETY: set at worker startup; the deque outlives the worker loop.
        f(unsafe { &*deque })
    }

    /// Run `f` with the pool the current worker belongs to. Panics when
    /// called from a thread that is not a pool worker.
    pub(crate) fn with_current_pool<R>(f: impl FnOnce(&PoolShared) -> R) -> R {
        let pool = MY_POOL.with(|c| c.get());
        assert!(
            !pool.is_null(),
            "this operation is only valid on a pool worker thread"
        );
        // SAFETY: set at worker startup; the pool outlives the worker loop.
        f(unsafe { &*pool })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;

    use crate::task::Task;

    use super::*;

    #[test]
    fn test_zero_worker_pool_discards_queued_frames() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(0);

        for _ in 0..100 {
            let guard = Guard(Arc::clone(&drops));
            let task: Task<()> = Task::new(async move {
                let _guard = guard;
            });
            pool.add_task_from_outside(Queued {
                handle: task.into_raw(),
                lifetime: TaskLifetime::PoolManaged,
            });
        }

        assert_eq!(drops.load(SeqCst), 0);
        drop(pool);
        // all 100 frames destroyed exactly once, none ran
        assert_eq!(drops.load(SeqCst), 100);
    }

    #[test]
    fn test_scope_managed_frames_survive_shutdown() {
        let pool = ThreadPool::new(0);
        let task: Task<u32> = Task::new(async { 7 });
        pool.add_task_from_outside(Queued {
            handle: task.raw(),
            lifetime: TaskLifetime::ScopeManaged,
        });
        drop(pool);
        // still ours to drop; it never ran
        assert_eq!(task.is_finished(), false);
    }

    #[test]
    fn test_pool_starts_and_stops() {
        let pool = ThreadPool::new(4);
        assert_eq!(pool.thread_count(), 4);
        drop(pool);
    }
}
