use crate::handle::{FrameVtable, Queued, RawHandle, TaskLifetime};
use crate::pool::{ctx, ThreadPool};
use crate::wait::{OwnedTaskSet, Sibling};

/// Frame wrapping a fire-and-forget task: it owns the task and frees itself
/// (task included) at its final suspension. Nobody waits for it and nobody
/// reads its result.
struct FireFrame {
    sibling: Sibling,
}

impl FireFrame {
    const VTABLE: FrameVtable = FrameVtable {
        resume: Self::resume,
        destroy: Self::destroy,
        set_continuation: frame_is_not_awaitable,
        is_finished: frame_has_no_result,
    };

    unsafe fn resume(ptr: *const ()) -> RawHandle {
        let frame = unsafe { &*(ptr as *const FireFrame) };
        let sibling = frame.sibling.handle();

        if !unsafe { sibling.is_finished() } {
            unsafe { sibling.set_continuation(RawHandle::new(ptr, &Self::VTABLE)) };
            return sibling;
        }

        // Final suspension: this frame owns itself. Free it (dropping the
        // owned task with it) and hand the worker back to its loop.
        drop(unsafe { Box::from_raw(ptr as *mut FireFrame) });
        RawHandle::noop()
    }

    unsafe fn destroy(ptr: *const ()) {
        drop(unsafe { Box::from_raw(ptr as *mut FireFrame) });
    }
}

unsafe fn frame_is_not_awaitable(_ptr: *const (), _continuation: RawHandle) {
    unreachable!("fire-and-forget frames cannot be awaited");
}

unsafe fn frame_has_no_result(_ptr: *const ()) -> bool {
    unreachable!("fire-and-forget frames carry no result");
}

fn enqueue_all(tasks: impl OwnedTaskSet, submit: impl Fn(Queued)) {
    let mut siblings = Vec::new();
    tasks.into_siblings(&mut siblings);
    for sibling in siblings {
        let frame = Box::into_raw(Box::new(FireFrame { sibling }));
        submit(Queued {
            handle: RawHandle::new(frame as *const (), &FireFrame::VTABLE),
            // discarded-at-shutdown frames are the pool's to destroy:
            // nothing above the pool owns them
            lifetime: TaskLifetime::PoolManaged,
        });
    }
}

/// Fire and forget: run the tasks on the current worker's pool without any
/// way to wait for them or read their results.
///
/// Only owned tasks are accepted; the runtime takes over their frames and
/// frees each one the moment it completes. Tasks still queued when the pool
/// shuts down are destroyed without running. Must be called from inside a
/// running task; use [`enqueue_tasks_on`] from outside the pool.
pub fn enqueue_tasks(tasks: impl OwnedTaskSet) {
    ctx::with_current_pool(|pool| {
        enqueue_all(tasks, |entry| pool.submit_external(entry));
    });
}

/// [`enqueue_tasks`] with an explicit target pool; callable from any thread.
pub fn enqueue_tasks_on(pool: &ThreadPool, tasks: impl OwnedTaskSet) {
    enqueue_all(tasks, |entry| pool.add_task_from_outside(entry));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::start::start_sync;
    use crate::task::Task;

    use super::*;

    fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.load(SeqCst) != expected {
            assert!(Instant::now() < deadline, "enqueued tasks never finished");
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_enqueue_from_outside() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<()>> = (0..32)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Task::new(async move {
                    counter.fetch_add(1, SeqCst);
                })
            })
            .collect();
        enqueue_tasks_on(&pool, tasks);

        wait_for_count(&counter, 32);
    }

    #[test]
    fn test_enqueue_from_inside_a_task() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_in = Arc::clone(&counter);
        let task = Task::new(async move {
            let fired = Arc::clone(&counter_in);
            enqueue_tasks(Task::new(async move {
                fired.fetch_add(1, SeqCst);
            }));
        });
        start_sync(&pool, &task);

        wait_for_count(&counter, 1);
    }

    #[test]
    fn test_enqueued_frames_discarded_on_shutdown() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(0);

        let tasks: Vec<Task<()>> = (0..10)
            .map(|_| {
                let guard = Guard(Arc::clone(&drops));
                Task::new(async move {
                    let _guard = guard;
                })
            })
            .collect();
        enqueue_tasks_on(&pool, tasks);

        drop(pool);
        // wrapper frames and the tasks inside them were all freed, unrun
        assert_eq!(drops.load(SeqCst), 10);
    }

    #[test]
    #[should_panic(expected = "only valid on a pool worker thread")]
    fn test_enqueue_without_pool_context() {
        enqueue_tasks(Task::new(async {}));
    }
}
