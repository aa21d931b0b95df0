//! Fire-and-forget: enqueued tasks run unwatched and free themselves. The
//! runtime only promises that whatever it discards at shutdown is freed.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use forkjoin::{enqueue_tasks, enqueue_tasks_on, start_sync, Task, ThreadPool};

fn add_one(counter: Arc<AtomicI32>) -> Task<()> {
    Task::new(async move {
        counter.fetch_add(1, Ordering::Relaxed);
    })
}

fn increase_counter(other: Arc<ThreadPool>, counter: Arc<AtomicI32>) -> Task<()> {
    Task::new(async move {
        // Enqueued tasks cannot be awaited; their frames are freed the
        // moment they complete.
        enqueue_tasks(add_one(Arc::clone(&counter)));

        // This variant enqueues into a different pool's queue.
        enqueue_tasks_on(&other, add_one(counter));
    })
}

fn main() {
    let pool = ThreadPool::new(2);
    let pool2 = Arc::new(ThreadPool::new(2));

    let counter = Arc::new(AtomicI32::new(0));
    let t = increase_counter(Arc::clone(&pool2), Arc::clone(&counter));

    start_sync(&pool, &t);

    // start_sync only waited for `t` itself, so the enqueued tasks may or
    // may not have run yet: 0, 1 and 2 are all honest answers.
    println!("counter value : {}", counter.load(Ordering::Relaxed));
}
