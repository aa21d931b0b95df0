//! The three flavors of waiting: same-pool, cross-pool, and asynchronous
//! (schedule now, await later).

use std::sync::Arc;

use forkjoin::{start_async, wait_tasks, wait_tasks_async, wait_tasks_on, Task, ThreadPool};

fn multiply(val: i32, mul: i32) -> Task<i32> {
    Task::new(async move { val * mul })
}

/// Waits for two sibling tasks on the current pool.
fn generate_answer() -> Task<i32> {
    Task::new(async {
        let t1 = multiply(20, 2);

        // Owned siblings work too, but their results die with the wait;
        // borrow what you want to read afterwards.
        wait_tasks((&t1, multiply(20, 2))).await;

        *t1 + 2
    })
}

/// Same, but the siblings (and this task, once resumed) run on `other`.
fn generate_answer_on(other: Arc<ThreadPool>) -> Task<i32> {
    Task::new(async move {
        let t1 = multiply(20, 2);

        wait_tasks_on(&other, (&t1, multiply(20, 2))).await;

        *t1 + 2
    })
}

/// Schedules the siblings eagerly, does other work, then awaits.
fn generate_answer_async() -> Task<i32> {
    Task::new(async {
        let pending = wait_tasks_async((multiply(20, 2), multiply(1, 2)));

        // ... other work happens here while the siblings run ...

        // Either suspends, or, when the tasks already finished, just keeps
        // going. Ownership of the set comes back out of the await.
        let (t1, t2) = pending.await;

        *t1 + *t2
    })
}

fn main() {
    let pool = ThreadPool::new(2);
    let pool2 = Arc::new(ThreadPool::new(2));

    let answer = generate_answer();
    let answer_on_pool2 = generate_answer_on(Arc::clone(&pool2));
    let answer_async = generate_answer_async();

    let started = start_async(&pool, (&answer, &answer_on_pool2, &answer_async));

    // blocks unless everything already finished
    started.wait();

    println!("value of answer : {}", *answer);
    println!("value of answer_on_pool2 : {}", *answer_on_pool2);
    println!("value of answer_async : {}", *answer_async);
}
