//! Sequential pipelines over the core: each stage is a task built from the
//! previous stage's value, with failures short-circuiting the rest.

use forkjoin::{chain_from, chain_tasks, start_sync, Task, ThreadPool};

fn add_two(val: i32) -> Task<i32> {
    Task::new(async move { val + 2 })
}

fn multiply_by_six(val: i32) -> Task<i32> {
    Task::new(async move { val * 6 })
}

fn return_three() -> Task<i32> {
    Task::new(async { 3 })
}

fn compute_value() -> Task<i32> {
    Task::new(async {
        let chain = chain_tasks(3)
            .and_then(add_two)
            .and_then(add_two)
            .and_then(multiply_by_six)
            .into_task();

        chain.join().await;

        // A chain's task fails if any stage failed; fall back to -1.
        chain.into_result().unwrap_or(-1)
    })
}

fn compute_value_from_task() -> Task<i32> {
    Task::new(async {
        // A chain can also start from an unexecuted task.
        let chain = chain_from(return_three())
            .and_then(add_two)
            .and_then(multiply_by_six)
            .into_task();

        chain.join().await;

        chain.into_result().unwrap_or(-1)
    })
}

fn main() {
    let pool = ThreadPool::new(2);

    let t1 = compute_value();
    let t2 = compute_value_from_task();

    start_sync(&pool, (&t1, &t2));

    println!("value stored in t1 : {}", *t1);
    println!("value stored in t2 : {}", *t2);
}
