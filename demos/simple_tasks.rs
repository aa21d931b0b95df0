//! Basic task execution: two tasks, one of which fails, run to completion
//! on a small pool. Failures are captured into the task, never thrown at
//! the caller.

use forkjoin::{start_sync, Task, ThreadPool};

fn add_value(val: i32) -> Task<i32> {
    Task::new(async move { val + 1 })
}

fn fail_instead(val: i32) -> Task<i32> {
    Task::new(async move {
        panic!("no value for {val} today");
    })
}

fn main() {
    // The pool owns the worker threads; dropping it at the end of main
    // joins them.
    let pool = ThreadPool::new(2);

    // Task objects hold the final values, so they need to outlive the
    // execution; `start_sync` borrows them and blocks until both finished.
    let t1 = add_value(41);
    let t2 = fail_instead(41);

    start_sync(&pool, (&t1, &t2));

    if t1.has_value() {
        println!("t1 value : {}", *t1);
    }

    match t2.error() {
        Some(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<non-string panic payload>");
            println!("t2 failed : {message}");
        }
        None => println!("t2 value : {}", *t2),
    }
}
