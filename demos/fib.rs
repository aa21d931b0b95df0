//! The classic fork/join benchmark shape: naive recursive Fibonacci where
//! every pair of recursive calls is a fork.

use forkjoin::{start_sync, wait_tasks, Task, ThreadPool};

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

fn main() {
    let task = fib(10);

    {
        let pool = ThreadPool::new(4);
        start_sync(&pool, &task);
    } // dropping the pool joins all worker threads

    println!("the 10th fibonacci number is : {}", *task);
}
