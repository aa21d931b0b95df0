//! A work-stealing runtime for structured fork/join parallelism on
//! stackless coroutines.
//!
//! Application code writes `async` bodies that fork sub-computations and
//! suspend until they finish; the runtime multiplexes a large number of
//! such suspended frames over a small, fixed pool of OS threads. A
//! [`Task<T>`] is a lazily started frame carrying either its value or a
//! captured failure; [`wait_tasks`] suspends the parent and resumes it
//! exactly once, when the last sibling finishes; [`start_sync`] /
//! [`start_async`] bridge from outside the pool in.
//!
//! ```
//! use forkjoin::{start_sync, wait_tasks, Task, ThreadPool};
//!
//! fn fib(n: u64) -> Task<u64> {
//!     Task::new(async move {
//!         if n < 2 {
//!             return n;
//!         }
//!         let a = fib(n - 1);
//!         let b = fib(n - 2);
//!         // fork: the children go up for grabs, this frame suspends until
//!         // both are done
//!         wait_tasks((&a, &b)).await;
//!         *a + *b
//!     })
//! }
//!
//! let pool = ThreadPool::new(4);
//! let task = fib(10);
//! start_sync(&pool, &task);
//! assert_eq!(*task, 55);
//! ```
//!
//! Each worker owns a lock-free Chase–Lev deque and eats it LIFO from the
//! bottom, which keeps a fork/join computation depth-first and cache-warm
//! on one thread; idle workers steal FIFO from the top of a random victim,
//! which carries the widest subtrees away. Work submitted from outside the
//! pool enters through a shared injection queue. Suspended frames hand
//! control to each other directly (a resume returns the next frame to run,
//! and the worker loop trampolines), so deep await chains cost neither
//! stack nor scheduler round-trips.
//!
//! Failures never propagate across a join: a panic escaping a task body is
//! captured into that task's result slot, the parent always resumes, and
//! partial success is left for the caller to interpret. See
//! [`Task::error`].
//!
//! There is no cancellation, no I/O reactor, no timers, and no fairness
//! beyond randomized stealing. Dropping the [`ThreadPool`] stops the
//! workers and discards work that never started; a running frame always
//! runs to its next suspension.
//!
//! Awaiting runtime awaitables ([`Task::join`], [`wait_tasks`],
//! [`wait_tasks_async`]) is only supported inside tasks running on a pool
//! worker; foreign futures have no way to name a transfer target and are
//! not supported inside task bodies.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

mod chain;
mod deque;
mod enqueue;
mod handle;
mod pool;
mod start;
mod sync;
mod task;
mod wait;

pub use chain::{chain_from, chain_tasks, Chain};
pub use enqueue::{enqueue_tasks, enqueue_tasks_on};
pub use pool::ThreadPool;
pub use start::{start_async, start_sync, StartHandle};
pub use task::{JoinTask, Task, TaskResult};
pub use wait::{
    wait_tasks, wait_tasks_async, wait_tasks_on, OwnedTaskSet, Sibling, TaskSet, WaitTasks,
    WaitTasksAsync,
};
