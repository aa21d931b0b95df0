//! Sequential chaining on top of the core: each link is a task built from
//! the previous link's value. This layer only uses public core operations
//! (task construction, the child-await, result extraction).

use std::panic::resume_unwind;

use crate::task::Task;

/// A pipeline of tasks where each stage consumes the previous stage's
/// value. Built with [`chain_tasks`] / [`chain_from`] and extended with
/// [`and_then`](Chain::and_then); the whole chain is one [`Task`] that can
/// be started or awaited like any other.
pub struct Chain<T: Send + 'static> {
    task: Task<T>,
}

/// Start a chain from a plain value.
pub fn chain_tasks<T: Send + 'static>(value: T) -> Chain<T> {
    Chain {
        task: Task::new(async move { value }),
    }
}

/// Start a chain from an existing task.
pub fn chain_from<T: Send + 'static>(task: Task<T>) -> Chain<T> {
    Chain { task }
}

impl<T: Send + 'static> Chain<T> {
    /// Append a stage: once the current end of the chain produces a value,
    /// `f` turns it into the next task.
    ///
    /// Failures short-circuit. A stage that failed re-raises its captured
    /// payload inside the combined task, so later stages never run and the
    /// chain's task carries the original failure.
    pub fn and_then<U, F>(self, f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        let Chain { task } = self;
        Chain {
            task: Task::new(async move {
                task.join().await;
                match task.into_result() {
                    Ok(value) => {
                        let next = f(value);
                        next.join().await;
                        match next.into_result() {
                            Ok(value) => value,
                            Err(failure) => resume_unwind(failure),
                        }
                    }
                    Err(failure) => resume_unwind(failure),
                }
            }),
        }
    }

    /// The task computing the chain's final value.
    pub fn into_task(self) -> Task<T> {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::ThreadPool;
    use crate::start::start_sync;

    use super::*;

    fn add_one(value: i32) -> Task<i32> {
        Task::new(async move { value + 1 })
    }

    fn double(value: i32) -> Task<i32> {
        Task::new(async move { value * 2 })
    }

    fn fail(_value: i32) -> Task<i32> {
        Task::new(async move { panic!("stage failed") })
    }

    #[test]
    fn test_chain_of_values() {
        let pool = ThreadPool::new(2);
        let task = chain_tasks(20).and_then(add_one).and_then(double).into_task();
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }

    #[test]
    fn test_chain_from_task() {
        let pool = ThreadPool::new(2);
        let task = chain_from(Task::new(async { 41 })).and_then(add_one).into_task();
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }

    #[test]
    fn test_chain_failure_short_circuits() {
        let pool = ThreadPool::new(2);
        let task = chain_tasks(0)
            .and_then(fail)
            .and_then(add_one)
            .into_task();
        start_sync(&pool, &task);
        assert_eq!(task.has_value(), false);
        let payload = task.error().unwrap();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "stage failed");
    }

    #[test]
    fn test_chain_with_closures_over_state() {
        let pool = ThreadPool::new(2);
        let offset = 2;
        let task = chain_tasks(String::from("4"))
            .and_then(move |text| Task::new(async move { text.parse::<i32>().unwrap() * 10 + offset }))
            .into_task();
        start_sync(&pool, &task);
        assert_eq!(*task, 42);
    }
}
