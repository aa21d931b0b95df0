use std::sync::{Condvar, Mutex};

/// A one-shot latch: opened exactly once, waited on any number of times
/// (waits after the latch opened return immediately).
///
/// This is the meeting point between the pool and the external thread that
/// submitted a start frame: the frame opens the latch at its final
/// suspension, the submitting thread blocks in [`wait`](Latch::wait). It is
/// the only primitive in the runtime an external thread blocks on; workers
/// never touch it except to open it.
#[derive(Debug)]
pub(crate) struct Latch {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Latch {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Open the latch and wake all waiters. Panics if called twice.
    ///
    /// For a frame that frees itself through its waiter, this must be the
    /// last thing the frame does: a waiter may dispose of the latch the
    /// moment its `wait` returns.
    pub(crate) fn open(&self) {
        let mut opened = self.opened.lock().unwrap();
        assert!(!*opened, "one-shot latch opened twice");
        *opened = true;
        self.cond.notify_all();
    }

    /// Block until the latch opens.
    pub(crate) fn wait(&self) {
        let opened = self.opened.lock().unwrap();
        let _opened = self.cond.wait_while(opened, |opened| !*opened).unwrap();
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn test_wait_after_open_returns_immediately() {
        let latch = Latch::new();
        assert_eq!(latch.is_open(), false);
        latch.open();
        assert_eq!(latch.is_open(), true);
        latch.wait();
        latch.wait();
    }

    #[test]
    #[should_panic]
    fn test_double_open() {
        let latch = Latch::new();
        latch.open();
        latch.open();
    }

    #[test]
    fn test_blocking() {
        let latch = Latch::new();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let start = Instant::now();
                latch.wait();
                start.elapsed()
            });

            let sleep_duration = Duration::from_millis(200);
            std::thread::sleep(sleep_duration);
            latch.open();

            let wait_duration = waiter.join().unwrap();
            let threshold = Duration::from_millis(40);
            assert!(wait_duration > sleep_duration - threshold);
        });
    }

    #[test]
    fn test_many_waiters() {
        let latch = Latch::new();

        std::thread::scope(|s| {
            for _ in 0..5 {
                s.spawn(|| latch.wait());
            }
            std::thread::sleep(Duration::from_millis(20));
            latch.open();
        });
    }
}
