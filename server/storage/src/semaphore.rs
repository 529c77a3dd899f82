use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore. The standard library has none and the queues need
/// precise token accounting across producer and consumer threads.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Semaphore {
        Semaphore { count: Mutex::new(initial), cv: Condvar::new() }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    pub fn post_n(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        for _ in 0..n {
            self.cv.notify_one();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Returns false if no token could be taken within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cv.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}
