use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Action = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct TimerInner {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    cv: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// One shared timer thread firing scheduled actions. Actions run on the
/// timer thread and should immediately post a request to the worker they
/// belong to.
pub struct Timers {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    pub fn new() -> Timers {
        let inner = Arc::new(TimerInner {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        let thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("logd:timers".to_owned())
                .spawn(move || timer_loop(inner))
                .expect("spawning the timer thread")
        };
        Timers { inner, thread: Mutex::new(Some(thread)) }
    }

    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            action: Box::new(action),
        };
        let mut heap = self.inner.heap.lock();
        heap.push(Reverse(entry));
        self.inner.cv.notify_one();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Timers::new()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(inner: Arc<TimerInner>) {
    loop {
        let mut due: Vec<Action> = Vec::new();
        {
            let mut heap = inner.heap.lock();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let now = Instant::now();
                match heap.peek() {
                    Some(Reverse(entry)) if entry.deadline <= now => {
                        due.push(heap.pop().unwrap().0.action);
                    }
                    Some(Reverse(entry)) => {
                        if due.is_empty() {
                            let deadline = entry.deadline;
                            inner.cv.wait_until(&mut heap, deadline);
                            continue;
                        }
                        break;
                    }
                    None => {
                        if due.is_empty() {
                            inner.cv.wait(&mut heap);
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        for action in due {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel as channel;

    #[test]
    fn fires_in_deadline_order() {
        let timers = Timers::new();
        let (tx, rx) = channel::unbounded();
        let tx2 = tx.clone();
        timers.schedule(Duration::from_millis(40), move || tx2.send(2).unwrap());
        timers.schedule(Duration::from_millis(10), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let timers = Timers::new();
        timers.shutdown();
        timers.shutdown();
    }
}
