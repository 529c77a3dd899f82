use logd_primitives::{LogId, Status};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// An append parked while its log's sequencer activates. Completion is
/// called exactly once: with Ok when the append should be retried against
/// the now-active sequencer, or with the failure to report to the client.
pub struct PendingAppend {
    pub payload_size: usize,
    pub complete: Box<dyn FnOnce(Status) + Send>,
}

/// Per-worker buffer of appends awaiting sequencer activation. Bounded
/// per log; overflow surfaces as NOBUFS to the client.
pub struct AppenderBuffer {
    inner: Mutex<HashMap<u64, VecDeque<PendingAppend>>>,
    max_per_log: usize,
}

impl AppenderBuffer {
    pub fn new(max_per_log: usize) -> AppenderBuffer {
        AppenderBuffer { inner: Mutex::new(HashMap::new()), max_per_log }
    }

    pub fn buffer_append(&self, log: LogId, pending: PendingAppend) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        let queue = inner.entry(log.0).or_default();
        if queue.len() >= self.max_per_log {
            return Err(Status::Nobufs);
        }
        queue.push_back(pending);
        Ok(())
    }

    pub fn has_buffered(&self, log: LogId) -> bool {
        self.inner.lock().get(&log.0).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Replays every buffered append for the log, in arrival order.
    pub fn process_queue(&self, log: LogId) {
        let drained = self.inner.lock().remove(&log.0);
        if let Some(queue) = drained {
            for pending in queue {
                (pending.complete)(Status::Ok);
            }
        }
    }

    /// Fails every buffered append for the log.
    pub fn send_error(&self, log: LogId, status: Status) {
        let drained = self.inner.lock().remove(&log.0);
        if let Some(queue) = drained {
            for pending in queue {
                (pending.complete)(status);
            }
        }
    }
}
