use logd_processor::{request_with_affinity, Processor};
use std::sync::Arc;

/// How AllSequencers reaches the workers: activation completions fan out
/// to every worker, epoch-store completions land on any one of them.
pub trait WorkerFanout: Send + Sync {
    fn worker_count(&self) -> usize;
    fn post_to(&self, worker: usize, f: Box<dyn FnOnce() + Send>);
    fn post_any(&self, f: Box<dyn FnOnce() + Send>);
}

pub struct ProcessorFanout(pub Arc<Processor>);

impl WorkerFanout for ProcessorFanout {
    fn worker_count(&self) -> usize {
        self.0.worker_count()
    }

    fn post_to(&self, worker: usize, f: Box<dyn FnOnce() + Send>) {
        let _ = self.0.post_to(worker, request_with_affinity(worker, move |_| f()));
    }

    fn post_any(&self, f: Box<dyn FnOnce() + Send>) {
        let _ = self.0.post(logd_processor::request(move |_| f()));
    }
}

/// Runs everything inline on the calling thread; used by tests where
/// deterministic synchronous execution matters more than worker affinity.
pub struct InlineFanout {
    pub workers: usize,
}

impl WorkerFanout for InlineFanout {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn post_to(&self, _worker: usize, f: Box<dyn FnOnce() + Send>) {
        f()
    }

    fn post_any(&self, f: Box<dyn FnOnce() + Send>) {
        f()
    }
}
