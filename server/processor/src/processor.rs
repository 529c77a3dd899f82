use crate::request::Request;
use crate::timer::Timers;
use crossbeam_channel as channel;
use logd_primitives::Status;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WorkerType {
    General,
    /// The failure detector runs on its own worker so gossip is never
    /// queued behind data-path work.
    FailureDetector,
}

enum WorkerEvent {
    Request(Box<dyn Request>),
    Shutdown,
}

struct WorkerHandle {
    tx: channel::Sender<WorkerEvent>,
}

struct ProcessorCore {
    workers: Vec<WorkerHandle>,
    failure_detector: WorkerHandle,
    next_rr: AtomicUsize,
    shutting_down: AtomicBool,
}

impl ProcessorCore {
    fn post_event(&self, handle: &WorkerHandle, req: Box<dyn Request>) -> Result<(), Status> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Status::Shutdown);
        }
        handle.tx.send(WorkerEvent::Request(req)).map_err(|_| Status::Shutdown)
    }
}

/// State visible to requests while they run. One per worker thread.
pub struct WorkerContext {
    pub idx: usize,
    pub worker_type: WorkerType,
    core: Arc<ProcessorCore>,
}

impl WorkerContext {
    /// Posts to another worker (or this one; it will run on a later pump
    /// iteration).
    pub fn post_to(&self, idx: usize, req: Box<dyn Request>) -> Result<(), Status> {
        let handle = self.core.workers.get(idx).ok_or(Status::InvalidParam)?;
        self.core.post_event(handle, req)
    }
}

/// Owns the worker threads and routes requests to them.
pub struct Processor {
    core: Arc<ProcessorCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pub timers: Timers,
}

impl Processor {
    pub fn new(num_workers: usize) -> Arc<Processor> {
        assert!(num_workers > 0);
        let mut workers = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers + 1);
        for idx in 0..num_workers {
            let (tx, rx) = channel::unbounded();
            workers.push(WorkerHandle { tx });
            receivers.push((idx, WorkerType::General, rx));
        }
        let (fd_tx, fd_rx) = channel::unbounded();
        receivers.push((num_workers, WorkerType::FailureDetector, fd_rx));

        let core = Arc::new(ProcessorCore {
            workers,
            failure_detector: WorkerHandle { tx: fd_tx },
            next_rr: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        for (idx, worker_type, rx) in receivers {
            let core = core.clone();
            let name = match worker_type {
                WorkerType::General => format!("logd:w{}", idx),
                WorkerType::FailureDetector => "logd:fd".to_owned(),
            };
            threads.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || worker_loop(idx, worker_type, core, rx))
                    .expect("spawning a worker thread"),
            );
        }

        Arc::new(Processor { core, threads: Mutex::new(threads), timers: Timers::new() })
    }

    pub fn worker_count(&self) -> usize {
        self.core.workers.len()
    }

    /// Routes by the request's affinity, or round-robin.
    pub fn post(&self, req: Box<dyn Request>) -> Result<(), Status> {
        match req.thread_affinity() {
            Some(idx) => self.post_to(idx, req),
            None => {
                let idx = self.core.next_rr.fetch_add(1, Ordering::Relaxed) % self.worker_count();
                self.post_to(idx, req)
            }
        }
    }

    pub fn post_to(&self, idx: usize, req: Box<dyn Request>) -> Result<(), Status> {
        let handle = self.core.workers.get(idx).ok_or(Status::InvalidParam)?;
        self.core.post_event(handle, req)
    }

    /// Important requests must not be lost; the pump is unbounded so the
    /// only failure is shutdown, which callers treat as fatal-but-quiet.
    pub fn post_important(&self, req: Box<dyn Request>) -> Result<(), Status> {
        self.post(req)
    }

    pub fn post_to_failure_detector(&self, req: Box<dyn Request>) -> Result<(), Status> {
        self.core.post_event(&self.core.failure_detector, req)
    }

    /// Posts one request built per worker index to every general worker.
    pub fn post_to_all(&self, mut make: impl FnMut(usize) -> Box<dyn Request>) {
        for idx in 0..self.worker_count() {
            if let Err(status) = self.post_to(idx, make(idx)) {
                if status != Status::Shutdown {
                    tracing::error!(target: "processor", worker = idx, %status, "failed to post to worker");
                }
            }
        }
    }

    pub fn post_delayed(self: &Arc<Self>, delay: Duration, req: Box<dyn Request>) {
        let this = Arc::downgrade(self);
        self.timers.schedule(delay, move || {
            if let Some(processor) = this.upgrade() {
                let _ = processor.post(req);
            }
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.shutting_down.load(Ordering::Acquire)
    }

    /// Stops accepting requests, lets the pumps drain, and joins every
    /// worker. Returns false if the timeout expired with threads still
    /// running; the caller escalates to a failed exit.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.core.shutting_down.store(true, Ordering::Release);
        for worker in &self.core.workers {
            let _ = worker.tx.send(WorkerEvent::Shutdown);
        }
        let _ = self.core.failure_detector.tx.send(WorkerEvent::Shutdown);
        self.timers.shutdown();

        let deadline = Instant::now() + timeout;
        let mut threads = self.threads.lock();
        while let Some(handle) = threads.pop() {
            if Instant::now() > deadline {
                tracing::error!(target: "processor", "shutdown timeout expired with workers still running");
                return false;
            }
            if handle.join().is_err() {
                tracing::error!(target: "processor", "worker thread panicked during shutdown");
            }
        }
        true
    }
}

fn worker_loop(
    idx: usize,
    worker_type: WorkerType,
    core: Arc<ProcessorCore>,
    rx: channel::Receiver<WorkerEvent>,
) {
    let mut ctx = WorkerContext { idx, worker_type, core };
    tracing::debug!(target: "processor", worker = idx, ?worker_type, "worker started");
    while let Ok(event) = rx.recv() {
        match event {
            WorkerEvent::Request(req) => req.execute(&mut ctx),
            WorkerEvent::Shutdown => break,
        }
    }
    // Drain whatever was queued before the shutdown marker.
    while let Ok(WorkerEvent::Request(req)) = rx.try_recv() {
        req.execute(&mut ctx);
    }
    tracing::debug!(target: "processor", worker = idx, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request, request_with_affinity};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn affinity_routes_to_the_right_worker() {
        let processor = Processor::new(4);
        let (tx, rx) = channel::unbounded();
        for i in 0..4 {
            let tx = tx.clone();
            processor
                .post(request_with_affinity(i, move |ctx| tx.send(ctx.idx).unwrap()))
                .unwrap();
        }
        let mut seen: Vec<usize> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(processor.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn per_worker_requests_run_in_post_order() {
        let processor = Processor::new(2);
        let (tx, rx) = channel::unbounded();
        for i in 0..100u32 {
            let tx = tx.clone();
            processor.post(request_with_affinity(0, move |_| tx.send(i).unwrap())).unwrap();
        }
        let seen: Vec<u32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(processor.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn posts_fail_after_shutdown() {
        let processor = Processor::new(1);
        assert!(processor.shutdown(Duration::from_secs(5)));
        let result = processor.post(request(|_| {}));
        assert_eq!(result.err(), Some(Status::Shutdown));
    }

    #[test]
    fn post_delayed_fires() {
        let processor = Processor::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::unbounded();
        let hits2 = hits.clone();
        processor.post_delayed(
            Duration::from_millis(10),
            request(move |_| {
                hits2.fetch_add(1, Ordering::Relaxed);
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(processor.shutdown(Duration::from_secs(5)));
    }
}
