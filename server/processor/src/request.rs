use crate::processor::WorkerContext;

/// A self-contained unit of work delivered to one worker.
pub trait Request: Send + 'static {
    fn execute(self: Box<Self>, ctx: &mut WorkerContext);

    /// Pin execution to a specific worker; None lets the processor pick
    /// one round-robin.
    fn thread_affinity(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "Request"
    }
}

struct FnRequest<F> {
    f: F,
    affinity: Option<usize>,
}

impl<F: FnOnce(&mut WorkerContext) + Send + 'static> Request for FnRequest<F> {
    fn execute(self: Box<Self>, ctx: &mut WorkerContext) {
        (self.f)(ctx)
    }

    fn thread_affinity(&self) -> Option<usize> {
        self.affinity
    }

    fn name(&self) -> &'static str {
        "FnRequest"
    }
}

pub fn request(f: impl FnOnce(&mut WorkerContext) + Send + 'static) -> Box<dyn Request> {
    Box::new(FnRequest { f, affinity: None })
}

pub fn request_with_affinity(
    worker: usize,
    f: impl FnOnce(&mut WorkerContext) + Send + 'static,
) -> Box<dyn Request> {
    Box::new(FnRequest { f, affinity: Some(worker) })
}
