//! The worker model: single-threaded cooperative event loops fed by an
//! MPSC request pump. Anything that must run on a particular worker is
//! expressed as a [`Request`] posted to it; request execution, timer
//! callbacks and completion callbacks on one worker are mutually exclusive
//! because they all run on its one thread.

pub mod processor;
pub mod request;
pub mod timer;

pub use processor::{Processor, WorkerContext, WorkerType};
pub use request::{request, request_with_affinity, Request};
pub use timer::Timers;
