//! The storage-thread pool of a storage shard. Worker threads never touch
//! the local log store directly; they enqueue [`StorageTask`]s here and
//! get completions called back when the I/O is done.

mod metrics;
pub mod pool;
pub mod prioritized_queue;
pub mod semaphore;
pub mod task;

pub use pool::{Params, StorageThreadPool, TaskQueueParams};
pub use prioritized_queue::PrioritizedQueue;
pub use semaphore::Semaphore;
pub use task::{Durability, StorageTask, StorageTaskContext, TaskPriority, ThreadType};
