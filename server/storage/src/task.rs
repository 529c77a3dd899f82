use logd_primitives::{ShardIndex, Status};
use logd_store::LogsDb;

/// Class of storage thread a task runs on. Each class has its own threads
/// and queues so that slow reads cannot starve latency-critical ones.
#[derive(Copy, Clone, PartialEq, Eq, Debug, enum_map::Enum, strum::IntoStaticStr, strum::EnumIter)]
pub enum ThreadType {
    /// Long reads, rebuilding reads, compactions.
    Slow,
    /// Latency-critical reads.
    FastTimeSensitive,
    /// Record writes that may be throttled under back-pressure.
    FastStallable,
    /// Metadata reads and writes, isolated from data contention.
    Metadata,
}

impl ThreadType {
    pub const NUM: usize = 4;
}

/// Priority of a task within its thread class.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, strum::EnumIter)]
#[repr(usize)]
pub enum TaskPriority {
    High = 0,
    Mid = 1,
    Low = 2,
}

impl TaskPriority {
    pub const NUM: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What "done" means for a task.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Durability {
    None,
    Memory,
    AsyncWrite,
    /// After a successful execute the task visits the syncing thread,
    /// which fsyncs the WAL and calls `on_synced` before `on_done`.
    SyncWrite,
}

pub struct StorageTaskContext<'a> {
    pub store: &'a LogsDb,
    pub shard_idx: ShardIndex,
}

/// A unit of local-store I/O executed on a storage thread.
///
/// `on_done`/`on_dropped` are invoked on pool threads and must be cheap
/// and non-blocking; a task that needs to continue on its originating
/// worker posts a request to it from there.
pub trait StorageTask: Send {
    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status;

    fn thread_type(&self) -> ThreadType {
        ThreadType::Slow
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Mid
    }

    fn durability(&self) -> Durability {
        Durability::None
    }

    /// Droppable tasks may be discarded wholesale when a worker decides
    /// the queue is hopelessly backed up.
    fn is_droppable(&self) -> bool {
        true
    }

    /// Record writes go to the per-class write queue and are executed in
    /// batches.
    fn is_write_task(&self) -> bool {
        false
    }

    /// Bytes this task will write; limits write batching.
    fn payload_size(&self) -> usize {
        0
    }

    fn on_synced(&mut self) {}

    fn on_done(self: Box<Self>, status: Status);

    fn on_dropped(self: Box<Self>);

    fn name(&self) -> &'static str {
        "StorageTask"
    }
}
