use crate::metrics;
use crate::prioritized_queue::{PrioritizedQueue, QueueItem};
use crate::task::{Durability, StorageTask, StorageTaskContext, TaskPriority, ThreadType};
use crossbeam::channel;
use enum_map::EnumMap;
use logd_primitives::{ShardIndex, Status};
use logd_store::LogsDb;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct TaskEnvelope(Box<dyn StorageTask>);

impl QueueItem for TaskEnvelope {
    fn item_priority(&self) -> usize {
        self.0.priority().index()
    }
    fn item_cost(&self) -> usize {
        self.0.payload_size()
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct TaskQueueParams {
    pub nthreads: usize,
}

pub type Params = EnumMap<ThreadType, TaskQueueParams>;

type SyncSender = channel::Sender<(Box<dyn StorageTask>, Status)>;

struct PerTypeQueue {
    queue: PrioritizedQueue<TaskEnvelope>,
    write_queue: PrioritizedQueue<TaskEnvelope>,
    tasks_to_drop: AtomicI64,
}

struct PoolInner {
    shard_idx: ShardIndex,
    store: Arc<LogsDb>,
    queues: EnumMap<ThreadType, PerTypeQueue>,
    shutting_down: AtomicBool,
    persist_on_shutdown: AtomicBool,
    write_batch_size: usize,
    write_batch_bytes: usize,
}

/// A pool of threads doing I/O against one LogsDB shard. Four thread
/// classes, each with an independent prioritized queue plus a write queue
/// drained in single-priority batches. One syncing thread per pool fsyncs
/// the WAL for SYNC_WRITE tasks.
pub struct StorageThreadPool {
    inner: Arc<PoolInner>,
    exec_threads: Vec<JoinHandle<()>>,
    sync_sender: Option<SyncSender>,
    sync_thread: Option<JoinHandle<()>>,
    params: Params,
}

const IDLE_POLL: Duration = Duration::from_millis(100);

impl StorageThreadPool {
    pub fn new(
        shard_idx: ShardIndex,
        params: Params,
        store: Arc<LogsDb>,
        task_queue_size: usize,
        write_batch_size: usize,
        write_batch_bytes: usize,
    ) -> StorageThreadPool {
        let inner = Arc::new(PoolInner {
            shard_idx,
            store,
            queues: EnumMap::from_fn(|_| PerTypeQueue {
                queue: PrioritizedQueue::new(TaskPriority::NUM, task_queue_size),
                write_queue: PrioritizedQueue::new(TaskPriority::NUM, task_queue_size),
                tasks_to_drop: AtomicI64::new(0),
            }),
            shutting_down: AtomicBool::new(false),
            persist_on_shutdown: AtomicBool::new(false),
            write_batch_size,
            write_batch_bytes,
        });

        let (sync_sender, sync_receiver) = channel::unbounded();

        let mut exec_threads = Vec::new();
        for (thread_type, queue_params) in params.iter() {
            for i in 0..queue_params.nthreads {
                let inner = inner.clone();
                let sync_sender = sync_sender.clone();
                let name: &'static str = thread_type.into();
                exec_threads.push(
                    std::thread::Builder::new()
                        .name(format!("logd:s{}:{}:{}", shard_idx, name, i))
                        .spawn(move || exec_thread_loop(inner, thread_type, sync_sender))
                        .expect("spawning a storage thread"),
                );
            }
        }

        let sync_thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("logd:s{}:sync", shard_idx))
                .spawn(move || syncing_thread_loop(inner, sync_receiver))
                .expect("spawning the syncing thread")
        };

        StorageThreadPool {
            inner,
            exec_threads,
            sync_sender: Some(sync_sender),
            sync_thread: Some(sync_thread),
            params,
        }
    }

    pub fn shard_idx(&self) -> ShardIndex {
        self.inner.shard_idx
    }

    pub fn store(&self) -> &Arc<LogsDb> {
        &self.inner.store
    }

    /// FAST_STALLABLE write stalling only makes sense if such threads
    /// exist.
    pub fn write_stalling_enabled(&self) -> bool {
        self.params[ThreadType::FastStallable].nthreads > 0
    }

    pub fn try_put_task(
        &self,
        task: Box<dyn StorageTask>,
    ) -> Result<(), (Status, Box<dyn StorageTask>)> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err((Status::Shutdown, task));
        }
        let queues = &self.inner.queues[task.thread_type()];
        let target = if task.is_write_task() { &queues.write_queue } else { &queues.queue };
        target
            .write_if_not_full(TaskEnvelope(task))
            .map_err(|TaskEnvelope(task)| (Status::Nobufs, task))
    }

    pub fn blocking_put_task(
        &self,
        task: Box<dyn StorageTask>,
    ) -> Result<(), (Status, Box<dyn StorageTask>)> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err((Status::Shutdown, task));
        }
        let queues = &self.inner.queues[task.thread_type()];
        let target = if task.is_write_task() { &queues.write_queue } else { &queues.queue };
        target.blocking_write(TaskEnvelope(task));
        Ok(())
    }

    /// Marks every currently queued task of the class for dropping; the
    /// pool threads discard them with `on_dropped` on the next drain.
    pub fn drop_task_queue(&self, thread_type: ThreadType) {
        let queues = &self.inner.queues[thread_type];
        let backlog = (queues.queue.len() + queues.write_queue.len()) as i64;
        if backlog > 0 {
            tracing::warn!(
                target: "storage",
                shard = self.inner.shard_idx,
                class = ?thread_type,
                backlog,
                "dropping queued storage tasks under overload"
            );
            queues.tasks_to_drop.fetch_max(backlog, Ordering::AcqRel);
        }
    }

    /// Initiates shutdown: puts start failing with SHUTDOWN, threads
    /// finish (or drop) queued tasks and exit.
    pub fn shut_down(&self, persist_record_caches: bool) {
        self.inner.persist_on_shutdown.store(persist_record_caches, Ordering::Release);
        self.inner.shutting_down.store(true, Ordering::Release);
    }

    /// Second phase: waits for every thread.
    pub fn join(&mut self) {
        for handle in self.exec_threads.drain(..) {
            let _ = handle.join();
        }
        // Closing the channel lets the syncing thread drain and exit.
        self.sync_sender = None;
        if let Some(handle) = self.sync_thread.take() {
            let _ = handle.join();
        }
    }

    /// Visits queued tasks of every class for admin introspection.
    pub fn introspect(&self, mut cb: impl FnMut(ThreadType, &'static str)) {
        for (thread_type, queues) in self.inner.queues.iter() {
            queues.queue.introspect_contents(|t| cb(thread_type, t.0.name()));
            queues.write_queue.introspect_contents(|t| cb(thread_type, t.0.name()));
        }
    }
}

impl Drop for StorageThreadPool {
    fn drop(&mut self) {
        self.shut_down(self.inner.persist_on_shutdown.load(Ordering::Acquire));
        self.join();
    }
}

fn run_task(inner: &PoolInner, sync_sender: &SyncSender, mut task: Box<dyn StorageTask>) {
    let mut ctx = StorageTaskContext { store: &inner.store, shard_idx: inner.shard_idx };
    let status = task.execute(&mut ctx);
    metrics::TASKS_EXECUTED.inc();
    if status == Status::Ok && task.durability() == Durability::SyncWrite {
        match sync_sender.send((task, status)) {
            Ok(()) => return,
            Err(channel::SendError((mut task, _))) => {
                // The syncing thread is gone; make the write durable here
                // before completing.
                let status = inner.store.flush_wal(true).err().unwrap_or(Status::Ok);
                if status == Status::Ok {
                    task.on_synced();
                }
                task.on_done(status);
                return;
            }
        }
    }
    task.on_done(status);
}

fn maybe_drop_task(
    inner: &PoolInner,
    thread_type: ThreadType,
    task: Box<dyn StorageTask>,
) -> Option<Box<dyn StorageTask>> {
    let counter = &inner.queues[thread_type].tasks_to_drop;
    if counter.load(Ordering::Acquire) <= 0 || !task.is_droppable() {
        return Some(task);
    }
    if counter.fetch_sub(1, Ordering::AcqRel) <= 0 {
        // Another thread consumed the last drop token.
        counter.fetch_add(1, Ordering::AcqRel);
        return Some(task);
    }
    metrics::TASKS_DROPPED.inc();
    task.on_dropped();
    None
}

fn exec_thread_loop(inner: Arc<PoolInner>, thread_type: ThreadType, sync_sender: SyncSender) {
    loop {
        let queues = &inner.queues[thread_type];
        let shutting_down = inner.shutting_down.load(Ordering::Acquire);
        let persist = inner.persist_on_shutdown.load(Ordering::Acquire);

        // Batched writes first so the write queue cannot be starved by a
        // stream of non-write tasks.
        let batch = queues
            .write_queue
            .read_batch_single_priority(inner.write_batch_size, inner.write_batch_bytes);
        if !batch.is_empty() {
            for TaskEnvelope(task) in batch {
                if shutting_down && !persist && task.is_droppable() {
                    task.on_dropped();
                    continue;
                }
                if let Some(task) = maybe_drop_task(&inner, thread_type, task) {
                    run_task(&inner, &sync_sender, task);
                }
            }
            continue;
        }

        match queues.queue.read_timeout(IDLE_POLL) {
            Some(TaskEnvelope(task)) => {
                if shutting_down && !persist && task.is_droppable() {
                    task.on_dropped();
                    continue;
                }
                if let Some(task) = maybe_drop_task(&inner, thread_type, task) {
                    run_task(&inner, &sync_sender, task);
                }
            }
            None => {
                if shutting_down && queues.queue.is_empty() && queues.write_queue.is_empty() {
                    return;
                }
            }
        }
    }
}

fn syncing_thread_loop(
    inner: Arc<PoolInner>,
    receiver: channel::Receiver<(Box<dyn StorageTask>, Status)>,
) {
    loop {
        // Block for the first task, then opportunistically drain the
        // channel so one fsync covers the whole batch. The channel
        // disconnects when the pool drops its sender after the exec
        // threads joined, at which point nothing more can arrive.
        let first = match receiver.recv() {
            Ok(item) => item,
            Err(channel::RecvError) => return,
        };
        let mut batch = vec![first];
        while let Ok(item) = receiver.try_recv() {
            batch.push(item);
        }

        let flush_status = inner.store.flush_wal(true).err().unwrap_or(Status::Ok);
        for (mut task, exec_status) in batch {
            let status = if flush_status == Status::Ok { exec_status } else { flush_status };
            if status == Status::Ok {
                task.on_synced();
            }
            task.on_done(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::Semaphore;
    use logd_primitives::RecordTimestamp;
    use logd_store::LogsDbSettings;
    use std::sync::atomic::AtomicUsize;

    fn open_store(dir: &tempfile::TempDir) -> Arc<LogsDb> {
        Arc::new(LogsDb::open(dir.path(), 0, LogsDbSettings::test(), RecordTimestamp(1000)).unwrap())
    }

    fn params(slow: usize, stallable: usize) -> Params {
        let mut p = Params::default();
        p[ThreadType::Slow].nthreads = slow;
        p[ThreadType::FastStallable].nthreads = stallable;
        p
    }

    struct SimpleTask {
        sem: Arc<Semaphore>,
    }

    impl StorageTask for SimpleTask {
        fn execute(&mut self, _ctx: &mut StorageTaskContext<'_>) -> Status {
            self.sem.post();
            Status::Ok
        }
        fn on_done(self: Box<Self>, _status: Status) {}
        fn on_dropped(self: Box<Self>) {
            panic!("SimpleTask must not be dropped");
        }
    }

    /// Spins up the pool, has it do trivial tasks, verifies that the pool
    /// can cleanly shut down.
    #[test]
    fn basic() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = StorageThreadPool::new(0, params(4, 0), open_store(&dir), 16, 32, 1 << 20);

        let sem = Arc::new(Semaphore::new(0));
        // Intentionally more tasks than queue slots.
        let ntasks = 3 * 16;
        for _ in 0..ntasks {
            pool.blocking_put_task(Box::new(SimpleTask { sem: sem.clone() })).unwrap();
        }
        for _ in 0..ntasks {
            sem.wait();
        }
        pool.shut_down(true);
        pool.join();
    }

    struct SyncingTask {
        executed: Arc<AtomicBool>,
        synced: Arc<AtomicBool>,
        done: Arc<Semaphore>,
    }

    impl StorageTask for SyncingTask {
        fn execute(&mut self, _ctx: &mut StorageTaskContext<'_>) -> Status {
            // Simulate a slow I/O op.
            std::thread::sleep(Duration::from_millis(100));
            self.executed.store(true, Ordering::Release);
            Status::Ok
        }
        fn durability(&self) -> Durability {
            Durability::SyncWrite
        }
        fn is_droppable(&self) -> bool {
            false
        }
        fn on_synced(&mut self) {
            assert!(self.executed.load(Ordering::Acquire));
            self.synced.store(true, Ordering::Release);
        }
        fn on_done(self: Box<Self>, status: Status) {
            assert_eq!(status, Status::Ok);
            self.done.post();
        }
        fn on_dropped(self: Box<Self>) {
            panic!("syncing task dropped");
        }
    }

    /// A task that needs syncing is not dropped on the floor during
    /// shutdown: it executes, syncs, and completes.
    #[test]
    fn syncing_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let executed = Arc::new(AtomicBool::new(false));
        let synced = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Semaphore::new(0));
        let mut pool = StorageThreadPool::new(0, params(1, 0), open_store(&dir), 16, 32, 1 << 20);
        pool.try_put_task(Box::new(SyncingTask {
            executed: executed.clone(),
            synced: synced.clone(),
            done: done.clone(),
        }))
        .unwrap();

        pool.shut_down(true);
        pool.join();
        done.wait();
        assert!(executed.load(Ordering::Acquire));
        assert!(synced.load(Ordering::Acquire));
    }

    #[test]
    fn puts_fail_with_shutdown_once_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorageThreadPool::new(0, params(1, 0), open_store(&dir), 16, 32, 1 << 20);
        pool.shut_down(false);
        let sem = Arc::new(Semaphore::new(0));
        let err = pool.try_put_task(Box::new(SimpleTask { sem })).err().unwrap();
        assert_eq!(err.0, Status::Shutdown);
    }

    struct CountedTask {
        executed: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
        done: Arc<Semaphore>,
    }

    impl StorageTask for CountedTask {
        fn execute(&mut self, _ctx: &mut StorageTaskContext<'_>) -> Status {
            self.executed.fetch_add(1, Ordering::AcqRel);
            Status::Ok
        }
        fn on_done(self: Box<Self>, _status: Status) {
            self.done.post();
        }
        fn on_dropped(self: Box<Self>) {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            self.done.post();
        }
    }

    #[test]
    fn overload_drop_discards_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        // No threads yet: queue tasks first so the drop marker sees them.
        let mut pool = StorageThreadPool::new(0, params(0, 0), open_store(&dir), 16, 32, 1 << 20);
        let executed = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..4 {
            pool.try_put_task(Box::new(CountedTask {
                executed: executed.clone(),
                dropped: dropped.clone(),
                done: done.clone(),
            }))
            .unwrap();
        }
        pool.drop_task_queue(ThreadType::Slow);

        // Now start a thread to drain the queue: all four were marked.
        let inner = pool.inner.clone();
        let (tx, _rx) = channel::unbounded();
        let handle = std::thread::spawn(move || exec_thread_loop(inner, ThreadType::Slow, tx));
        for _ in 0..4 {
            done.wait();
        }
        assert_eq!(dropped.load(Ordering::Acquire), 4);
        assert_eq!(executed.load(Ordering::Acquire), 0);
        pool.shut_down(false);
        handle.join().unwrap();
        pool.join();
    }
}
