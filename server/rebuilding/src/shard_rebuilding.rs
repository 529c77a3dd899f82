//! One donor's rebuilding run for one shard: reads batches of chunks off
//! the local store, re-replicates each chunk through STOREs to the
//! surviving copyset, reports progress and pauses above the global
//! window.

use crate::metrics;
use crate::planner::RebuildingPlan;
use crate::read_task::{ChunkData, ReadContext, RebuildingReadStorageTask};
use crate::types::RebuildingSet;
use logd_primitives::{Lsn, RecordTimestamp, ShardId, ShardIndex, Status};
use logd_storage::StorageThreadPool;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Re-replicates one chunk; the node assembly implements this with STORE
/// messages (REBUILDING flag, amends for records already present) through
/// the Sender.
pub trait ChunkRereplicator: Send + Sync {
    fn store_chunk(&self, chunk: ChunkData, done: Box<dyn FnOnce(Status) + Send>);
}

/// Events a ShardRebuilding reports back to its coordinator.
pub trait ShardRebuildingListener: Send + Sync {
    fn on_donor_progress(&self, shard: ShardIndex, next_ts: RecordTimestamp, version: Lsn);
    fn on_shard_rebuilding_complete(&self, shard: ShardIndex, version: Lsn);
    fn on_shard_rebuilding_failed(&self, shard: ShardIndex, version: Lsn, status: Status);
}

struct RunState {
    window_end: RecordTimestamp,
    reading: bool,
    /// Set when reading stopped because the next record is above the
    /// window; sliding the window resumes it.
    paused_for_window: bool,
    chunks_in_flight: usize,
    aborted: bool,
    finished: bool,
}

pub struct ShardRebuilding {
    shard: ShardIndex,
    version: Lsn,
    restart_version: Lsn,
    context: Arc<Mutex<ReadContext>>,
    pool: Arc<StorageThreadPool>,
    rereplicator: Arc<dyn ChunkRereplicator>,
    listener: Arc<dyn ShardRebuildingListener>,
    state: Mutex<RunState>,
}

impl ShardRebuilding {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardIndex,
        version: Lsn,
        restart_version: Lsn,
        rebuilding_set: Arc<RebuildingSet>,
        plans: BTreeMap<u64, RebuildingPlan>,
        my_shard: ShardId,
        pool: Arc<StorageThreadPool>,
        rereplicator: Arc<dyn ChunkRereplicator>,
        listener: Arc<dyn ShardRebuildingListener>,
        max_malformed_records_to_tolerate: usize,
        max_batch_bytes: u64,
        max_batch_time: std::time::Duration,
    ) -> Arc<ShardRebuilding> {
        let context = Arc::new(Mutex::new(ReadContext::new(
            rebuilding_set,
            my_shard,
            plans,
            max_malformed_records_to_tolerate,
            max_batch_bytes,
            max_batch_time,
        )));
        Arc::new(ShardRebuilding {
            shard,
            version,
            restart_version,
            context,
            pool,
            rereplicator,
            listener,
            state: Mutex::new(RunState {
                window_end: RecordTimestamp::MAX,
                reading: false,
                paused_for_window: false,
                chunks_in_flight: 0,
                aborted: false,
                finished: false,
            }),
        })
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn version(&self) -> Lsn {
        self.version
    }

    pub fn restart_version(&self) -> Lsn {
        self.restart_version
    }

    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            target: "rebuilding",
            shard = self.shard,
            version = %self.version,
            "starting shard rebuilding"
        );
        self.schedule_read();
    }

    /// The coordinator slid the global window.
    pub fn advance_global_window(self: &Arc<Self>, window_end: RecordTimestamp) {
        let resume = {
            let mut state = self.state.lock();
            state.window_end = window_end;
            self.context.lock().window_end = window_end;
            state.paused_for_window && !state.reading && !state.aborted
        };
        if resume {
            self.schedule_read();
        }
    }

    /// Stops the run: no further batches are scheduled, in-flight chunk
    /// completions are ignored.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
    }

    fn schedule_read(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.aborted || state.reading || state.finished {
                return;
            }
            state.reading = true;
            state.paused_for_window = false;
        }
        let this = self.clone();
        let task = RebuildingReadStorageTask::new(
            self.context.clone(),
            Box::new(move |chunks, next_ts, status| {
                this.on_batch_done(chunks, next_ts, status);
            }),
        );
        if let Err((status, _task)) = self.pool.try_put_task(Box::new(task)) {
            tracing::warn!(
                target: "rebuilding",
                shard = self.shard,
                %status,
                "could not enqueue rebuilding read batch"
            );
            self.state.lock().reading = false;
            if status != Status::Shutdown {
                self.listener.on_shard_rebuilding_failed(self.shard, self.restart_version, status);
            }
        }
    }

    fn on_batch_done(self: &Arc<Self>, chunks: Vec<ChunkData>, next_ts: RecordTimestamp, status: Status) {
        {
            let mut state = self.state.lock();
            state.reading = false;
            if state.aborted {
                return;
            }
            // AGAIN is a non-blocking read miss: whatever was read still
            // gets re-replicated and the next batch retries from the
            // saved location. Only other failures stall the run.
            if status != Status::Ok && status != Status::Again {
                self.listener.on_shard_rebuilding_failed(self.shard, self.restart_version, status);
                return;
            }
            state.chunks_in_flight += chunks.len();
        }

        if next_ts > RecordTimestamp::MIN {
            self.listener.on_donor_progress(self.shard, next_ts, self.restart_version);
        }

        for chunk in chunks {
            let this = self.clone();
            metrics::CHUNKS_REPLICATED.inc();
            self.rereplicator.store_chunk(
                chunk,
                Box::new(move |status| this.on_chunk_stored(status)),
            );
        }
        self.maybe_continue();
    }

    fn on_chunk_stored(self: &Arc<Self>, status: Status) {
        {
            let mut state = self.state.lock();
            state.chunks_in_flight = state.chunks_in_flight.saturating_sub(1);
            if state.aborted {
                return;
            }
            if status != Status::Ok {
                tracing::warn!(
                    target: "rebuilding",
                    shard = self.shard,
                    %status,
                    "chunk re-replication failed; will retry on restart"
                );
                state.aborted = true;
                drop(state);
                self.listener.on_shard_rebuilding_failed(self.shard, self.restart_version, status);
                return;
            }
        }
        self.maybe_continue();
    }

    fn maybe_continue(self: &Arc<Self>) {
        enum Next {
            Read,
            PauseForWindow,
            Complete,
            Nothing,
        }
        let next = {
            let context = self.context.lock();
            let mut state = self.state.lock();
            if state.aborted || state.finished || state.reading || context.persistent_error {
                Next::Nothing
            } else if state.chunks_in_flight > 0 {
                // In-flight chunks bound memory use; read the next batch
                // once they complete.
                Next::Nothing
            } else if context.reached_end {
                state.finished = true;
                Next::Complete
            } else if context.stopped_at_window {
                Next::PauseForWindow
            } else {
                Next::Read
            }
        };
        match next {
            Next::Read => self.schedule_read(),
            Next::PauseForWindow => {
                self.state.lock().paused_for_window = true;
            }
            Next::Complete => {
                tracing::info!(
                    target: "rebuilding",
                    shard = self.shard,
                    version = %self.version,
                    "shard rebuilding complete"
                );
                self.listener.on_shard_rebuilding_complete(self.shard, self.restart_version);
            }
            Next::Nothing => {}
        }
    }
}
