//! The donor's read side: a SLOW storage task that drives the all-logs
//! iterator through one batch, filtering down to records whose copysets
//! intersect the rebuilding set, and groups survivors into chunks of
//! consecutive LSNs sharing a copyset and epoch metadata.

use crate::metrics;
use crate::planner::RebuildingPlan;
use crate::types::{DataClass, RebuildingMode, RebuildingSet};
use logd_primitives::{
    intervals_intersect_range, EpochMetaData, LogId, Lsn, RecordTimestamp, ShardId, Status,
};
use logd_store::{
    AllLogsIterator, IteratorState, Location, ParsedRecord, ReadFilter, ReadStats,
};
use logd_storage::{StorageTask, StorageTaskContext, TaskPriority, ThreadType};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A run of consecutive records of one log sharing copyset and epoch
/// metadata; the unit of re-replication.
pub struct ChunkData {
    pub log: LogId,
    pub min_lsn: Lsn,
    pub max_lsn: Lsn,
    pub oldest_timestamp: RecordTimestamp,
    /// Replication scheme every record of the chunk is re-replicated
    /// under.
    pub metadata: Arc<EpochMetaData>,
    /// `(lsn, raw stored record)` pairs.
    pub records: Vec<(Lsn, Vec<u8>)>,
}

impl ChunkData {
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(|(_, r)| r.len()).sum()
    }
}

/// State shared between the ShardRebuilding and its storage tasks; lives
/// as long as the rebuilding run and carries the iterator position across
/// batches.
pub struct ReadContext {
    pub rebuilding_set: Arc<RebuildingSet>,
    pub my_shard: ShardId,
    pub plans: BTreeMap<u64, RebuildingPlan>,
    pub next_location: Option<Location>,
    pub reached_end: bool,
    pub persistent_error: bool,
    pub num_malformed_records_seen: usize,
    pub max_malformed_records_to_tolerate: usize,
    pub max_batch_bytes: u64,
    pub max_batch_time: Duration,
    /// Upper bound of record timestamps this donor may read (the global
    /// window). Records above it end the batch.
    pub window_end: RecordTimestamp,
    /// The last batch stopped at a record above the window; reading
    /// resumes when the window slides.
    pub stopped_at_window: bool,
}

impl ReadContext {
    pub fn new(
        rebuilding_set: Arc<RebuildingSet>,
        my_shard: ShardId,
        plans: BTreeMap<u64, RebuildingPlan>,
        max_malformed_records_to_tolerate: usize,
        max_batch_bytes: u64,
        max_batch_time: Duration,
    ) -> ReadContext {
        ReadContext {
            rebuilding_set,
            my_shard,
            plans,
            next_location: None,
            reached_end: false,
            persistent_error: false,
            num_malformed_records_seen: 0,
            max_malformed_records_to_tolerate,
            max_batch_bytes,
            max_batch_time,
            window_end: RecordTimestamp::MAX,
            stopped_at_window: false,
        }
    }
}

/// Read filter applied by the all-logs iterator on behalf of rebuilding.
pub struct RebuildingReadFilter<'a> {
    set: &'a RebuildingSet,
    my_shard: ShardId,
    plans: &'a BTreeMap<u64, RebuildingPlan>,
    current_log: Option<LogId>,
    current_in_plan: bool,
    /// Shards (per data class) known clean for the whole time range of
    /// the partition being read; refreshed by should_process_time_range.
    shards_outside_time_range: HashSet<(ShardId, DataClass)>,
    range_cache_valid: bool,
    pub records_filtered: u64,
    pub filtered_drained: u64,
    pub filtered_not_dirty: u64,
    pub filtered_timestamp: u64,
    pub filtered_epoch_range: u64,
}

impl<'a> RebuildingReadFilter<'a> {
    pub fn new(context: &'a ReadContext) -> RebuildingReadFilter<'a> {
        RebuildingReadFilter::from_parts(&context.rebuilding_set, context.my_shard, &context.plans)
    }

    fn from_parts(
        set: &'a RebuildingSet,
        my_shard: ShardId,
        plans: &'a BTreeMap<u64, RebuildingPlan>,
    ) -> RebuildingReadFilter<'a> {
        RebuildingReadFilter {
            set,
            my_shard,
            plans,
            current_log: None,
            current_in_plan: false,
            shards_outside_time_range: HashSet::new(),
            range_cache_valid: false,
            records_filtered: 0,
            filtered_drained: 0,
            filtered_not_dirty: 0,
            filtered_timestamp: 0,
            filtered_epoch_range: 0,
        }
    }

    fn note_filtered(&mut self, counter: FilteredReason) {
        self.records_filtered += 1;
        match counter {
            FilteredReason::Drained => self.filtered_drained += 1,
            FilteredReason::NotDirty => self.filtered_not_dirty += 1,
            FilteredReason::Timestamp => self.filtered_timestamp += 1,
            FilteredReason::EpochRange => self.filtered_epoch_range += 1,
        }
    }
}

enum FilteredReason {
    Drained,
    NotDirty,
    Timestamp,
    EpochRange,
}

impl ReadFilter for RebuildingReadFilter<'_> {
    fn should_process_time_range(&mut self, min: RecordTimestamp, max: RecordTimestamp) -> bool {
        self.shards_outside_time_range.clear();
        self.range_cache_valid = false;
        if min > max {
            // [+inf, -inf] is what empty partitions report; anything else
            // inverted is unexpected, but either way err on the side of
            // reading the partition.
            if min != RecordTimestamp::MAX || max != RecordTimestamp::MIN {
                tracing::info!(
                    target: "rebuilding",
                    %min,
                    %max,
                    "time-range filter called with inverted range"
                );
            }
            return true;
        }
        self.range_cache_valid = true;
        let mut any_intersects = false;
        for (shard, info) in &self.set.shards {
            if !info.is_ranged() {
                // Dirty for all time points.
                any_intersects = true;
                continue;
            }
            debug_assert_eq!(info.mode, RebuildingMode::Restore);
            for (dc, ranges) in &info.dc_dirty_ranges {
                if intervals_intersect_range(ranges, min, max) {
                    any_intersects = true;
                } else {
                    self.shards_outside_time_range.insert((*shard, *dc));
                }
            }
        }
        any_intersects
    }

    fn should_process_record(&mut self, log: LogId, lsn: Lsn, record: &ParsedRecord<'_>) -> bool {
        if record.is_drained() {
            self.note_filtered(FilteredReason::Drained);
            return false;
        }
        if self.current_log != Some(log) {
            self.current_log = Some(log);
            self.current_in_plan = self.plans.contains_key(&log.0);
        }
        if !self.current_in_plan {
            self.note_filtered(FilteredReason::EpochRange);
            return false;
        }
        let plan = &self.plans[&log.0];
        if plan.metadata_for_epoch(lsn.epoch()).is_none() {
            self.note_filtered(FilteredReason::EpochRange);
            return false;
        }

        let dc = if record.written_by_rebuilding() { DataClass::Rebuild } else { DataClass::Append };
        let mut reason = FilteredReason::NotDirty;
        let mut required = false;
        for shard in &record.copyset {
            let Some(info) = self.set.shards.get(shard) else { continue };
            if info.is_ranged() {
                let in_range = if self.range_cache_valid {
                    !self.shards_outside_time_range.contains(&(*shard, dc))
                        && info
                            .ranges_for(dc)
                            .map(|ranges| {
                                intervals_intersect_range(ranges, record.timestamp, record.timestamp)
                            })
                            .unwrap_or(false)
                } else {
                    info.ranges_for(dc)
                        .map(|ranges| {
                            intervals_intersect_range(ranges, record.timestamp, record.timestamp)
                        })
                        .unwrap_or(false)
                };
                if !in_range {
                    reason = FilteredReason::Timestamp;
                    continue;
                }
            }
            // Records we hold inside our own dirty region may have been
            // lost by others too, but we only serve as a donor for them
            // when another member of the copyset is also affected.
            if *shard == self.my_shard && info.mode == RebuildingMode::Restore {
                continue;
            }
            required = true;
        }
        if !required {
            self.note_filtered(reason);
        }
        required
    }
}

type BatchCompletion =
    Box<dyn FnOnce(Vec<ChunkData>, RecordTimestamp, Status) + Send>;

/// One batch of donor reads. Executes on a SLOW storage thread; the
/// completion carries the chunks, the timestamp the next batch starts at
/// (donor progress) and the batch status.
pub struct RebuildingReadStorageTask {
    context: Arc<Mutex<ReadContext>>,
    completion: Option<BatchCompletion>,
    chunks: Vec<ChunkData>,
    next_timestamp: RecordTimestamp,
    status: Status,
}

impl RebuildingReadStorageTask {
    pub fn new(
        context: Arc<Mutex<ReadContext>>,
        completion: BatchCompletion,
    ) -> RebuildingReadStorageTask {
        RebuildingReadStorageTask {
            context,
            completion: Some(completion),
            chunks: Vec::new(),
            next_timestamp: RecordTimestamp::MIN,
            status: Status::Ok,
        }
    }
}

impl StorageTask for RebuildingReadStorageTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Slow
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Low
    }

    fn is_droppable(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        let mut context = self.context.lock();
        let context = &mut *context;
        debug_assert!(!context.reached_end && !context.persistent_error);

        context.stopped_at_window = false;
        let mut stats = ReadStats::with_byte_limit(context.max_batch_bytes);
        stats.max_execution_time = Some(context.max_batch_time);
        let mut filter =
            RebuildingReadFilter::from_parts(&context.rebuilding_set, context.my_shard, &context.plans);

        let mut iterator = AllLogsIterator::new(ctx.store);
        let start = context.next_location.unwrap_or_else(Location::min);
        iterator.seek(start, &mut filter, &mut stats);

        let mut chunk: Option<ChunkData> = None;
        let mut malformed_in_batch = 0usize;
        while iterator.state() == IteratorState::AtRecord {
            let log = iterator.log_id();
            let lsn = iterator.lsn();
            let raw = iterator.record().to_vec();
            let parsed = match ParsedRecord::parse(&raw) {
                Ok(parsed) => parsed,
                Err(_) => {
                    malformed_in_batch += 1;
                    metrics::MALFORMED_RECORDS.inc();
                    context.num_malformed_records_seen += 1;
                    if context.num_malformed_records_seen
                        >= context.max_malformed_records_to_tolerate
                    {
                        tracing::error!(
                            target: "rebuilding",
                            seen = context.num_malformed_records_seen,
                            "too many malformed records; stalling rebuilding for investigation"
                        );
                        context.persistent_error = true;
                        self.status = Status::MalformedRecord;
                        self.chunks.clear();
                        return Status::MalformedRecord;
                    }
                    iterator.next(&mut filter, &mut stats);
                    continue;
                }
            };

            if parsed.timestamp > context.window_end {
                // Above the global window: pause here and let the window
                // slide before reading further.
                self.next_timestamp = parsed.timestamp;
                context.next_location = Some(iterator.location());
                context.stopped_at_window = true;
                self.finish_chunk(&mut chunk);
                self.status = Status::Ok;
                return Status::Ok;
            }

            let meta = context.plans[&log.0]
                .metadata_for_epoch(lsn.epoch())
                .expect("filter admits only planned epochs")
                .clone();

            let start_new = match &chunk {
                None => true,
                Some(c) => {
                    c.log != log
                        || lsn != c.max_lsn.next()
                        || !Arc::ptr_eq(&c.metadata, &meta)
                        || last_copyset_differs(c, &parsed)
                }
            };
            if start_new {
                self.finish_chunk(&mut chunk);
                chunk = Some(ChunkData {
                    log,
                    min_lsn: lsn,
                    max_lsn: lsn,
                    oldest_timestamp: parsed.timestamp,
                    metadata: meta,
                    records: Vec::new(),
                });
            }
            let c = chunk.as_mut().unwrap();
            c.max_lsn = lsn;
            self.next_timestamp = self.next_timestamp.max(parsed.timestamp);
            c.records.push((lsn, raw));

            iterator.next(&mut filter, &mut stats);
        }
        self.finish_chunk(&mut chunk);

        if malformed_in_batch > 0 {
            tracing::warn!(
                target: "rebuilding",
                malformed = malformed_in_batch,
                "skipped malformed records in rebuilding batch"
            );
        }

        match iterator.state() {
            IteratorState::LimitReached => {
                context.next_location = Some(iterator.location());
            }
            IteratorState::WouldBlock => {
                // A non-blocking read missed memory. Keep the position,
                // deliver what was read, and let the next batch retry;
                // this is not the permanent-error path.
                context.next_location = Some(iterator.location());
                self.status = Status::Again;
            }
            IteratorState::AtEnd => {
                context.reached_end = true;
            }
            IteratorState::Error => {
                tracing::error!(target: "rebuilding", "iterator error; stalling rebuilding");
                context.persistent_error = true;
                self.status = Status::Failed;
                self.chunks.clear();
                return Status::Failed;
            }
            IteratorState::AtRecord => unreachable!("loop exits on non-record states"),
        }
        metrics::RECORDS_READ.inc_by(self.chunks.iter().map(|c| c.records.len() as u64).sum());
        // Ok, or Again when the batch stopped on a non-blocking read miss.
        self.status
    }

    fn on_done(mut self: Box<Self>, status: Status) {
        if let Some(completion) = self.completion.take() {
            completion(std::mem::take(&mut self.chunks), self.next_timestamp, status);
        }
    }

    fn on_dropped(self: Box<Self>) {
        unreachable!("rebuilding read tasks are not droppable");
    }

    fn name(&self) -> &'static str {
        "RebuildingReadStorageTask"
    }
}

impl RebuildingReadStorageTask {
    fn finish_chunk(&mut self, chunk: &mut Option<ChunkData>) {
        if let Some(done) = chunk.take() {
            if !done.records.is_empty() {
                self.chunks.push(done);
            }
        }
    }
}

fn last_copyset_differs(chunk: &ChunkData, parsed: &ParsedRecord<'_>) -> bool {
    let Some((_, last_raw)) = chunk.records.last() else { return false };
    match ParsedRecord::parse(last_raw) {
        Ok(last) => last.copyset != parsed.copyset,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RebuildingNodeInfo;
    use logd_primitives::{Epoch, Esn, NodeId, RecordTimeInterval, ReplicationProperty};
    use logd_store::record::{encode_record, record_flags};

    fn plan_for(log: u64, nodes: &[u16]) -> BTreeMap<u64, RebuildingPlan> {
        let mut meta = EpochMetaData::new_for_provisioning(
            nodes.iter().map(|n| ShardId::new(*n, 0)).collect(),
            ReplicationProperty::simple(2),
            NodeId::new(0, 1),
        );
        meta.effective_since = Epoch(1);
        meta.epoch = Epoch(10);
        let mut plans = BTreeMap::new();
        plans.insert(
            log,
            RebuildingPlan { epochs: vec![(Epoch(1), Epoch(10), Arc::new(meta))] },
        );
        plans
    }

    fn context_with(set: RebuildingSet, plans: BTreeMap<u64, RebuildingPlan>) -> ReadContext {
        ReadContext::new(
            Arc::new(set),
            ShardId::new(0, 0),
            plans,
            1000,
            10 << 20,
            Duration::from_secs(1),
        )
    }

    fn record(ts: u64, copyset: &[ShardId], flags: u32) -> Vec<u8> {
        encode_record(RecordTimestamp(ts), flags, 1, copyset, b"payload")
    }

    #[test]
    fn records_without_dirty_copyset_members_are_skipped() {
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 0), RebuildingNodeInfo::full(RebuildingMode::Restore));
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);

        let clean = record(100, &[ShardId::new(0, 0), ShardId::new(1, 0)], 0);
        let parsed = ParsedRecord::parse(&clean).unwrap();
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(1)), &parsed));
        assert_eq!(filter.filtered_not_dirty, 1);

        let dirty = record(100, &[ShardId::new(0, 0), ShardId::new(2, 0)], 0);
        let parsed = ParsedRecord::parse(&dirty).unwrap();
        assert!(filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(2)), &parsed));
    }

    #[test]
    fn unplanned_logs_and_epochs_are_skipped() {
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 0), RebuildingNodeInfo::full(RebuildingMode::Restore));
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);

        let r = record(100, &[ShardId::new(2, 0)], 0);
        let parsed = ParsedRecord::parse(&r).unwrap();
        // Log 5 has no plan.
        assert!(!filter.should_process_record(LogId(5), Lsn::from_parts(Epoch(2), Esn(1)), &parsed));
        // Epoch outside the planned range.
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(11), Esn(1)), &parsed));
        assert_eq!(filter.filtered_epoch_range, 2);
    }

    #[test]
    fn ranged_rebuild_filters_by_timestamp_and_class() {
        let mut info = RebuildingNodeInfo::full(RebuildingMode::Restore);
        info.dc_dirty_ranges.insert(
            DataClass::Append,
            vec![RecordTimeInterval::new(RecordTimestamp(100), RecordTimestamp(200))],
        );
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 0), info);
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);

        let copyset = [ShardId::new(1, 0), ShardId::new(2, 0)];
        let inside = record(150, &copyset, 0);
        let parsed = ParsedRecord::parse(&inside).unwrap();
        assert!(filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(1)), &parsed));

        let outside = record(250, &copyset, 0);
        let parsed = ParsedRecord::parse(&outside).unwrap();
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(2)), &parsed));
        assert_eq!(filter.filtered_timestamp, 1);

        // Same timestamps but written by rebuilding: the Append ranges do
        // not apply to the Rebuild data class.
        let rebuild_class =
            record(150, &copyset, record_flags::WRITTEN_BY_REBUILDING);
        let parsed = ParsedRecord::parse(&rebuild_class).unwrap();
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(3)), &parsed));
    }

    #[test]
    fn drained_records_are_skipped() {
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 0), RebuildingNodeInfo::full(RebuildingMode::Restore));
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);
        let r = record(100, &[ShardId::new(2, 0)], record_flags::DRAINED);
        let parsed = ParsedRecord::parse(&r).unwrap();
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(1)), &parsed));
        assert_eq!(filter.filtered_drained, 1);
    }

    #[test]
    fn own_shard_restore_does_not_make_us_donor() {
        // Our own shard is in the set (mini-rebuilding); records whose
        // only dirty member is us are not re-replicated by us.
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(0, 0), RebuildingNodeInfo::full(RebuildingMode::Restore));
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);
        let r = record(100, &[ShardId::new(0, 0), ShardId::new(1, 0)], 0);
        let parsed = ParsedRecord::parse(&r).unwrap();
        assert!(!filter.should_process_record(LogId(1), Lsn::from_parts(Epoch(2), Esn(1)), &parsed));
    }

    #[test]
    fn inverted_time_range_is_treated_as_intersecting() {
        let mut info = RebuildingNodeInfo::full(RebuildingMode::Restore);
        info.dc_dirty_ranges.insert(
            DataClass::Append,
            vec![RecordTimeInterval::new(RecordTimestamp(100), RecordTimestamp(200))],
        );
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 0), info);
        let context = context_with(set, plan_for(1, &[0, 1, 2]));
        let mut filter = RebuildingReadFilter::new(&context);
        assert!(filter.should_process_time_range(RecordTimestamp::MAX, RecordTimestamp::MIN));
        // A clean range outside every dirty interval is skipped.
        assert!(!filter.should_process_time_range(RecordTimestamp(300), RecordTimestamp(400)));
        // An overlapping one is read.
        assert!(filter.should_process_time_range(RecordTimestamp(150), RecordTimestamp(400)));
    }
}
