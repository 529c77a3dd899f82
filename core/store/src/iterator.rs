//! Read iterators over LogsDB.
//!
//! [`LogIterator`] reads one log in LSN order, stepping across partitions
//! through the directory. [`AllLogsIterator`] reads everything in
//! `(partition, log, lsn)` order and is what rebuilding drives. Both
//! consult a [`ReadFilter`]: once per partition entered (by time range) and
//! once per record.

use crate::db::{Db, DirEntry, LogsDb, UNPARTITIONED_CF};
use crate::keys;
use crate::meta::TrimMetadata;
use crate::partition::{DirtyState, Partition};
use crate::record::ParsedRecord;
use logd_primitives::types::PARTITION_INVALID;
use logd_primitives::{LogId, Lsn, PartitionId, RecordTimestamp, Status};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IteratorState {
    AtRecord,
    AtEnd,
    /// The byte or time budget in [`ReadStats`] ran out before the next
    /// record was found. Seek again to resume.
    LimitReached,
    /// A read configured not to block on I/O could not be served from
    /// memory (rocksdb reports Incomplete). The position is kept;
    /// retrying the operation later makes progress. Unlike Error this is
    /// never terminal.
    WouldBlock,
    Error,
}

/// Byte and time accounting for a sequence of iterator operations, used by
/// rebuilding for admission control.
#[derive(Debug)]
pub struct ReadStats {
    pub read_records: u64,
    pub read_record_bytes: u64,
    pub filtered_records: u64,
    pub filtered_record_bytes: u64,
    pub max_bytes_to_read: u64,
    pub max_execution_time: Option<Duration>,
    started: Instant,
}

impl Default for ReadStats {
    fn default() -> ReadStats {
        ReadStats::unlimited()
    }
}

impl ReadStats {
    pub fn unlimited() -> ReadStats {
        ReadStats {
            read_records: 0,
            read_record_bytes: 0,
            filtered_records: 0,
            filtered_record_bytes: 0,
            max_bytes_to_read: u64::MAX,
            max_execution_time: None,
            started: Instant::now(),
        }
    }

    pub fn with_byte_limit(max_bytes: u64) -> ReadStats {
        ReadStats { max_bytes_to_read: max_bytes, ..ReadStats::unlimited() }
    }

    fn note_read(&mut self, bytes: usize) {
        self.read_records += 1;
        self.read_record_bytes += bytes as u64;
    }

    fn note_filtered(&mut self, bytes: usize) {
        self.filtered_records += 1;
        self.filtered_record_bytes += bytes as u64;
    }

    pub fn read_limit_reached(&self) -> bool {
        if self.read_record_bytes >= self.max_bytes_to_read {
            return true;
        }
        match self.max_execution_time {
            Some(limit) => self.started.elapsed() >= limit,
            None => false,
        }
    }
}

/// Filter applied while iterating. `should_process_time_range` is asked
/// once per partition entered; rejecting it skips the partition without
/// opening it. `should_process_record` is asked per record.
pub trait ReadFilter {
    fn should_process_time_range(&mut self, min: RecordTimestamp, max: RecordTimestamp) -> bool {
        let _ = (min, max);
        true
    }

    fn should_process_record(&mut self, log: LogId, lsn: Lsn, record: &ParsedRecord<'_>) -> bool {
        let _ = (log, lsn, record);
        true
    }
}

/// Accepts everything.
pub struct PassThroughFilter;

impl ReadFilter for PassThroughFilter {}

type RawIter<'a> = rocksdb::DBRawIteratorWithThreadMode<'a, Db>;

enum ScanOutcome {
    Found(Lsn, Vec<u8>),
    Exhausted,
    Limit,
    WouldBlock,
    Error,
}

/// Distinguishes a retriable non-blocking-read miss from a real iterator
/// error.
fn classify_iterator_status(result: Result<(), rocksdb::Error>) -> ScanOutcome {
    match result {
        Ok(()) => ScanOutcome::Exhausted,
        Err(e) if e.kind() == rocksdb::ErrorKind::Incomplete => ScanOutcome::WouldBlock,
        Err(_) => ScanOutcome::Error,
    }
}

/// Scans forward within one partition's column family for the next record
/// of `log` with `lsn >= target` that passes the filter. `max_lsn` is the
/// directory bound; anything above it is an orphan and stays hidden.
fn scan_partition(
    it: &mut RawIter<'_>,
    log: LogId,
    target: Lsn,
    max_lsn: Lsn,
    trim_point: Lsn,
    filter: &mut dyn ReadFilter,
    stats: &mut ReadStats,
) -> ScanOutcome {
    while it.valid() {
        let Some(key) = it.key() else { break };
        let Some((klog, klsn)) = keys::parse_data_key(key) else {
            return ScanOutcome::Error;
        };
        if klog != log || klsn > max_lsn {
            return ScanOutcome::Exhausted;
        }
        if klsn < target || klsn <= trim_point {
            it.next();
            continue;
        }
        let value = it.value().expect("valid iterator has a value");
        stats.note_read(value.len());
        if stats.read_limit_reached() && stats.read_records > 1 {
            // Over budget and this is not the first record of the pass:
            // stop without delivering it.
            return ScanOutcome::Limit;
        }
        match ParsedRecord::parse(value) {
            Err(_) => {
                // Unparseable entry; hide it and keep going.
                stats.note_filtered(value.len());
                it.next();
                continue;
            }
            Ok(parsed) => {
                if !filter.should_process_record(log, klsn, &parsed) {
                    stats.note_filtered(value.len());
                    it.next();
                    continue;
                }
                let owned = value.to_vec();
                return ScanOutcome::Found(klsn, owned);
            }
        }
    }
    classify_iterator_status(it.status())
}

/// Iterator over one log, in LSN order, across partitions.
pub struct LogIterator<'a> {
    store: &'a LogsDb,
    log: LogId,
    /// Directory snapshot for the log, ascending by partition id. Metadata
    /// logs get one synthetic entry covering the unpartitioned column
    /// family.
    dir: Vec<(PartitionId, DirEntry)>,
    dir_pos: usize,
    data: Option<RawIter<'a>>,
    state: IteratorState,
    current_lsn: Lsn,
    current_value: Vec<u8>,
    trim_point: Lsn,
    accessed_under_replicated: bool,
}

impl<'a> LogIterator<'a> {
    pub fn new(store: &'a LogsDb, log: LogId) -> LogIterator<'a> {
        LogIterator {
            store,
            log,
            dir: Vec::new(),
            dir_pos: 0,
            data: None,
            state: IteratorState::AtEnd,
            current_lsn: Lsn::INVALID,
            current_value: Vec::new(),
            trim_point: Lsn::INVALID,
            accessed_under_replicated: false,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn lsn(&self) -> Lsn {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        self.current_lsn
    }

    pub fn record(&self) -> &[u8] {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        &self.current_value
    }

    /// Sticky across next() calls; reset on seek. Reading past an
    /// under-replicated partition means results may be missing records.
    pub fn accessed_under_replicated_region(&self) -> bool {
        self.accessed_under_replicated
    }

    pub fn seek(&mut self, lsn: Lsn, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        self.accessed_under_replicated = false;
        self.data = None;
        self.trim_point = self.store.trim_point(self.log).unwrap_or(Lsn::INVALID);
        let target = lsn.max(self.trim_point.next());

        if self.log.is_metadata_log() {
            self.dir = vec![(
                PARTITION_INVALID,
                DirEntry { min_lsn: Lsn::OLDEST, max_lsn: Lsn::MAX },
            )];
            self.dir_pos = 0;
            self.advance_to(target, filter, stats);
            return;
        }

        self.dir = self.store.directory_snapshot_for_log(self.log);
        if self.dir.is_empty() {
            self.state = IteratorState::AtEnd;
            return;
        }
        // Latest-partition fast path: a tailing seek lands directly on the
        // last directory entry without scanning the snapshot.
        let last = self.dir.len() - 1;
        self.dir_pos = if target >= self.dir[last].1.min_lsn {
            last
        } else {
            // Last partition whose min_lsn is at or below the target; the
            // target may still fall in a gap, in which case scanning moves
            // on to the next partition naturally.
            self.dir.iter().rposition(|(_, e)| e.min_lsn <= target).unwrap_or(0)
        };
        self.advance_to(target, filter, stats);
    }

    pub fn next(&mut self, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        let target = self.current_lsn.next();
        if let Some(it) = self.data.as_mut() {
            it.next();
        }
        self.advance_to(target, filter, stats);
    }

    fn open_partition(&mut self, target: Lsn) -> Option<(Lsn, Lsn)> {
        let (pid, entry) = self.dir[self.dir_pos];
        let cf_name = if pid == PARTITION_INVALID {
            UNPARTITIONED_CF.to_owned()
        } else {
            Partition::cf_name(pid)
        };
        let cf = self.store.cf_for(&cf_name)?;
        let mut it = self.store.rocksdb().raw_iterator_cf(&cf);
        it.seek(keys::data_key(self.log, target.max(entry.min_lsn)));
        self.data = Some(it);
        Some((entry.min_lsn, entry.max_lsn))
    }

    fn advance_to(&mut self, target: Lsn, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        loop {
            if self.dir_pos >= self.dir.len() {
                self.state = IteratorState::AtEnd;
                self.data = None;
                return;
            }
            let (pid, entry) = self.dir[self.dir_pos];

            if self.data.is_none() {
                if pid != PARTITION_INVALID {
                    let Some(partition) = self.store.partition(pid) else {
                        // Dropped while we held the snapshot.
                        self.dir_pos += 1;
                        continue;
                    };
                    let (min_ts, max_ts) = partition.time_range();
                    if !filter.should_process_time_range(min_ts, max_ts) {
                        self.dir_pos += 1;
                        continue;
                    }
                    if partition.dirty_state() == DirtyState::UnderReplicated {
                        self.accessed_under_replicated = true;
                    }
                }
                if self.open_partition(target).is_none() {
                    self.dir_pos += 1;
                    continue;
                }
            }

            let mut it = self.data.take().expect("opened above or carried over");
            let outcome =
                scan_partition(&mut it, self.log, target, entry.max_lsn, self.trim_point, filter, stats);
            match outcome {
                ScanOutcome::Found(lsn, value) => {
                    self.data = Some(it);
                    self.current_lsn = lsn;
                    self.current_value = value;
                    self.state = IteratorState::AtRecord;
                    return;
                }
                ScanOutcome::Limit => {
                    self.data = Some(it);
                    self.state = IteratorState::LimitReached;
                    return;
                }
                ScanOutcome::WouldBlock => {
                    // Keep the data iterator: a later seek at the same
                    // target retries once the blocks are available.
                    self.data = Some(it);
                    self.state = IteratorState::WouldBlock;
                    return;
                }
                ScanOutcome::Exhausted => {
                    self.dir_pos += 1;
                }
                ScanOutcome::Error => {
                    self.state = IteratorState::Error;
                    return;
                }
            }
        }
    }
}

/// Opaque position of [`AllLogsIterator`]. The unpartitioned column family
/// (metadata and internal logs) sorts before every partition, so
/// rebuilding replicates metadata logs first.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Location {
    /// PARTITION_INVALID addresses the unpartitioned column family.
    pub partition: PartitionId,
    pub log: LogId,
    pub lsn: Lsn,
}

impl Location {
    pub fn min() -> Location {
        Location { partition: PARTITION_INVALID, log: LogId(0), lsn: Lsn::INVALID }
    }

    pub fn describe(&self) -> String {
        if self.partition == PARTITION_INVALID {
            format!("u {} {}", self.log, self.lsn)
        } else {
            format!("p{} {} {}", self.partition, self.log, self.lsn)
        }
    }
}

/// Iterator over all logs, walking the unpartitioned column family and
/// then partitions in id order. Partitions created after the iterator are
/// not visited.
pub struct AllLogsIterator<'a> {
    store: &'a LogsDb,
    /// Snapshot of partition ids at creation, ascending.
    partitions: Vec<PartitionId>,
    /// Position in the walk: None = unpartitioned phase, Some(i) = index
    /// into `partitions`.
    phase: Option<usize>,
    data: Option<RawIter<'a>>,
    state: IteratorState,
    current_log: LogId,
    current_lsn: Lsn,
    current_value: Vec<u8>,
    /// Directory bound of the (log, partition) being scanned, to hide
    /// orphans. Refreshed whenever the log changes under the cursor.
    bound_log: LogId,
    bound_max: Lsn,
}

impl<'a> AllLogsIterator<'a> {
    pub fn new(store: &'a LogsDb) -> AllLogsIterator<'a> {
        AllLogsIterator {
            store,
            partitions: store.partition_ids(),
            phase: None,
            data: None,
            state: IteratorState::AtEnd,
            current_log: LogId::INVALID,
            current_lsn: Lsn::INVALID,
            current_value: Vec::new(),
            bound_log: LogId::INVALID,
            bound_max: Lsn::MAX,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn log_id(&self) -> LogId {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        self.current_log
    }

    pub fn lsn(&self) -> Lsn {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        self.current_lsn
    }

    pub fn record(&self) -> &[u8] {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        &self.current_value
    }

    pub fn location(&self) -> Location {
        let partition = match self.phase {
            None => PARTITION_INVALID,
            Some(i) => self.partitions.get(i).copied().unwrap_or(PARTITION_INVALID),
        };
        Location { partition, log: self.current_log, lsn: self.current_lsn }
    }

    pub fn min_location(&self) -> Location {
        Location::min()
    }

    pub fn seek(&mut self, location: Location, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        self.data = None;
        let mut position = Some((location.log, location.lsn));
        self.phase = if location.partition == PARTITION_INVALID {
            None
        } else {
            match self.partitions.iter().position(|&p| p >= location.partition) {
                Some(i) => {
                    // If the exact partition was dropped, resume from the
                    // start of the next one.
                    if self.partitions[i] != location.partition {
                        position = None;
                    }
                    Some(i)
                }
                None => {
                    self.state = IteratorState::AtEnd;
                    return;
                }
            }
        };
        self.open_current(position, filter);
        self.advance(filter, stats);
    }

    pub fn next(&mut self, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        debug_assert_eq!(self.state, IteratorState::AtRecord);
        if let Some(it) = self.data.as_mut() {
            it.next();
        }
        self.advance(filter, stats);
    }

    /// Opens the column family of the current phase, positioned at `from`
    /// or at the start. Applies the partition time-range filter; on
    /// rejection leaves `data` unset so `advance` moves on.
    fn open_current(&mut self, from: Option<(LogId, Lsn)>, filter: &mut dyn ReadFilter) {
        self.data = None;
        self.bound_log = LogId::INVALID;
        let cf = match self.phase {
            None => self.store.cf_for(UNPARTITIONED_CF),
            Some(i) => {
                let Some(&pid) = self.partitions.get(i) else { return };
                let Some(partition) = self.store.partition(pid) else { return };
                let (min_ts, max_ts) = partition.time_range();
                if !filter.should_process_time_range(min_ts, max_ts) {
                    return;
                }
                self.store.cf_for(&Partition::cf_name(pid))
            }
        };
        let Some(cf) = cf else { return };
        let mut it = self.store.rocksdb().raw_iterator_cf(&cf);
        match from {
            Some((log, lsn)) => it.seek(keys::data_key(log, lsn)),
            None => it.seek_to_first(),
        }
        self.data = Some(it);
    }

    fn advance(&mut self, filter: &mut dyn ReadFilter, stats: &mut ReadStats) {
        loop {
            if self.data.is_none() {
                if !self.move_to_next_phase(filter) {
                    return;
                }
                if self.data.is_none() {
                    continue;
                }
            }

            let mut it = self.data.take().expect("checked above");
            let outcome = self.scan(&mut it, filter, stats);
            match outcome {
                ScanOutcome::Found(lsn, value) => {
                    self.data = Some(it);
                    self.current_lsn = lsn;
                    self.current_value = value;
                    self.state = IteratorState::AtRecord;
                    return;
                }
                ScanOutcome::Limit => {
                    self.data = Some(it);
                    self.state = IteratorState::LimitReached;
                    return;
                }
                ScanOutcome::WouldBlock => {
                    // Retriable: the position stays at the last delivered
                    // record, so a seek at location() makes progress once
                    // the blocks are in memory. Re-reading that record is
                    // harmless; every consumer of this iterator stores
                    // idempotently.
                    self.data = Some(it);
                    self.state = IteratorState::WouldBlock;
                    return;
                }
                ScanOutcome::Exhausted => {
                    if !self.move_to_next_phase(filter) {
                        return;
                    }
                }
                ScanOutcome::Error => {
                    self.state = IteratorState::Error;
                    return;
                }
            }
        }
    }

    /// Returns false when the walk is over (state set to AtEnd).
    fn move_to_next_phase(&mut self, filter: &mut dyn ReadFilter) -> bool {
        let next = match self.phase {
            None => Some(0),
            Some(i) => Some(i + 1),
        };
        match next {
            Some(i) if i < self.partitions.len() => {
                self.phase = Some(i);
                self.open_current(None, filter);
                true
            }
            _ => {
                self.phase = Some(self.partitions.len());
                self.data = None;
                self.state = IteratorState::AtEnd;
                false
            }
        }
    }

    fn scan(
        &mut self,
        it: &mut RawIter<'a>,
        filter: &mut dyn ReadFilter,
        stats: &mut ReadStats,
    ) -> ScanOutcome {
        let in_partition = self.phase.and_then(|i| self.partitions.get(i).copied());
        while it.valid() {
            let Some(key) = it.key() else { break };
            let Some((klog, klsn)) = keys::parse_data_key(key) else {
                return ScanOutcome::Error;
            };
            if let Some(pid) = in_partition {
                if klog != self.bound_log {
                    self.bound_log = klog;
                    self.bound_max = self
                        .store
                        .directory_entry(klog, pid)
                        .map(|e| e.max_lsn)
                        .unwrap_or(Lsn::INVALID);
                }
                if klsn > self.bound_max {
                    // Orphan; skip to this log's end in the partition.
                    it.next();
                    continue;
                }
            }
            let value = it.value().expect("valid iterator has a value");
            stats.note_read(value.len());
            if stats.read_limit_reached() && stats.read_records > 1 {
                // Leave the cursor on the undelivered record so
                // location() resumes exactly here.
                self.current_log = klog;
                self.current_lsn = klsn;
                return ScanOutcome::Limit;
            }
            match ParsedRecord::parse(value) {
                Err(_) => {
                    stats.note_filtered(value.len());
                    it.next();
                    continue;
                }
                Ok(parsed) => {
                    if !filter.should_process_record(klog, klsn, &parsed) {
                        stats.note_filtered(value.len());
                        it.next();
                        continue;
                    }
                    self.current_log = klog;
                    let owned = value.to_vec();
                    return ScanOutcome::Found(klsn, owned);
                }
            }
        }
        classify_iterator_status(it.status())
    }
}

/// Nested walk of the directory: logs in id order, then partitions having
/// records of that log. Used by trim tooling and admin introspection.
pub struct DirectoryIterator {
    /// Sorted by (log, partition).
    entries: Vec<(LogId, PartitionId, DirEntry)>,
    /// First entry not yet visited by `next_log`.
    cursor: usize,
    current_log: Option<LogId>,
    current_part: Option<usize>,
}

impl DirectoryIterator {
    pub fn new(store: &LogsDb) -> DirectoryIterator {
        let mut entries: Vec<(LogId, PartitionId, DirEntry)> = store
            .directory_snapshot_all()
            .into_iter()
            .map(|((log, partition), e)| (LogId(log), partition, e))
            .collect();
        entries.sort_by_key(|(log, partition, _)| (log.0, *partition));
        DirectoryIterator { entries, cursor: 0, current_log: None, current_part: None }
    }

    /// Advances to the next log. Call before `next_partition`.
    pub fn next_log(&mut self) -> Option<LogId> {
        if let Some(log) = self.current_log {
            while self.cursor < self.entries.len() && self.entries[self.cursor].0 == log {
                self.cursor += 1;
            }
        }
        self.current_part = None;
        self.current_log = self.entries.get(self.cursor).map(|(log, _, _)| *log);
        self.current_log
    }

    pub fn next_partition(&mut self) -> Option<PartitionId> {
        let log = self.current_log?;
        let next = match self.current_part {
            None => self.cursor,
            Some(i) => i + 1,
        };
        match self.entries.get(next) {
            Some((l, partition, _)) if *l == log => {
                self.current_part = Some(next);
                Some(*partition)
            }
            _ => None,
        }
    }

    /// Directory upper bound of the current (log, partition).
    pub fn last_lsn(&self) -> Lsn {
        self.current_part
            .and_then(|i| self.entries.get(i))
            .map(|(_, _, e)| e.max_lsn)
            .unwrap_or(Lsn::INVALID)
    }
}

/// Storage-side trim check: records at or below the trim point are hidden
/// even before their partition is dropped.
pub fn is_trimmed(store: &LogsDb, log: LogId, lsn: Lsn) -> Result<bool, Status> {
    Ok(store.get_log_metadata::<TrimMetadata>(log)?.map(|t| lsn <= t.0).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LogsDb, RecordWrite, WriteOptions};
    use crate::record::encode_record;
    use crate::settings::LogsDbSettings;
    use logd_primitives::{Epoch, Esn, ShardId};

    fn open_store(dir: &tempfile::TempDir) -> LogsDb {
        LogsDb::open(dir.path(), 0, LogsDbSettings::test(), RecordTimestamp(10_000)).unwrap()
    }

    fn write(store: &LogsDb, log: u64, epoch: u32, esn: u32, ts: u64) {
        store
            .write_record(
                &RecordWrite {
                    log: LogId(log),
                    lsn: Lsn::from_parts(Epoch(epoch), Esn(esn)),
                    timestamp: RecordTimestamp(ts),
                    flags: 0,
                    wave: 1,
                    copyset: &[ShardId::new(0, 0)],
                    payload: b"payload",
                },
                &WriteOptions::default(),
            )
            .unwrap();
    }

    fn collect_lsns(store: &LogsDb, log: u64) -> Vec<Lsn> {
        let mut out = Vec::new();
        let mut it = LogIterator::new(store, LogId(log));
        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        it.seek(Lsn::OLDEST, &mut filter, &mut stats);
        while it.state() == IteratorState::AtRecord {
            out.push(it.lsn());
            it.next(&mut filter, &mut stats);
        }
        assert_eq!(it.state(), IteratorState::AtEnd);
        out
    }

    #[test]
    fn reads_across_partitions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        write(&store, 1, 1, 2, 10_200);
        store.create_partition(RecordTimestamp(100_000)).unwrap();
        write(&store, 1, 2, 1, 100_100);
        write(&store, 2, 1, 5, 100_200); // other log, ignored

        assert_eq!(
            collect_lsns(&store, 1),
            vec![
                Lsn::from_parts(Epoch(1), Esn(1)),
                Lsn::from_parts(Epoch(1), Esn(2)),
                Lsn::from_parts(Epoch(2), Esn(1)),
            ]
        );
    }

    #[test]
    fn seek_lands_mid_log_and_respects_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        for esn in 1..=5 {
            write(&store, 1, 1, esn, 10_000 + esn as u64);
        }
        let mut it = LogIterator::new(&store, LogId(1));
        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        it.seek(Lsn::from_parts(Epoch(1), Esn(3)), &mut filter, &mut stats);
        assert_eq!(it.state(), IteratorState::AtRecord);
        assert_eq!(it.lsn(), Lsn::from_parts(Epoch(1), Esn(3)));
    }

    #[test]
    fn orphans_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        let pid = store.latest_partition().id;
        // Record beyond the directory's max_lsn, as left by a crash.
        let orphan = encode_record(RecordTimestamp(10_500), 0, 1, &[], b"orphan");
        store.put_record_bypassing_directory(
            pid,
            LogId(1),
            Lsn::from_parts(Epoch(1), Esn(50)),
            &orphan,
        );

        assert_eq!(collect_lsns(&store, 1), vec![Lsn::from_parts(Epoch(1), Esn(1))]);

        // All-logs iterator hides it too.
        let mut it = AllLogsIterator::new(&store);
        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        it.seek(Location::min(), &mut filter, &mut stats);
        let mut seen = Vec::new();
        while it.state() == IteratorState::AtRecord {
            seen.push((it.log_id(), it.lsn()));
            it.next(&mut filter, &mut stats);
        }
        assert_eq!(seen, vec![(LogId(1), Lsn::from_parts(Epoch(1), Esn(1)))]);
    }

    #[test]
    fn trimmed_records_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        for esn in 1..=4 {
            write(&store, 1, 1, esn, 10_000 + esn as u64);
        }
        store
            .update_log_metadata(
                LogId(1),
                &TrimMetadata(Lsn::from_parts(Epoch(1), Esn(2))),
                &WriteOptions::default(),
            )
            .unwrap();
        assert_eq!(
            collect_lsns(&store, 1),
            vec![Lsn::from_parts(Epoch(1), Esn(3)), Lsn::from_parts(Epoch(1), Esn(4))]
        );
        assert!(is_trimmed(&store, LogId(1), Lsn::from_parts(Epoch(1), Esn(2))).unwrap());
        assert!(!is_trimmed(&store, LogId(1), Lsn::from_parts(Epoch(1), Esn(3))).unwrap());
    }

    struct RejectRange {
        reject_below: RecordTimestamp,
        ranges_asked: usize,
    }

    impl ReadFilter for RejectRange {
        fn should_process_time_range(&mut self, min: RecordTimestamp, max: RecordTimestamp) -> bool {
            self.ranges_asked += 1;
            // Inverted (empty-partition) ranges are treated as matching.
            if min > max {
                return true;
            }
            max >= self.reject_below
        }
    }

    #[test]
    fn filtered_partitions_are_skipped_without_opening() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        store.create_partition(RecordTimestamp(100_000)).unwrap();
        write(&store, 1, 2, 1, 100_100);

        let mut filter = RejectRange { reject_below: RecordTimestamp(50_000), ranges_asked: 0 };
        let mut stats = ReadStats::unlimited();
        let mut it = LogIterator::new(&store, LogId(1));
        it.seek(Lsn::OLDEST, &mut filter, &mut stats);
        assert_eq!(it.state(), IteratorState::AtRecord);
        // The first partition was rejected wholesale; the record surfaced
        // is from the second.
        assert_eq!(it.lsn(), Lsn::from_parts(Epoch(2), Esn(1)));
        // One question per partition entered.
        assert_eq!(filter.ranges_asked, 2);
    }

    #[test]
    fn byte_limit_stops_after_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        write(&store, 1, 1, 2, 10_200);

        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::with_byte_limit(1);
        let mut it = LogIterator::new(&store, LogId(1));
        it.seek(Lsn::OLDEST, &mut filter, &mut stats);
        // The first record is always delivered even if it blows the budget.
        assert_eq!(it.state(), IteratorState::AtRecord);
        it.next(&mut filter, &mut stats);
        assert_eq!(it.state(), IteratorState::LimitReached);
    }

    #[test]
    fn under_replicated_partition_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        store.latest_partition().set_dirty_state(DirtyState::UnderReplicated);

        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        let mut it = LogIterator::new(&store, LogId(1));
        it.seek(Lsn::OLDEST, &mut filter, &mut stats);
        assert!(it.accessed_under_replicated_region());
        it.next(&mut filter, &mut stats);
        // Sticky at end of iteration too.
        assert!(it.accessed_under_replicated_region());
    }

    #[test]
    fn all_logs_iterator_visits_unpartitioned_first_and_partitions_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 2, 1, 1, 10_100);
        store.create_partition(RecordTimestamp(100_000)).unwrap();
        write(&store, 1, 1, 1, 100_100);
        // Metadata log record lands in the unpartitioned column family.
        store
            .write_record(
                &RecordWrite {
                    log: LogId(2).metadata_log(),
                    lsn: Lsn::from_parts(Epoch(1), Esn(1)),
                    timestamp: RecordTimestamp(10),
                    flags: 0,
                    wave: 1,
                    copyset: &[],
                    payload: b"meta",
                },
                &WriteOptions::default(),
            )
            .unwrap();

        let mut it = AllLogsIterator::new(&store);
        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        it.seek(Location::min(), &mut filter, &mut stats);
        let mut seen = Vec::new();
        while it.state() == IteratorState::AtRecord {
            seen.push(it.location().partition == PARTITION_INVALID);
            it.next(&mut filter, &mut stats);
        }
        // Unpartitioned record first, then the two data records.
        assert_eq!(seen, vec![true, false, false]);
    }

    #[test]
    fn all_logs_iterator_resumes_from_location() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        write(&store, 1, 1, 2, 10_200);
        write(&store, 2, 1, 1, 10_300);

        let mut it = AllLogsIterator::new(&store);
        let mut filter = PassThroughFilter;
        let mut stats = ReadStats::unlimited();
        it.seek(Location::min(), &mut filter, &mut stats);
        assert_eq!(it.state(), IteratorState::AtRecord);
        let resume = {
            it.next(&mut filter, &mut stats);
            assert_eq!(it.state(), IteratorState::AtRecord);
            it.location()
        };

        // A fresh iterator seeked at the saved location continues there.
        let mut it2 = AllLogsIterator::new(&store);
        it2.seek(resume, &mut filter, &mut stats);
        assert_eq!(it2.state(), IteratorState::AtRecord);
        assert_eq!(it2.log_id(), LogId(1));
        assert_eq!(it2.lsn(), Lsn::from_parts(Epoch(1), Esn(2)));
    }

    #[test]
    fn directory_iterator_walks_logs_then_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        write(&store, 1, 1, 1, 10_100);
        store.create_partition(RecordTimestamp(100_000)).unwrap();
        write(&store, 1, 2, 1, 100_100);
        write(&store, 3, 1, 7, 100_200);

        let mut dit = DirectoryIterator::new(&store);
        assert_eq!(dit.next_log(), Some(LogId(1)));
        let mut partitions = Vec::new();
        while let Some(p) = dit.next_partition() {
            partitions.push((p, dit.last_lsn()));
        }
        assert_eq!(partitions.len(), 2);
        assert!(partitions[0].0 < partitions[1].0);
        assert_eq!(partitions[1].1, Lsn::from_parts(Epoch(2), Esn(1)));
        assert_eq!(dit.next_log(), Some(LogId(3)));
        assert_eq!(dit.next_partition().is_some(), true);
        assert_eq!(dit.next_log(), None);
    }
}
