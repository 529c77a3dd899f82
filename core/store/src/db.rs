use crate::keys;
use crate::meta::{LogMetadata, StoreMetadata, TrimMetadata};
use crate::metrics;
use crate::partition::{Partition, PartitionMeta, PartitionPtr};
use crate::record::encode_record;
use crate::settings::LogsDbSettings;
use borsh::BorshDeserialize;
use logd_config::LogsConfig;
use logd_primitives::{
    Epoch, LogId, Lsn, PartitionId, RecordTimestamp, ShardId, ShardIndex, Status, WaveNumber,
};
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;

pub(crate) const METADATA_CF: &str = "metadata";
pub(crate) const UNPARTITIONED_CF: &str = "unpartitioned";

const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Synchronously flush the WAL before reporting success. Most callers
    /// leave this off and rely on the syncing storage thread.
    pub sync: bool,
}

/// One record write. `lsn` within `log` must be unique per wave; writing
/// the same `(log, lsn, wave)` twice is idempotent.
pub struct RecordWrite<'a> {
    pub log: LogId,
    pub lsn: Lsn,
    pub timestamp: RecordTimestamp,
    pub flags: u32,
    pub wave: WaveNumber,
    pub copyset: &'a [ShardId],
    pub payload: &'a [u8],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct DirEntry {
    pub min_lsn: Lsn,
    pub max_lsn: Lsn,
}

struct PartitionState {
    partitions: BTreeMap<PartitionId, PartitionPtr>,
    next_id: PartitionId,
}

impl PartitionState {
    fn latest(&self) -> PartitionPtr {
        self.partitions.values().next_back().expect("at least one partition exists").clone()
    }
}

/// A LogsDB shard. Cheap to share; all methods take `&self`.
pub struct LogsDb {
    db: Db,
    path: PathBuf,
    shard_idx: ShardIndex,
    settings: LogsDbSettings,
    state: RwLock<PartitionState>,
    /// In-memory mirror of the on-disk partition directory, keyed by
    /// `(log, partition)`. Guarded separately from `state` because record
    /// writes only need the directory and the partition map read-locked.
    directory: RwLock<BTreeMap<(u64, PartitionId), DirEntry>>,
    /// Serializes read-modify-write cycles on directory entries.
    write_lock: Mutex<()>,
    accepting: AtomicU8,
}

const ACCEPTING_OK: u8 = 0;
const ACCEPTING_LOW_ON_SPC: u8 = 1;
const ACCEPTING_NOSPC: u8 = 2;
const ACCEPTING_DISABLED: u8 = 3;

impl LogsDb {
    pub fn open(
        path: &Path,
        shard_idx: ShardIndex,
        settings: LogsDbSettings,
        now: RecordTimestamp,
    ) -> Result<LogsDb, Status> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let existing_cfs = Db::list_cf(&Options::default(), path).unwrap_or_default();
        let mut cf_names: Vec<String> = existing_cfs;
        for required in ["default", METADATA_CF, UNPARTITIONED_CF] {
            if !cf_names.iter().any(|n| n == required) {
                cf_names.push(required.to_owned());
            }
        }
        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name.clone(), Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, path, descriptors).map_err(|e| {
            tracing::error!(target: "logsdb", shard = shard_idx, ?path, err = %e, "failed to open rocksdb");
            Status::Failed
        })?;

        let store = LogsDb {
            db,
            path: path.to_owned(),
            shard_idx,
            settings,
            state: RwLock::new(PartitionState { partitions: BTreeMap::new(), next_id: 1 }),
            directory: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
            accepting: AtomicU8::new(ACCEPTING_OK),
        };

        store.load_partitions(&cf_names)?;
        store.load_directory()?;
        if store.state.read().partitions.is_empty() {
            store.create_partition_locked(now)?;
        }
        store.write_store_metadata(
            &crate::meta::SchemaVersionMetadata(SCHEMA_VERSION),
            &WriteOptions::default(),
        )?;

        let n = store.state.read().partitions.len();
        tracing::info!(
            target: "logsdb",
            shard = shard_idx,
            partitions = n,
            "opened LogsDB shard"
        );
        Ok(store)
    }

    fn load_partitions(&self, cf_names: &[String]) -> Result<(), Status> {
        let mut state = self.state.write();
        for name in cf_names {
            let Some(id) = Partition::parse_cf_name(name) else { continue };
            let meta_key = keys::partition_meta_key(id);
            let meta = match self.get_meta_raw(&meta_key)? {
                Some(bytes) => PartitionMeta::try_from_slice(&bytes).map_err(|_| {
                    tracing::error!(target: "logsdb", partition = id, "corrupt partition metadata");
                    Status::Corruption
                })?,
                // CF exists without metadata: the create batch did not
                // commit. Treat as an empty partition starting at zero.
                None => PartitionMeta {
                    starting_timestamp: RecordTimestamp::MIN,
                    min_timestamp: RecordTimestamp::MAX,
                    max_timestamp: RecordTimestamp::MIN,
                    dirty: 0,
                },
            };
            state.partitions.insert(id, Arc::new(Partition::from_meta(id, meta)));
            state.next_id = state.next_id.max(id + 1);
        }
        Ok(())
    }

    fn load_directory(&self) -> Result<(), Status> {
        let cf = self.meta_cf();
        let mut dir = self.directory.write();
        let mut it = self.db.raw_iterator_cf(&cf);
        it.seek([b'd']);
        while it.valid() {
            let (Some(key), Some(value)) = (it.key(), it.value()) else { break };
            let Some(parsed) = keys::parse_directory_key(key) else { break };
            let max_lsn = keys::parse_directory_value(value).ok_or(Status::Corruption)?;
            dir.insert(
                (parsed.log.0, parsed.partition),
                DirEntry { min_lsn: parsed.min_lsn, max_lsn },
            );
            it.next();
        }
        Ok(())
    }

    pub fn shard_idx(&self) -> ShardIndex {
        self.shard_idx
    }

    pub fn settings(&self) -> &LogsDbSettings {
        &self.settings
    }

    /// OK, LOW_ON_SPC (writes still accepted), NOSPC or DISABLED.
    pub fn accepting_writes(&self) -> Status {
        match self.accepting.load(Ordering::Acquire) {
            ACCEPTING_OK => Status::Ok,
            ACCEPTING_LOW_ON_SPC => Status::LowOnSpc,
            ACCEPTING_NOSPC => Status::Nospc,
            _ => Status::Disabled,
        }
    }

    /// Any rocksdb failure flips the store into fail-safe: reads keep
    /// working, every subsequent write is refused with DISABLED.
    fn enter_fail_safe(&self, op: &str, e: &rocksdb::Error) -> Status {
        tracing::error!(
            target: "logsdb",
            shard = self.shard_idx,
            op,
            err = %e,
            "rocksdb error, entering fail-safe mode"
        );
        metrics::FAIL_SAFE_ENTERED.inc();
        self.accepting.store(ACCEPTING_DISABLED, Ordering::Release);
        Status::Disabled
    }

    fn check_accepting(&self) -> Result<(), Status> {
        match self.accepting_writes() {
            Status::Ok | Status::LowOnSpc => Ok(()),
            other => Err(other),
        }
    }

    pub(crate) fn meta_cf(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db.cf_handle(METADATA_CF).expect("metadata column family exists")
    }

    pub(crate) fn cf_for(&self, name: &str) -> Option<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db.cf_handle(name)
    }

    pub(crate) fn rocksdb(&self) -> &Db {
        &self.db
    }

    fn get_meta_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        self.db.get_cf(&self.meta_cf(), key).map_err(|e| {
            tracing::error!(target: "logsdb", shard = self.shard_idx, err = %e, "metadata read failed");
            Status::Failed
        })
    }

    // ---- partitions ----

    pub fn first_partition_id(&self) -> PartitionId {
        *self.state.read().partitions.keys().next().expect("at least one partition")
    }

    pub fn latest_partition(&self) -> PartitionPtr {
        self.state.read().latest()
    }

    pub fn partition(&self, id: PartitionId) -> Option<PartitionPtr> {
        self.state.read().partitions.get(&id).cloned()
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.state.read().partitions.keys().copied().collect()
    }

    /// Creates a fresh latest partition. The caller decided rotation is
    /// due; timestamps are rounded down to the configured granularity.
    pub fn create_partition(&self, now: RecordTimestamp) -> Result<PartitionPtr, Status> {
        self.check_accepting()?;
        self.create_partition_locked(now)
    }

    fn create_partition_locked(&self, now: RecordTimestamp) -> Result<PartitionPtr, Status> {
        let mut state = self.state.write();
        let id = state.next_id;
        let granularity = self.settings.partition_timestamp_granularity.as_millis() as u64;
        let starting = if granularity == 0 {
            now
        } else {
            RecordTimestamp(now.0 - now.0 % granularity)
        };

        self.db
            .create_cf(Partition::cf_name(id), &Options::default())
            .map_err(|e| self.enter_fail_safe("create_cf", &e))?;
        let partition = Arc::new(Partition::new(id, starting));
        let meta = borsh::to_vec(&partition.to_meta()).expect("borsh serialization cannot fail");
        self.db
            .put_cf(&self.meta_cf(), keys::partition_meta_key(id), meta)
            .map_err(|e| self.enter_fail_safe("put partition meta", &e))?;

        state.partitions.insert(id, partition.clone());
        state.next_id = id + 1;
        metrics::PARTITIONS_CREATED.inc();
        tracing::info!(
            target: "logsdb",
            shard = self.shard_idx,
            partition = id,
            starting = %starting,
            "created partition"
        );
        Ok(partition)
    }

    /// Retires the latest partition if it exceeded the configured age,
    /// size or file-count limits. Returns the new partition if rotated.
    pub fn maybe_rotate(&self, now: RecordTimestamp) -> Result<Option<PartitionPtr>, Status> {
        let latest = self.latest_partition();
        let age_ms = now.0.saturating_sub(latest.starting_timestamp.0);
        let too_old = age_ms >= self.settings.partition_duration.as_millis() as u64;

        let cf_name = Partition::cf_name(latest.id);
        let size = self.partition_int_property(&cf_name, "rocksdb.estimate-live-data-size");
        let files = self.partition_int_property(&cf_name, "rocksdb.num-files-at-level0");
        let too_big = size >= self.settings.partition_size_limit;
        let too_many_files = files >= self.settings.partition_file_limit;

        if !(too_old || too_big || too_many_files) {
            return Ok(None);
        }
        tracing::debug!(
            target: "logsdb",
            shard = self.shard_idx,
            partition = latest.id,
            too_old, too_big, too_many_files,
            "rotating latest partition"
        );
        self.create_partition(now).map(Some)
    }

    fn partition_int_property(&self, cf_name: &str, property: &str) -> u64 {
        self.cf_for(cf_name)
            .and_then(|cf| self.db.property_int_value_cf(&cf, property).ok().flatten())
            .unwrap_or(0)
    }

    /// Partition that should hold a record with this timestamp: the latest
    /// one for current appends, an older one for historical writes (e.g.
    /// rebuilding re-replicating old records).
    fn target_partition(&self, ts: RecordTimestamp) -> PartitionPtr {
        let state = self.state.read();
        let latest = state.latest();
        if ts >= latest.starting_timestamp {
            return latest;
        }
        state
            .partitions
            .values()
            .rev()
            .find(|p| p.starting_timestamp <= ts)
            .cloned()
            .unwrap_or_else(|| state.partitions.values().next().unwrap().clone())
    }

    // ---- record writes ----

    pub fn write_record(&self, write: &RecordWrite<'_>, opts: &WriteOptions) -> Result<(), Status> {
        self.write_records(std::slice::from_ref(write), opts)
    }

    /// Writes a batch of records atomically, updating the directory and
    /// partition timestamps in the same rocksdb batch.
    pub fn write_records(&self, writes: &[RecordWrite<'_>], opts: &WriteOptions) -> Result<(), Status> {
        self.check_accepting()?;
        if writes.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        // (log, partition) -> merged entry, applied to the in-memory
        // directory only after the batch commits.
        let mut dir_updates: BTreeMap<(u64, PartitionId), (DirEntry, Option<Lsn>)> = BTreeMap::new();
        let mut touched_partitions: BTreeMap<PartitionId, PartitionPtr> = BTreeMap::new();

        {
            let directory = self.directory.read();
            for write in writes {
                let value = encode_record(
                    write.timestamp,
                    write.flags,
                    write.wave,
                    write.copyset,
                    write.payload,
                );
                if write.log.is_metadata_log() {
                    let cf = self.cf_for(UNPARTITIONED_CF).ok_or(Status::Internal)?;
                    batch.put_cf(&cf, keys::data_key(write.log, write.lsn), value);
                    continue;
                }

                let partition = self.target_partition(write.timestamp);
                let cf = self.cf_for(&Partition::cf_name(partition.id)).ok_or(Status::Internal)?;
                batch.put_cf(&cf, keys::data_key(write.log, write.lsn), value);
                partition.note_timestamp(write.timestamp);
                touched_partitions.insert(partition.id, partition.clone());

                let dir_key = (write.log.0, partition.id);
                let (entry, old_min) = match dir_updates.get(&dir_key) {
                    Some((e, old)) => (*e, *old),
                    None => match directory.get(&dir_key) {
                        Some(e) => (*e, Some(e.min_lsn)),
                        None => {
                            (DirEntry { min_lsn: write.lsn, max_lsn: write.lsn }, None)
                        }
                    },
                };
                let merged = DirEntry {
                    min_lsn: entry.min_lsn.min(write.lsn),
                    max_lsn: entry.max_lsn.max(write.lsn),
                };
                dir_updates.insert(dir_key, (merged, old_min));
            }
        }

        let meta_cf = self.meta_cf();
        for (&(log, partition), &(entry, old_min)) in &dir_updates {
            // min_lsn is part of the key; lowering it replaces the row.
            if let Some(old_min) = old_min {
                if old_min != entry.min_lsn {
                    batch.delete_cf(&meta_cf, keys::directory_key(LogId(log), old_min, partition));
                }
            }
            batch.put_cf(
                &meta_cf,
                keys::directory_key(LogId(log), entry.min_lsn, partition),
                keys::directory_value(entry.max_lsn),
            );
        }
        for partition in touched_partitions.values() {
            let meta = borsh::to_vec(&partition.to_meta()).expect("borsh serialization cannot fail");
            batch.put_cf(&meta_cf, keys::partition_meta_key(partition.id), meta);
        }

        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(opts.sync);
        self.db.write_opt(batch, &wo).map_err(|e| self.enter_fail_safe("write_records", &e))?;

        let mut directory = self.directory.write();
        for ((log, partition), (entry, _)) in dir_updates {
            directory.insert((log, partition), entry);
        }
        metrics::RECORDS_WRITTEN.inc_by(writes.len() as u64);
        Ok(())
    }

    /// Point lookup, mainly for tests and amend handling. Returns the raw
    /// record value.
    pub fn read_record_raw(&self, log: LogId, lsn: Lsn) -> Result<Option<Vec<u8>>, Status> {
        if log.is_metadata_log() {
            let cf = self.cf_for(UNPARTITIONED_CF).ok_or(Status::Internal)?;
            return self.db.get_cf(&cf, keys::data_key(log, lsn)).map_err(|_| Status::Failed);
        }
        let directory = self.directory.read();
        for (&(l, partition), entry) in directory.range((log.0, 0)..(log.0 + 1, 0)) {
            debug_assert_eq!(l, log.0);
            if lsn < entry.min_lsn || lsn > entry.max_lsn {
                continue;
            }
            let Some(cf) = self.cf_for(&Partition::cf_name(partition)) else { continue };
            if let Some(v) =
                self.db.get_cf(&cf, keys::data_key(log, lsn)).map_err(|_| Status::Failed)?
            {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub(crate) fn directory_snapshot_for_log(&self, log: LogId) -> Vec<(PartitionId, DirEntry)> {
        self.directory
            .read()
            .range((log.0, 0)..(log.0 + 1, 0))
            .map(|(&(_, p), &e)| (p, e))
            .collect()
    }

    pub(crate) fn directory_entry(&self, log: LogId, partition: PartitionId) -> Option<DirEntry> {
        self.directory.read().get(&(log.0, partition)).copied()
    }

    pub(crate) fn directory_snapshot_all(&self) -> Vec<((u64, PartitionId), DirEntry)> {
        self.directory.read().iter().map(|(&k, &e)| (k, e)).collect()
    }

    /// Upper bound on the highest LSN stored for the log, from the
    /// directory. INVALID when the log has no records here.
    pub fn max_lsn_upper_bound(&self, log: LogId) -> Lsn {
        self.directory
            .read()
            .range((log.0, 0)..(log.0 + 1, 0))
            .map(|(_, e)| e.max_lsn)
            .max()
            .unwrap_or(Lsn::INVALID)
    }

    // ---- store / log / per-epoch metadata ----

    pub fn write_store_metadata<T: StoreMetadata>(
        &self,
        meta: &T,
        opts: &WriteOptions,
    ) -> Result<(), Status> {
        self.check_accepting()?;
        let value = borsh::to_vec(meta).map_err(|_| Status::Internal)?;
        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(opts.sync);
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.meta_cf(), keys::store_meta_key(T::KIND), value);
        self.db.write_opt(batch, &wo).map_err(|e| self.enter_fail_safe(T::NAME, &e))
    }

    pub fn read_store_metadata<T: StoreMetadata>(&self) -> Result<Option<T>, Status> {
        match self.get_meta_raw(&keys::store_meta_key(T::KIND))? {
            None => Ok(None),
            Some(bytes) => T::try_from_slice(&bytes).map(Some).map_err(|_| {
                tracing::error!(target: "logsdb", shard = self.shard_idx, kind = T::NAME, "corrupt store metadata");
                Status::Corruption
            }),
        }
    }

    pub fn delete_store_metadata<T: StoreMetadata>(&self, opts: &WriteOptions) -> Result<(), Status> {
        self.check_accepting()?;
        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(opts.sync);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.meta_cf(), keys::store_meta_key(T::KIND));
        self.db.write_opt(batch, &wo).map_err(|e| self.enter_fail_safe(T::NAME, &e))
    }

    /// Merge-updates a per-log metadata record. Completes with `UPTODATE`
    /// when the stored value already supersedes the new one; callers
    /// generally report that to clients as success.
    pub fn update_log_metadata<T: LogMetadata>(
        &self,
        log: LogId,
        meta: &T,
        opts: &WriteOptions,
    ) -> Result<(), Status> {
        self.check_accepting()?;
        let _guard = self.write_lock.lock();
        let key = keys::log_meta_key(T::KIND, log);
        if let Some(bytes) = self.get_meta_raw(&key)? {
            let prev = T::try_from_slice(&bytes).map_err(|_| Status::Corruption)?;
            if !meta.supersedes(&prev) {
                return Err(Status::Uptodate);
            }
        }
        let value = borsh::to_vec(meta).map_err(|_| Status::Internal)?;
        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(opts.sync);
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.meta_cf(), key, value);
        self.db.write_opt(batch, &wo).map_err(|e| self.enter_fail_safe(T::NAME, &e))
    }

    pub fn get_log_metadata<T: LogMetadata>(&self, log: LogId) -> Result<Option<T>, Status> {
        match self.get_meta_raw(&keys::log_meta_key(T::KIND, log))? {
            None => Ok(None),
            Some(bytes) => T::try_from_slice(&bytes).map(Some).map_err(|_| Status::Corruption),
        }
    }

    pub fn trim_point(&self, log: LogId) -> Result<Lsn, Status> {
        Ok(self.get_log_metadata::<TrimMetadata>(log)?.map(|t| t.0).unwrap_or(Lsn::INVALID))
    }

    pub fn put_per_epoch_metadata(
        &self,
        log: LogId,
        epoch: Epoch,
        meta: &crate::meta::EpochRecoveryMetadata,
        opts: &WriteOptions,
    ) -> Result<(), Status> {
        self.check_accepting()?;
        let value = borsh::to_vec(meta).map_err(|_| Status::Internal)?;
        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(opts.sync);
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.meta_cf(), keys::per_epoch_key(log, epoch), value);
        self.db.write_opt(batch, &wo).map_err(|e| self.enter_fail_safe("per-epoch metadata", &e))
    }

    pub fn get_per_epoch_metadata(
        &self,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Option<crate::meta::EpochRecoveryMetadata>, Status> {
        match self.get_meta_raw(&keys::per_epoch_key(log, epoch))? {
            None => Ok(None),
            Some(bytes) => crate::meta::EpochRecoveryMetadata::try_from_slice(&bytes)
                .map(Some)
                .map_err(|_| Status::Corruption),
        }
    }

    // ---- retention ----

    /// Drops every leading partition whose data is entirely past the
    /// backlog of every log it stores. Trim points of affected logs are
    /// advanced to the dropped directory bounds first, so iterators never
    /// see LSNs go backwards. Returns the dropped partition ids.
    pub fn trim_logs_based_on_time(
        &self,
        logs: &LogsConfig,
        now: RecordTimestamp,
    ) -> Result<Vec<PartitionId>, Status> {
        self.check_accepting()?;
        let latest_id = self.latest_partition().id;
        let candidate_ids: Vec<PartitionId> =
            self.partition_ids().into_iter().filter(|id| *id != latest_id).collect();

        let mut droppable: Vec<PartitionId> = Vec::new();
        'partitions: for id in candidate_ids {
            let partition = self.partition(id).expect("partition listed just now");
            let (_, max_ts) = partition.time_range();
            let entries: Vec<(u64, DirEntry)> = self
                .directory
                .read()
                .iter()
                .filter(|((_, p), _)| *p == id)
                .map(|((log, _), e)| (*log, *e))
                .collect();
            for (log, _) in &entries {
                match logs.get(LogId(*log)).and_then(|attrs| attrs.backlog) {
                    // A log with unlimited retention pins the partition.
                    None if logs.contains(LogId(*log)) => break 'partitions,
                    None => continue, // log no longer in config
                    Some(backlog) => {
                        let cutoff = now.saturating_sub(backlog);
                        if max_ts >= cutoff {
                            break 'partitions;
                        }
                    }
                }
            }
            droppable.push(id);
        }

        for id in &droppable {
            self.drop_partition(*id)?;
        }
        Ok(droppable)
    }

    fn drop_partition(&self, id: PartitionId) -> Result<(), Status> {
        let entries: Vec<(u64, DirEntry)> = self
            .directory
            .read()
            .iter()
            .filter(|((_, p), _)| *p == id)
            .map(|((log, _), e)| (*log, *e))
            .collect();

        // Advance trim points first: a crash between here and the CF drop
        // leaves a partition that retention will pick up again.
        for (log, entry) in &entries {
            match self.update_log_metadata(LogId(*log), &TrimMetadata(entry.max_lsn), &WriteOptions::default()) {
                Ok(()) | Err(Status::Uptodate) => {}
                Err(e) => return Err(e),
            }
        }

        let meta_cf = self.meta_cf();
        let mut batch = WriteBatch::default();
        for (log, entry) in &entries {
            batch.delete_cf(&meta_cf, keys::directory_key(LogId(*log), entry.min_lsn, id));
        }
        batch.delete_cf(&meta_cf, keys::partition_meta_key(id));
        self.db.write_opt(batch, &rocksdb::WriteOptions::default())
            .map_err(|e| self.enter_fail_safe("drop_partition", &e))?;

        self.db
            .drop_cf(&Partition::cf_name(id))
            .map_err(|e| self.enter_fail_safe("drop_cf", &e))?;

        self.state.write().partitions.remove(&id);
        {
            let mut dir = self.directory.write();
            for (log, _) in &entries {
                dir.remove(&(*log, id));
            }
        }
        metrics::PARTITIONS_DROPPED.inc();
        tracing::info!(target: "logsdb", shard = self.shard_idx, partition = id, "dropped partition");
        Ok(())
    }

    // ---- maintenance ----

    /// Partitions with enough small L0 files to be worth a partial
    /// compaction pass on a SLOW storage thread.
    pub fn partial_compaction_candidates(&self) -> Vec<PartitionId> {
        let latest_id = self.latest_partition().id;
        self.partition_ids()
            .into_iter()
            .filter(|id| *id != latest_id)
            .filter(|id| {
                let files =
                    self.partition_int_property(&Partition::cf_name(*id), "rocksdb.num-files-at-level0");
                files >= self.settings.partial_compaction_file_num_threshold
            })
            .collect()
    }

    pub fn compact_partition(&self, id: PartitionId) -> Result<(), Status> {
        let Some(cf) = self.cf_for(&Partition::cf_name(id)) else {
            return Err(Status::Notfound);
        };
        self.db.compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    /// Fsyncs the write-ahead log. Called by the syncing storage thread on
    /// behalf of SYNC_WRITE tasks.
    pub fn flush_wal(&self, sync: bool) -> Result<(), Status> {
        self.db.flush_wal(sync).map_err(|e| self.enter_fail_safe("flush_wal", &e))
    }

    /// Test hook: writes a record without touching the directory, which is
    /// how orphans appear after a crash between the data write and the
    /// directory update reaching disk.
    #[cfg(test)]
    pub(crate) fn put_record_bypassing_directory(
        &self,
        partition: PartitionId,
        log: LogId,
        lsn: Lsn,
        value: &[u8],
    ) {
        let cf = self.cf_for(&Partition::cf_name(partition)).unwrap();
        self.db.put_cf(&cf, keys::data_key(log, lsn), value).unwrap();
    }

    /// Re-evaluates free disk space and updates the accepting-writes state.
    /// DISABLED (fail-safe) is sticky and never downgraded here.
    pub fn refresh_space_state(&self) -> Status {
        if self.accepting.load(Ordering::Acquire) == ACCEPTING_DISABLED {
            return Status::Disabled;
        }
        let (available, total) = match (fs2::available_space(&self.path), fs2::total_space(&self.path)) {
            (Ok(a), Ok(t)) if t > 0 => (a, t),
            _ => return self.accepting_writes(),
        };
        let free_ratio = available as f64 / total as f64;
        let low = self.settings.free_disk_space_threshold_low;
        let new_state = if free_ratio < low / 2.0 {
            ACCEPTING_NOSPC
        } else if free_ratio < low {
            ACCEPTING_LOW_ON_SPC
        } else {
            ACCEPTING_OK
        };
        self.accepting.store(new_state, Ordering::Release);
        self.accepting_writes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{LastCleanMetadata, RebuildingCompleteMetadata, SealMetadata};
    use assert_matches::assert_matches;
    use logd_config::LogAttributes;
    use logd_primitives::Esn;
    use std::time::Duration;

    fn open_test_store(dir: &tempfile::TempDir) -> LogsDb {
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
                    copyset: &[ShardId::new(0, 0), ShardId::new(1, 0)],
                    payload: b"hello",
                },
                &WriteOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn directory_tracks_min_and_max() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        write(&store, 1, 1, 10, 10_100);
        write(&store, 1, 1, 5, 10_200);
        write(&store, 1, 1, 20, 10_300);
        let latest = store.latest_partition().id;
        let entry = store.directory_entry(LogId(1), latest).unwrap();
        assert_eq!(entry.min_lsn, Lsn::from_parts(Epoch(1), Esn(5)));
        assert_eq!(entry.max_lsn, Lsn::from_parts(Epoch(1), Esn(20)));
    }

    #[test]
    fn directory_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_test_store(&dir);
            write(&store, 7, 2, 1, 10_100);
        }
        let store = open_test_store(&dir);
        let entries = store.directory_snapshot_for_log(LogId(7));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.max_lsn, Lsn::from_parts(Epoch(2), Esn(1)));
        let raw = store.read_record_raw(LogId(7), Lsn::from_parts(Epoch(2), Esn(1))).unwrap();
        assert!(raw.is_some());
    }

    #[test]
    fn rotation_creates_monotonic_partition_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let first = store.latest_partition().id;
        // Not old enough yet.
        assert!(store.maybe_rotate(RecordTimestamp(10_000)).unwrap().is_none());
        let rotated = store
            .maybe_rotate(RecordTimestamp(10_000 + 61 * 1000))
            .unwrap()
            .expect("rotation happened");
        assert!(rotated.id > first);
        assert_eq!(store.latest_partition().id, rotated.id);
    }

    #[test]
    fn historical_writes_go_to_older_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let old_partition = store.latest_partition().id;
        store.create_partition(RecordTimestamp(100_000)).unwrap();
        let latest = store.latest_partition().id;

        write(&store, 1, 1, 1, 50_000); // before latest.starting
        write(&store, 1, 1, 2, 100_001);
        assert!(store.directory_entry(LogId(1), old_partition).is_some());
        assert!(store.directory_entry(LogId(1), latest).is_some());
    }

    #[test]
    fn trim_point_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let log = LogId(3);
        store.update_log_metadata(log, &TrimMetadata(Lsn(100)), &WriteOptions::default()).unwrap();
        assert_matches!(
            store.update_log_metadata(log, &TrimMetadata(Lsn(50)), &WriteOptions::default()),
            Err(Status::Uptodate)
        );
        assert_eq!(store.trim_point(log).unwrap(), Lsn(100));
    }

    #[test]
    fn seal_and_last_clean_merge_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let log = LogId(9);
        store
            .update_log_metadata(log, &SealMetadata { epoch: Epoch(4), sealed_by: 1 }, &WriteOptions::default())
            .unwrap();
        assert_matches!(
            store.update_log_metadata(
                log,
                &SealMetadata { epoch: Epoch(4), sealed_by: 2 },
                &WriteOptions::default()
            ),
            Err(Status::Uptodate)
        );
        store.update_log_metadata(log, &LastCleanMetadata(Epoch(4)), &WriteOptions::default()).unwrap();
        assert_eq!(
            store.get_log_metadata::<LastCleanMetadata>(log).unwrap(),
            Some(LastCleanMetadata(Epoch(4)))
        );
    }

    #[test]
    fn store_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        assert_eq!(store.read_store_metadata::<RebuildingCompleteMetadata>().unwrap(), None);
        store
            .write_store_metadata(&RebuildingCompleteMetadata, &WriteOptions { sync: true })
            .unwrap();
        assert_eq!(
            store.read_store_metadata::<RebuildingCompleteMetadata>().unwrap(),
            Some(RebuildingCompleteMetadata)
        );
        store.delete_store_metadata::<RebuildingCompleteMetadata>(&WriteOptions::default()).unwrap();
        assert_eq!(store.read_store_metadata::<RebuildingCompleteMetadata>().unwrap(), None);
    }

    #[test]
    fn retention_drops_only_cleared_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let p1 = store.latest_partition().id;
        write(&store, 1, 1, 1, 10_100);
        store.create_partition(RecordTimestamp(200_000)).unwrap();
        let p2 = store.latest_partition().id;
        write(&store, 1, 1, 2, 200_100);
        store.create_partition(RecordTimestamp(300_000)).unwrap();

        let logs = LogsConfig::new(
            [(
                1,
                LogAttributes {
                    backlog: Some(Duration::from_secs(100)),
                    ..LogAttributes::test_default()
                },
            )]
            .into_iter()
            .collect(),
        );

        // now = 250s: partition 1 (max_ts 10.1s) is past the backlog,
        // partition 2 (max_ts 200.1s) is not.
        let dropped = store.trim_logs_based_on_time(&logs, RecordTimestamp(250_000)).unwrap();
        assert_eq!(dropped, vec![p1]);
        assert!(store.partition(p1).is_none());
        assert!(store.partition(p2).is_some());
        // Dropped ids are never reused.
        assert!(store.first_partition_id() > p1);
        // Trim point advanced to the dropped directory bound.
        assert_eq!(store.trim_point(LogId(1)).unwrap(), Lsn::from_parts(Epoch(1), Esn(1)));

        // A log without backlog pins its partitions.
        let logs_infinite = LogsConfig::new(
            [(1, LogAttributes { backlog: None, ..LogAttributes::test_default() })]
                .into_iter()
                .collect(),
        );
        let dropped = store.trim_logs_based_on_time(&logs_infinite, RecordTimestamp(900_000)).unwrap();
        assert!(dropped.is_empty());
    }

    #[test]
    fn fail_safe_blocks_writes_after_disable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        store.accepting.store(ACCEPTING_DISABLED, Ordering::Release);
        assert_matches!(
            store.write_record(
                &RecordWrite {
                    log: LogId(1),
                    lsn: Lsn::from_parts(Epoch(1), Esn(1)),
                    timestamp: RecordTimestamp(1),
                    flags: 0,
                    wave: 1,
                    copyset: &[],
                    payload: b"",
                },
                &WriteOptions::default(),
            ),
            Err(Status::Disabled)
        );
        // Reads still work in fail-safe mode.
        assert!(store.read_record_raw(LogId(1), Lsn(1)).is_ok());
    }

    #[test]
    fn metadata_log_records_live_in_unpartitioned_cf() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(&dir);
        let meta_log = LogId(5).metadata_log();
        store
            .write_record(
                &RecordWrite {
                    log: meta_log,
                    lsn: Lsn::from_parts(Epoch(1), Esn(1)),
                    timestamp: RecordTimestamp(1),
                    flags: 0,
                    wave: 1,
                    copyset: &[],
                    payload: b"epoch metadata",
                },
                &WriteOptions::default(),
            )
            .unwrap();
        // No directory entry: the unpartitioned column family is not
        // subject to retention.
        assert!(store.directory_snapshot_for_log(meta_log).is_empty());
        assert!(store.read_record_raw(meta_log, Lsn::from_parts(Epoch(1), Esn(1))).unwrap().is_some());
    }
}
