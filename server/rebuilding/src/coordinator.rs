//! The per-node rebuilding coordinator. Subscribes to the event-log state
//! machine, restarts per-shard rebuilding when the set changes (after a
//! grace period collapsing bursts), acts as a donor through
//! ShardRebuilding, publishes dirty ranges left by unclean shutdowns, and
//! acknowledges its own shards once they are whole again.

use crate::event_log::{
    shard_is_rebuilt_flags, shard_needs_rebuild_flags, EventLogRebuildingSet, EventLogRecord,
    EventLogStateMachine, EventLogSubscription, EventLogWriter, ShardNeedsRebuildEvent,
};
use crate::metrics;
use crate::planner::{HistoricalMetadataSource, RebuildingPlan, RebuildingPlanner};
use crate::shard_rebuilding::{ChunkRereplicator, ShardRebuilding, ShardRebuildingListener};
use crate::types::{AuthoritativeStatus, RebuildingMode, RebuildingNodeInfo, RebuildingSet};
use logd_config::{RebuildingSettings, UpdateableConfig};
use logd_primitives::{
    Lsn, NodeIndex, RecordTimestamp, ShardId, ShardIndex, Status,
};
use logd_storage::{
    Durability, StorageTask, StorageTaskContext, StorageThreadPool, ThreadType,
};
use logd_store::{
    RebuildingCompleteMetadata, RebuildingRangesMetadata, ShardedLogsDb, WriteOptions,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

/// A storage task writing the marker that the shard holds a complete copy
/// of its data, clearing any dirty time ranges in the same breath. Not
/// droppable: acknowledging rebuilding depends on it.
struct WriteShardRebuildingCompleteMetadataTask {
    owner: Weak<RebuildingCoordinator>,
    version: Lsn,
    shard: ShardIndex,
}

impl StorageTask for WriteShardRebuildingCompleteMetadataTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Metadata
    }

    fn durability(&self) -> Durability {
        Durability::SyncWrite
    }

    fn is_droppable(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        if ctx.store.accepting_writes() == Status::Disabled {
            tracing::info!(
                target: "rebuilding",
                shard = ctx.shard_idx,
                "not writing RebuildingCompleteMetadata for disabled shard"
            );
            return Status::Disabled;
        }
        // Rebuilding is complete: clear the dirty time ranges first so a
        // crash between the two writes errs towards re-rebuilding.
        let options = WriteOptions::default();
        if let Err(status) =
            ctx.store.write_store_metadata(&RebuildingRangesMetadata::default(), &options)
        {
            tracing::error!(
                target: "rebuilding",
                shard = ctx.shard_idx,
                %status,
                "could not clear RebuildingRangesMetadata"
            );
            return status;
        }
        if let Err(status) = ctx.store.write_store_metadata(&RebuildingCompleteMetadata, &options) {
            tracing::error!(
                target: "rebuilding",
                shard = ctx.shard_idx,
                %status,
                "could not write RebuildingCompleteMetadata"
            );
            return status;
        }
        Status::Ok
    }

    fn on_done(self: Box<Self>, status: Status) {
        if let Some(owner) = self.owner.upgrade() {
            owner.on_marker_written(self.shard, self.version, status);
        }
    }

    fn on_dropped(self: Box<Self>) {
        unreachable!("marker write task is not droppable");
    }

    fn name(&self) -> &'static str {
        "WriteShardRebuildingCompleteMetadataTask"
    }
}

struct ShardState {
    version: Lsn,
    restart_version: Lsn,
    rebuilding_set: Arc<RebuildingSet>,
    global_window_end: RecordTimestamp,
    participating: bool,
    is_authoritative: bool,
    shard_rebuilding: Option<Arc<ShardRebuilding>>,
    recoverable_shards: usize,
    set_contains_myself: bool,
}

struct CoordinatorState {
    shards_rebuilding: BTreeMap<ShardIndex, ShardState>,
    dirty_shards: BTreeMap<ShardIndex, RebuildingRangesMetadata>,
    /// Shards whose rebuilding-complete marker was missing at startup.
    data_missing: BTreeSet<ShardIndex>,
    restart_scheduled: BTreeSet<ShardIndex>,
    first_update: bool,
    last_seen_version: Lsn,
    shutting_down: bool,
}

type RestartScheduler = Box<dyn Fn(ShardIndex) + Send + Sync>;

pub struct RebuildingCoordinator {
    config: Arc<UpdateableConfig>,
    event_log: Arc<EventLogStateMachine>,
    writer: EventLogWriter,
    stores: Arc<ShardedLogsDb>,
    pools: Vec<Arc<StorageThreadPool>>,
    settings: Arc<RebuildingSettings>,
    metadata_source: Arc<dyn HistoricalMetadataSource>,
    rereplicator: Arc<dyn ChunkRereplicator>,
    my_node: NodeIndex,
    state: Mutex<CoordinatorState>,
    /// Defers `restart_for_shard` by the restarts grace period; installed
    /// by the node assembly on a timer. Without one restarts run inline.
    restart_scheduler: Mutex<Option<RestartScheduler>>,
    subscription: Mutex<Option<EventLogSubscription>>,
}

impl RebuildingCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<UpdateableConfig>,
        event_log: Arc<EventLogStateMachine>,
        stores: Arc<ShardedLogsDb>,
        pools: Vec<Arc<StorageThreadPool>>,
        settings: Arc<RebuildingSettings>,
        metadata_source: Arc<dyn HistoricalMetadataSource>,
        rereplicator: Arc<dyn ChunkRereplicator>,
        my_node: NodeIndex,
    ) -> Arc<RebuildingCoordinator> {
        let writer = EventLogWriter::new(event_log.clone());
        Arc::new(RebuildingCoordinator {
            config,
            event_log,
            writer,
            stores,
            pools,
            settings,
            metadata_source,
            rereplicator,
            my_node,
            state: Mutex::new(CoordinatorState {
                shards_rebuilding: BTreeMap::new(),
                dirty_shards: BTreeMap::new(),
                data_missing: BTreeSet::new(),
                restart_scheduled: BTreeSet::new(),
                first_update: true,
                last_seen_version: Lsn::INVALID,
                shutting_down: false,
            }),
            restart_scheduler: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    pub fn set_restart_scheduler(&self, scheduler: RestartScheduler) {
        *self.restart_scheduler.lock() = Some(scheduler);
    }

    pub fn num_shards(&self) -> ShardIndex {
        self.stores.num_shards()
    }

    /// Startup: verify markers, load dirty ranges, subscribe to the event
    /// log.
    pub fn start(self: &Arc<Self>) -> Result<(), Status> {
        self.check_markers()?;
        self.populate_dirty_shard_cache();
        let weak = Arc::downgrade(self);
        let sub = self.event_log.subscribe(move |set, delta, version| {
            if let Some(this) = weak.upgrade() {
                this.on_update(set, delta, version);
            }
        });
        *self.subscription.lock() = Some(sub);
        tracing::info!(target: "rebuilding", "subscribed to the event log");
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        for shard_state in state.shards_rebuilding.values_mut() {
            if let Some(sr) = shard_state.shard_rebuilding.take() {
                sr.abort();
            }
        }
        state.shards_rebuilding.clear();
        drop(state);
        *self.subscription.lock() = None;
    }

    /// On a first-generation node the marker is written unconditionally:
    /// there is nothing to have lost. A replaced node (generation > 1)
    /// with no marker lost its data and requests its own rebuild.
    fn check_markers(self: &Arc<Self>) -> Result<(), Status> {
        let my_generation = self
            .config
            .server_config()
            .node(self.my_node)
            .map(|n| n.node_id.generation)
            .unwrap_or(1);
        let mut rebuild_requests: Vec<ShardIndex> = Vec::new();
        for (shard, store) in self.stores.iter() {
            if my_generation <= 1 {
                if let Err(status) =
                    store.write_store_metadata(&RebuildingCompleteMetadata, &WriteOptions::default())
                {
                    tracing::error!(
                        target: "rebuilding",
                        shard,
                        %status,
                        "could not write RebuildingCompleteMetadata"
                    );
                    if store.accepting_writes() != Status::Disabled {
                        return Err(status);
                    }
                }
                continue;
            }
            match store.read_store_metadata::<RebuildingCompleteMetadata>() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::info!(
                        target: "rebuilding",
                        shard,
                        "no RebuildingCompleteMetadata found, waiting for the shard to be rebuilt"
                    );
                    self.state.lock().data_missing.insert(shard);
                    rebuild_requests.push(shard);
                }
                Err(status) => {
                    // Most likely the disk is still broken; once it is
                    // replaced the process restarts and rereads.
                    tracing::error!(
                        target: "rebuilding",
                        shard,
                        %status,
                        "error reading RebuildingCompleteMetadata"
                    );
                    if store.accepting_writes() != Status::Disabled {
                        return Err(status);
                    }
                }
            }
        }
        for shard in rebuild_requests {
            self.restart_for_my_shard(shard, 0, None, Lsn::INVALID);
        }
        Ok(())
    }

    fn populate_dirty_shard_cache(&self) {
        let mut state = self.state.lock();
        for (shard, store) in self.stores.iter() {
            match store.read_store_metadata::<RebuildingRangesMetadata>() {
                Ok(Some(meta)) if !meta.is_empty() => {
                    state.dirty_shards.insert(shard, meta);
                }
                Ok(_) => {}
                Err(status) => {
                    tracing::error!(
                        target: "rebuilding",
                        shard,
                        %status,
                        "could not read RebuildingRangesMetadata"
                    );
                    // Unreadable shard: a full rebuild will be requested
                    // anyway, dirty state is moot.
                }
            }
        }
    }

    /// Event-log subscription callback.
    pub fn on_update(
        self: &Arc<Self>,
        set: &EventLogRebuildingSet,
        delta: Option<&EventLogRecord>,
        version: Lsn,
    ) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.last_seen_version = version;
        }
        let first = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.first_update)
        };
        if first {
            // The RSM delivers its first update once caught up with the
            // tail; now is the moment to publish ranges left dirty by an
            // unclean shutdown.
            self.publish_dirty_shards(set);
        }

        let Some(delta) = delta else {
            // No delta: re-derive everything from the new set.
            for shard in set.shards.keys() {
                self.schedule_restart_for_shard(*shard);
            }
            return;
        };
        match delta {
            EventLogRecord::ShardNeedsRebuild(e) => self.schedule_restart_for_shard(e.shard),
            EventLogRecord::ShardAbortRebuild { shard, .. } => {
                self.schedule_restart_for_shard(*shard)
            }
            EventLogRecord::ShardIsRebuilt { donor, shard, version, .. } => {
                if !self.restart_is_scheduled(*shard) {
                    self.on_shard_is_rebuilt(*donor, *shard, *version, set);
                }
            }
            EventLogRecord::ShardDonorProgress { shard, version, .. } => {
                if !self.restart_is_scheduled(*shard) {
                    self.on_shard_donor_progress(*shard, *version, set);
                }
            }
            EventLogRecord::ShardAckRebuilt { node, shard, version } => {
                if !self.restart_is_scheduled(*shard) {
                    self.on_shard_ack_rebuilt(*node, *shard, *version);
                }
            }
            EventLogRecord::ShardUndrain { node, shard } => {
                if !self.restart_is_scheduled(*shard) {
                    self.on_shard_undrain(*node, *shard, set);
                }
            }
            EventLogRecord::ShardUnrecoverable { shard, .. } => {
                if !self.restart_is_scheduled(*shard) {
                    self.on_shard_mark_unrecoverable(*shard, set);
                }
            }
        }
    }

    pub fn restart_is_scheduled(&self, shard: ShardIndex) -> bool {
        self.state.lock().restart_scheduled.contains(&shard)
    }

    /// Deltas arriving in bursts collapse into one restart per shard
    /// after the grace period.
    pub fn schedule_restart_for_shard(self: &Arc<Self>, shard: ShardIndex) {
        if shard >= self.num_shards() {
            tracing::error!(
                target: "rebuilding",
                shard,
                num_shards = self.num_shards(),
                "request to rebuild a shard this node does not have"
            );
            return;
        }
        if !self.state.lock().restart_scheduled.insert(shard) {
            return; // already scheduled; the burst collapses
        }
        let scheduler = self.restart_scheduler.lock();
        match &*scheduler {
            Some(schedule) => {
                tracing::info!(
                    target: "rebuilding",
                    shard,
                    grace_ms = self.settings.rebuilding_restarts_grace_period.as_millis() as u64,
                    "scheduling a rebuilding restart"
                );
                schedule(shard);
            }
            None => {
                drop(scheduler);
                self.restart_for_shard(shard);
            }
        }
    }

    /// (Re)starts rebuilding of one shard from the current folded set.
    pub fn restart_for_shard(self: &Arc<Self>, shard: ShardIndex) {
        let set = self.event_log.current_set();
        let mut events: Vec<EventLogRecord> = Vec::new();
        let mut marker_version: Option<Lsn> = None;

        {
            let mut state = self.state.lock();
            state.restart_scheduled.remove(&shard);
            if let Some(existing) = state.shards_rebuilding.get(&shard) {
                debug_assert!(existing.restart_version <= set.last_seen_lsn());
                if existing.restart_version == set.last_seen_lsn() {
                    tracing::error!(
                        target: "rebuilding",
                        shard,
                        version = %set.last_seen_lsn(),
                        "not restarting rebuilding: restart version has not changed"
                    );
                    return;
                }
                Self::abort_shard_rebuilding_locked(&mut state, shard);
            }

            let Some(info) = set.for_shard(shard) else {
                return; // nothing to restart
            };

            let mut rebuilding_set = RebuildingSet {
                all_dirty_time_intervals: info.all_dirty_time_intervals.clone(),
                ..RebuildingSet::default()
            };
            let mut my_shard_draining = false;
            for (node, node_info) in &info.nodes {
                if !node_info.acked {
                    let shard_id = ShardId::new(*node, shard);
                    rebuilding_set.shards.insert(
                        shard_id,
                        RebuildingNodeInfo {
                            mode: node_info.mode,
                            dc_dirty_ranges: node_info.dc_dirty_ranges.clone(),
                        },
                    );
                    if node_info.auth_status == AuthoritativeStatus::AuthoritativeEmpty {
                        rebuilding_set.empty.insert(shard_id);
                    }
                }
                if *node == self.my_node {
                    my_shard_draining = node_info.drain;
                }
            }
            debug_assert!(!rebuilding_set.shards.is_empty());
            let rebuilding_set = Arc::new(rebuilding_set);
            let contains_myself =
                rebuilding_set.shards.contains_key(&ShardId::new(self.my_node, shard));

            state.shards_rebuilding.insert(
                shard,
                ShardState {
                    version: info.version,
                    restart_version: set.last_seen_lsn(),
                    rebuilding_set: rebuilding_set.clone(),
                    global_window_end: RecordTimestamp::MIN,
                    participating: false,
                    is_authoritative: true,
                    shard_rebuilding: None,
                    recoverable_shards: info.num_recoverable,
                    set_contains_myself: contains_myself,
                },
            );
            if contains_myself {
                metrics::SET_CONTAINS_MYSELF.set(
                    state
                        .shards_rebuilding
                        .values()
                        .filter(|s| s.set_contains_myself)
                        .count() as i64,
                );
            }

            if Self::should_acknowledge_rebuilding_locked(&mut state, self.my_node, shard, &set) {
                marker_version = Some(info.version);
            } else if contains_myself {
                // My shard is in the set. Either the data is actually
                // intact (abort, or convert a RESTORE drain to RELOCATE),
                // or the data is gone and may need to be declared
                // unrecoverable to unstall readers.
                let is_restore = rebuilding_set
                    .shards
                    .get(&ShardId::new(self.my_node, shard))
                    .map(|i| i.mode == RebuildingMode::Restore)
                    .unwrap_or(false);
                let data_intact = !state.data_missing.contains(&shard)
                    && self
                        .stores
                        .by_index(shard)
                        .map(|s| s.accepting_writes() != Status::Disabled)
                        .unwrap_or(false);
                let dirty = state.dirty_shards.get(&shard).cloned();
                if data_intact {
                    if !my_shard_draining {
                        let published =
                            set.node_info(self.my_node, shard).map(|i| i.dc_dirty_ranges.clone());
                        events.extend(Self::abort_or_downgrade_events(
                            self.my_node,
                            shard,
                            info.version,
                            dirty,
                            published,
                            "data is intact",
                        ));
                    } else if is_restore && dirty.is_none() {
                        tracing::info!(
                            target: "rebuilding",
                            shard,
                            "data is intact, restarting rebuilding to continue the drain in RELOCATE mode"
                        );
                        events.push(Self::needs_rebuild_event(
                            self.my_node,
                            shard,
                            shard_needs_rebuild_flags::RELOCATE
                                | shard_needs_rebuild_flags::DRAIN
                                | shard_needs_rebuild_flags::CONDITIONAL_ON_VERSION,
                            None,
                            info.version,
                            self.settings.allow_conditional_rebuilding_restarts,
                        ));
                    }
                } else if is_restore {
                    // Data gone but the shard is functioning: mark it
                    // unrecoverable so stalled readers move on, accepting
                    // visible loss. A ranged rebuild converts to a full
                    // one first.
                    if rebuilding_set
                        .shards
                        .get(&ShardId::new(self.my_node, shard))
                        .map(|i| i.is_ranged())
                        .unwrap_or(false)
                    {
                        events.push(Self::needs_rebuild_event(
                            self.my_node,
                            shard,
                            0,
                            None,
                            Lsn::INVALID,
                            false,
                        ));
                    }
                    tracing::info!(
                        target: "rebuilding",
                        shard,
                        "notifying the event log that my shard is unrecoverable"
                    );
                    events.push(EventLogRecord::ShardUnrecoverable { node: self.my_node, shard });
                }
            }

            if info.donor_progress.contains_key(&self.my_node) {
                // We are a donor: plan which logs and epochs to re-read.
                let shard_state = state.shards_rebuilding.get_mut(&shard).unwrap();
                shard_state.participating = true;
                shard_state.global_window_end = RecordTimestamp::MIN;

                let logs_config = self.config.logs_config();
                let mut plans: BTreeMap<u64, RebuildingPlan> = BTreeMap::new();
                let mut authoritative = true;
                for (log, _) in logs_config.iter() {
                    let history = self.metadata_source.historical_metadata(log);
                    let (plan, log_authoritative) =
                        RebuildingPlanner::plan_log(log, &history, &rebuilding_set);
                    authoritative &= log_authoritative;
                    if !plan.is_empty() {
                        plans.insert(log.0, plan);
                    }
                }
                shard_state.is_authoritative = authoritative;

                if plans.is_empty() {
                    tracing::info!(
                        target: "rebuilding",
                        shard,
                        set = %rebuilding_set.describe(),
                        "empty rebuilding plan, nothing to re-replicate"
                    );
                    shard_state.participating = false;
                    let version = shard_state.version;
                    let flags = if authoritative {
                        0
                    } else {
                        shard_is_rebuilt_flags::NON_AUTHORITATIVE
                    };
                    events.push(EventLogRecord::ShardIsRebuilt {
                        donor: self.my_node,
                        shard,
                        version,
                        flags,
                    });
                } else {
                    tracing::info!(
                        target: "rebuilding",
                        shard,
                        logs = plans.len(),
                        set = %rebuilding_set.describe(),
                        "got rebuilding plan, starting to re-replicate"
                    );
                    let pool = self.pools[shard as usize].clone();
                    let sr = ShardRebuilding::new(
                        shard,
                        shard_state.version,
                        shard_state.restart_version,
                        rebuilding_set,
                        plans,
                        ShardId::new(self.my_node, shard),
                        pool,
                        self.rereplicator.clone(),
                        self.clone() as Arc<dyn ShardRebuildingListener>,
                        self.settings.max_malformed_records_to_tolerate,
                        self.settings.max_batch_bytes as u64,
                        self.settings.max_batch_time,
                    );
                    shard_state.shard_rebuilding = Some(sr.clone());
                    drop(state);
                    self.try_slide_global_window(shard, &set);
                    sr.start();
                    for event in events {
                        self.writer.write_event(event);
                    }
                    return;
                }
            }
        }

        if let Some(version) = marker_version {
            self.write_marker_for_shard(shard, version);
        }
        for event in events {
            self.writer.write_event(event);
        }
    }

    fn needs_rebuild_event(
        node: NodeIndex,
        shard: ShardIndex,
        mut flags: u32,
        ranges: Option<RebuildingRangesMetadata>,
        conditional_version: Lsn,
        allow_conditional: bool,
    ) -> EventLogRecord {
        let mut version = conditional_version;
        if !allow_conditional {
            flags &= !shard_needs_rebuild_flags::CONDITIONAL_ON_VERSION;
            version = Lsn::INVALID;
        }
        EventLogRecord::ShardNeedsRebuild(ShardNeedsRebuildEvent {
            node,
            shard,
            source: format!("N{}", node),
            details: "RebuildingCoordinator".to_owned(),
            flags,
            conditional_version: version,
            dirty_ranges: ranges,
        })
    }

    fn abort_or_downgrade_events(
        node: NodeIndex,
        shard: ShardIndex,
        version: Lsn,
        dirty: Option<RebuildingRangesMetadata>,
        published: Option<BTreeMap<crate::types::DataClass, Vec<logd_primitives::RecordTimeInterval>>>,
        reason: &str,
    ) -> Vec<EventLogRecord> {
        match dirty {
            Some(ranges) => {
                if published.as_ref() == Some(&ranges_as_dc_map(&ranges)) {
                    tracing::info!(
                        target: "rebuilding",
                        shard,
                        reason,
                        "cluster already rebuilding the correct dirty ranges; abort is a no-op"
                    );
                    return Vec::new();
                }
                tracing::info!(
                    target: "rebuilding",
                    shard,
                    reason,
                    "abort request downgraded to a time-ranged rebuild: shard is dirty"
                );
                vec![Self::needs_rebuild_event(node, shard, 0, Some(ranges), Lsn::INVALID, false)]
            }
            None => {
                tracing::info!(target: "rebuilding", shard, reason, "aborting rebuilding of my shard");
                vec![EventLogRecord::ShardAbortRebuild { node, shard, version }]
            }
        }
    }

    fn abort_shard_rebuilding_locked(state: &mut CoordinatorState, shard: ShardIndex) {
        if let Some(shard_state) = state.shards_rebuilding.get_mut(&shard) {
            if let Some(sr) = shard_state.shard_rebuilding.take() {
                sr.abort();
            }
            shard_state.participating = false;
            shard_state.is_authoritative = true;
        }
    }

    pub fn on_shard_is_rebuilt(
        self: &Arc<Self>,
        donor: NodeIndex,
        shard: ShardIndex,
        version: Lsn,
        set: &EventLogRebuildingSet,
    ) {
        if set.for_shard(shard).is_none() {
            return;
        }
        let marker_version = {
            let mut state = self.state.lock();
            let Some(shard_state) = state.shards_rebuilding.get(&shard) else { return };
            if shard_state.version != version {
                // The donor sent this before it saw the newer
                // SHARD_NEEDS_REBUILD or SHARD_ABORT_REBUILD.
                return;
            }
            if donor == self.my_node {
                // Our own SHARD_IS_REBUILT, possibly from before a crash
                // while we are catching up on the event log. Any running
                // run is stale.
                Self::abort_shard_rebuilding_locked(&mut state, shard);
            }
            if Self::should_acknowledge_rebuilding_locked(&mut state, self.my_node, shard, set) {
                Some(state.shards_rebuilding[&shard].version)
            } else {
                None
            }
        };
        if let Some(version) = marker_version {
            self.write_marker_for_shard(shard, version);
        }
        if set.for_shard(shard).map(|i| !i.donor_progress.is_empty()).unwrap_or(false) {
            self.try_slide_global_window(shard, set);
        }
    }

    pub fn on_shard_donor_progress(
        self: &Arc<Self>,
        shard: ShardIndex,
        version: Lsn,
        set: &EventLogRebuildingSet,
    ) {
        {
            let state = self.state.lock();
            let Some(shard_state) = state.shards_rebuilding.get(&shard) else { return };
            if shard_state.version != version || !shard_state.participating {
                return;
            }
        }
        self.try_slide_global_window(shard, set);
    }

    /// Slides the global window to min(donor next timestamps) plus the
    /// configured width, and tells the running ShardRebuilding.
    fn try_slide_global_window(self: &Arc<Self>, shard: ShardIndex, set: &EventLogRebuildingSet) {
        let Some(window) = self.settings.global_window else {
            return; // windowing disabled, donors run free
        };
        let Some(info) = set.for_shard(shard) else { return };
        let min_next = info.donor_progress.values().copied().min();
        let Some(min_next) = min_next else { return };
        let new_end = if min_next == RecordTimestamp::MIN {
            // Some donors have not made progress yet; moving the window
            // from min to min + width achieves nothing.
            RecordTimestamp::MIN
        } else {
            min_next.saturating_add(window)
        };

        let sr = {
            let mut state = self.state.lock();
            let Some(shard_state) = state.shards_rebuilding.get_mut(&shard) else { return };
            if new_end <= shard_state.global_window_end {
                return;
            }
            tracing::info!(
                target: "rebuilding",
                shard,
                window_end = %new_end,
                set = %shard_state.rebuilding_set.describe(),
                "sliding the global window"
            );
            shard_state.global_window_end = new_end;
            metrics::GLOBAL_WINDOW_SLIDES.inc();
            shard_state.shard_rebuilding.clone()
        };
        if let Some(sr) = sr {
            sr.advance_global_window(new_end);
        }
    }

    /// Whether this node may acknowledge its shard as rebuilt: every
    /// donor done (or the shard authoritative-empty), not draining, and
    /// the marker can be durably written.
    fn should_acknowledge_rebuilding_locked(
        state: &mut CoordinatorState,
        my_node: NodeIndex,
        shard: ShardIndex,
        set: &EventLogRebuildingSet,
    ) -> bool {
        let Some(shard_state) = state.shards_rebuilding.get(&shard) else { return false };
        if !shard_state.set_contains_myself {
            return false;
        }
        let Some(info) = set.node_info(my_node, shard) else { return false };

        if info.auth_status == AuthoritativeStatus::AuthoritativeEmpty {
            // The shard went to the empty state; its dirty ranges are no
            // longer relevant and will be cleared with the marker write.
            state.dirty_shards.remove(&shard);
            if info.drain {
                tracing::info!(
                    target: "rebuilding",
                    shard,
                    "not acking rebuilding: shard is drained; write SHARD_UNDRAIN to let it \
                     take writes again"
                );
                return false;
            }
            return true;
        }

        if info.donors_remaining.is_empty() {
            let num_recoverable = set.for_shard(shard).map(|i| i.num_recoverable).unwrap_or(0);
            // Dirty (time-ranged) shards are always authoritative: ack
            // once every donor is done and nothing recoverable is
            // outstanding. Full-shard rebuilds ack through the
            // AUTHORITATIVE_EMPTY transition above.
            if !info.dc_dirty_ranges.is_empty() && num_recoverable == 0 {
                debug_assert!(!info.drain);
                return true;
            }
            tracing::info!(
                target: "rebuilding",
                shard,
                "rebuilding completed non-authoritatively, not acking; waiting for shards to \
                 come back or be marked unrecoverable"
            );
        }
        false
    }

    /// Issues the marker write; the ack event follows once the storage
    /// task reports the marker durable.
    fn write_marker_for_shard(self: &Arc<Self>, shard: ShardIndex, version: Lsn) {
        tracing::info!(target: "rebuilding", shard, %version, "writing rebuilding-complete marker");
        let task = WriteShardRebuildingCompleteMetadataTask {
            owner: Arc::downgrade(self),
            version,
            shard,
        };
        if let Err((status, _)) = self.pools[shard as usize].try_put_task(Box::new(task)) {
            tracing::error!(
                target: "rebuilding",
                shard,
                %status,
                "could not enqueue the marker write"
            );
        }
    }

    pub(crate) fn on_marker_written(self: &Arc<Self>, shard: ShardIndex, version: Lsn, status: Status) {
        if status != Status::Ok {
            // Probably a failing disk that has not been replaced yet; a
            // restart retries the write.
            tracing::error!(
                target: "rebuilding",
                shard,
                %status,
                "error writing RebuildingCompleteMetadata"
            );
            return;
        }
        {
            let mut state = self.state.lock();
            state.dirty_shards.remove(&shard);
            state.data_missing.remove(&shard);
        }
        self.writer.write_event(EventLogRecord::ShardAckRebuilt {
            node: self.my_node,
            shard,
            version,
        });
    }

    pub fn on_shard_ack_rebuilt(self: &Arc<Self>, node: NodeIndex, shard: ShardIndex, version: Lsn) {
        let mut state = self.state.lock();
        let Some(shard_state) = state.shards_rebuilding.get_mut(&shard) else { return };
        if shard_state.version != version {
            return;
        }
        let shard_id = ShardId::new(node, shard);
        if !shard_state.rebuilding_set.contains(shard_id) {
            tracing::error!(
                target: "rebuilding",
                shard,
                node,
                "SHARD_ACK_REBUILT for a shard not in the rebuilding set, ignoring"
            );
            return;
        }
        let mut new_set = (*shard_state.rebuilding_set).clone();
        new_set.shards.remove(&shard_id);
        shard_state.rebuilding_set = Arc::new(new_set);
        if shard_state.rebuilding_set.shards.is_empty() {
            Self::abort_shard_rebuilding_locked(&mut state, shard);
            state.shards_rebuilding.remove(&shard);
        } else if node == self.my_node {
            state.shards_rebuilding.get_mut(&shard).unwrap().set_contains_myself = false;
        }
        metrics::SET_CONTAINS_MYSELF.set(
            state.shards_rebuilding.values().filter(|s| s.set_contains_myself).count() as i64,
        );
    }

    pub fn on_shard_undrain(self: &Arc<Self>, node: NodeIndex, shard: ShardIndex, set: &EventLogRebuildingSet) {
        if node != self.my_node {
            return;
        }
        let mut events = Vec::new();
        let mut marker_version = None;
        {
            let mut state = self.state.lock();
            let in_set = state
                .shards_rebuilding
                .get(&shard)
                .map(|s| s.rebuilding_set.contains(ShardId::new(node, shard)))
                .unwrap_or(false);
            if !in_set {
                tracing::error!(
                    target: "rebuilding",
                    shard,
                    node,
                    "SHARD_UNDRAIN for a shard not in the rebuilding set, ignoring"
                );
                return;
            }
            let data_intact = !state.data_missing.contains(&shard)
                && self
                    .stores
                    .by_index(shard)
                    .map(|s| s.accepting_writes() != Status::Disabled)
                    .unwrap_or(false);
            if data_intact {
                let dirty = state.dirty_shards.get(&shard).cloned();
                let version =
                    state.shards_rebuilding.get(&shard).map(|s| s.version).unwrap_or(Lsn::INVALID);
                let published = set.node_info(node, shard).map(|i| i.dc_dirty_ranges.clone());
                events = Self::abort_or_downgrade_events(
                    node,
                    shard,
                    version,
                    dirty,
                    published,
                    "undrain and data is intact",
                );
            } else if Self::should_acknowledge_rebuilding_locked(&mut state, self.my_node, shard, set) {
                marker_version = state.shards_rebuilding.get(&shard).map(|s| s.version);
            }
        }
        for event in events {
            self.writer.write_event(event);
        }
        if let Some(version) = marker_version {
            self.write_marker_for_shard(shard, version);
        }
    }

    pub fn on_shard_mark_unrecoverable(self: &Arc<Self>, shard: ShardIndex, set: &EventLogRebuildingSet) {
        let marker_version = {
            let mut state = self.state.lock();
            if state.shards_rebuilding.get(&shard).is_none() {
                return;
            }
            if Self::should_acknowledge_rebuilding_locked(&mut state, self.my_node, shard, set) {
                state.shards_rebuilding.get(&shard).map(|s| s.version)
            } else {
                let shard_state = state.shards_rebuilding.get_mut(&shard).unwrap();
                shard_state.recoverable_shards =
                    set.for_shard(shard).map(|i| i.num_recoverable).unwrap_or(0);
                None
            }
        };
        if let Some(version) = marker_version {
            self.write_marker_for_shard(shard, version);
        }
    }

    /// The event log was trimmed past our state: these rebuildings
    /// completed long ago, drop them.
    pub fn on_event_log_trimmed(self: &Arc<Self>, hi: Lsn) {
        let mut state = self.state.lock();
        for (shard, shard_state) in std::mem::take(&mut state.shards_rebuilding) {
            debug_assert!(shard_state.version <= hi);
            if let Some(sr) = shard_state.shard_rebuilding {
                sr.abort();
            }
            let _ = shard;
        }
    }

    /// Publishes dirty time ranges found after an unclean shutdown, once
    /// the first event-log update showed us the cluster state.
    fn publish_dirty_shards(self: &Arc<Self>, set: &EventLogRebuildingSet) {
        if !self.settings.rebuild_dirty_shards {
            tracing::info!(target: "rebuilding", "publishing dirty shard state is disabled");
            return;
        }
        let mut events = Vec::new();
        {
            let state = self.state.lock();
            if !state.dirty_shards.is_empty() {
                tracing::info!(target: "rebuilding", shards = state.dirty_shards.len(), "publishing dirty shards");
            }
            for (shard, ranges) in &state.dirty_shards {
                let data_intact = !state.data_missing.contains(shard)
                    && self
                        .stores
                        .by_index(*shard)
                        .map(|s| s.accepting_writes() != Status::Disabled)
                        .unwrap_or(false);
                if !data_intact {
                    // A full rebuild was already requested for this shard.
                    continue;
                }
                debug_assert!(!ranges.is_empty());
                if let Some(info) = set.node_info(self.my_node, *shard) {
                    if info.auth_status == AuthoritativeStatus::AuthoritativeEmpty {
                        // Rebuilt while we were down; the ack path clears
                        // the dirty state.
                        continue;
                    }
                    if info.drain {
                        tracing::info!(
                            target: "rebuilding",
                            shard,
                            "draining; not publishing dirty state"
                        );
                        if info.mode == RebuildingMode::Relocate {
                            // Some of our data is missing: the drain must
                            // run in RESTORE mode.
                            tracing::info!(
                                target: "rebuilding",
                                shard,
                                "converting drain from RELOCATE to RESTORE"
                            );
                            events.push(Self::needs_rebuild_event(
                                self.my_node,
                                *shard,
                                shard_needs_rebuild_flags::DRAIN,
                                None,
                                Lsn::INVALID,
                                false,
                            ));
                        }
                        continue;
                    }
                    let published: BTreeMap<_, _> = info.dc_dirty_ranges.clone();
                    let ours: BTreeMap<_, _> = ranges_as_dc_map(ranges);
                    if published == ours {
                        tracing::info!(
                            target: "rebuilding",
                            shard,
                            "current dirty ranges already published"
                        );
                        continue;
                    }
                }
                events.push(Self::needs_rebuild_event(
                    self.my_node,
                    *shard,
                    0,
                    Some(ranges.clone()),
                    Lsn::INVALID,
                    false,
                ));
            }
        }
        for event in events {
            self.writer.write_event(event);
        }
    }

    fn restart_for_my_shard(
        self: &Arc<Self>,
        shard: ShardIndex,
        flags: u32,
        ranges: Option<RebuildingRangesMetadata>,
        conditional_version: Lsn,
    ) {
        self.writer.write_event(Self::needs_rebuild_event(
            self.my_node,
            shard,
            flags,
            ranges,
            conditional_version,
            self.settings.allow_conditional_rebuilding_restarts,
        ));
    }

    pub fn last_seen_event_log_version(&self) -> Lsn {
        self.state.lock().last_seen_version
    }

    pub fn local_shards_rebuilding(&self) -> Vec<ShardIndex> {
        self.state
            .lock()
            .shards_rebuilding
            .iter()
            .filter(|(_, s)| s.set_contains_myself)
            .map(|(shard, _)| *shard)
            .collect()
    }

    pub fn global_window_end(&self, shard: ShardIndex) -> Option<RecordTimestamp> {
        self.state.lock().shards_rebuilding.get(&shard).map(|s| s.global_window_end)
    }

    /// Shards in the rebuilding set that may still come back with their
    /// data; non-authoritative rebuilds wait on these.
    pub fn recoverable_shards(&self, shard: ShardIndex) -> Option<usize> {
        self.state.lock().shards_rebuilding.get(&shard).map(|s| s.recoverable_shards)
    }
}

fn ranges_as_dc_map(
    ranges: &RebuildingRangesMetadata,
) -> BTreeMap<crate::types::DataClass, Vec<logd_primitives::RecordTimeInterval>> {
    let mut map = BTreeMap::new();
    if !ranges.append_ranges.is_empty() {
        map.insert(crate::types::DataClass::Append, ranges.append_ranges.clone());
    }
    if !ranges.rebuild_ranges.is_empty() {
        map.insert(crate::types::DataClass::Rebuild, ranges.rebuild_ranges.clone());
    }
    map
}

impl ShardRebuildingListener for RebuildingCoordinator {
    fn on_donor_progress(&self, shard: ShardIndex, next_ts: RecordTimestamp, version: Lsn) {
        if self.settings.global_window.is_none() {
            // Nobody is waiting on the window; skip the event traffic.
            return;
        }
        self.writer.write_event(EventLogRecord::ShardDonorProgress {
            donor: self.my_node,
            shard,
            next_timestamp: next_ts,
            version,
        });
    }

    fn on_shard_rebuilding_complete(&self, shard: ShardIndex, restart_version: Lsn) {
        let event = {
            let mut state = self.state.lock();
            let Some(shard_state) = state.shards_rebuilding.get_mut(&shard) else { return };
            if shard_state.restart_version != restart_version {
                return; // a restart superseded this run
            }
            debug_assert!(shard_state.participating);
            shard_state.shard_rebuilding = None;
            shard_state.participating = false;
            let flags = if shard_state.is_authoritative {
                0
            } else {
                shard_is_rebuilt_flags::NON_AUTHORITATIVE
            };
            EventLogRecord::ShardIsRebuilt {
                donor: self.my_node,
                shard,
                version: shard_state.version,
                flags,
            }
        };
        self.writer.write_event(event);
    }

    fn on_shard_rebuilding_failed(&self, shard: ShardIndex, restart_version: Lsn, status: Status) {
        tracing::error!(
            target: "rebuilding",
            shard,
            %restart_version,
            %status,
            "shard rebuilding failed; stalling until restarted"
        );
    }
}
