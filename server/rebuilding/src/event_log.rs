//! The event-log replicated state machine. Its delta log is itself a
//! LogDevice log, so every node observes the same totally-ordered stream
//! of deltas and folds them into the same [`EventLogRebuildingSet`];
//! versions are the LSNs of the deltas.

use crate::types::{AuthoritativeStatus, DataClass, RebuildingMode};
use logd_primitives::{Lsn, NodeIndex, RecordTimeInterval, RecordTimestamp, ShardIndex};
use logd_store::RebuildingRangesMetadata;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub mod shard_needs_rebuild_flags {
    /// Data is intact; rebuild as a relocation (drain).
    pub const RELOCATE: u32 = 1 << 0;
    /// The node is being drained and stays write-disabled after rebuild.
    pub const DRAIN: u32 = 1 << 1;
    /// Only apply if the shard's rebuilding version still equals
    /// `conditional_version`.
    pub const CONDITIONAL_ON_VERSION: u32 = 1 << 2;
}

pub mod shard_is_rebuilt_flags {
    /// The donor could not read everything it needed (some epochs could
    /// not meet replication without the rebuilding set).
    pub const NON_AUTHORITATIVE: u32 = 1 << 0;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardNeedsRebuildEvent {
    pub node: NodeIndex,
    pub shard: ShardIndex,
    pub source: String,
    pub details: String,
    pub flags: u32,
    pub conditional_version: Lsn,
    /// Dirty time ranges for a mini-rebuilding; None means the full shard.
    pub dirty_ranges: Option<RebuildingRangesMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventLogRecord {
    ShardNeedsRebuild(ShardNeedsRebuildEvent),
    ShardAbortRebuild { node: NodeIndex, shard: ShardIndex, version: Lsn },
    ShardIsRebuilt { donor: NodeIndex, shard: ShardIndex, version: Lsn, flags: u32 },
    ShardDonorProgress {
        donor: NodeIndex,
        shard: ShardIndex,
        next_timestamp: RecordTimestamp,
        version: Lsn,
    },
    ShardAckRebuilt { node: NodeIndex, shard: ShardIndex, version: Lsn },
    ShardUndrain { node: NodeIndex, shard: ShardIndex },
    ShardUnrecoverable { node: NodeIndex, shard: ShardIndex },
}

impl EventLogRecord {
    pub fn shard(&self) -> ShardIndex {
        match self {
            EventLogRecord::ShardNeedsRebuild(e) => e.shard,
            EventLogRecord::ShardAbortRebuild { shard, .. }
            | EventLogRecord::ShardIsRebuilt { shard, .. }
            | EventLogRecord::ShardDonorProgress { shard, .. }
            | EventLogRecord::ShardAckRebuilt { shard, .. }
            | EventLogRecord::ShardUndrain { shard, .. }
            | EventLogRecord::ShardUnrecoverable { shard, .. } => *shard,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRebuildingInfo {
    pub mode: RebuildingMode,
    pub dc_dirty_ranges: BTreeMap<DataClass, Vec<RecordTimeInterval>>,
    pub auth_status: AuthoritativeStatus,
    pub drain: bool,
    pub acked: bool,
    /// Full-shard RESTORE members may come back with their data; ranged
    /// rebuilds are always authoritative.
    pub recoverable: bool,
    pub donors_remaining: BTreeSet<NodeIndex>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ShardRebuildingInfo {
    pub nodes: BTreeMap<NodeIndex, NodeRebuildingInfo>,
    /// Last announced next-timestamp of every donor still rebuilding.
    pub donor_progress: BTreeMap<NodeIndex, RecordTimestamp>,
    /// Version of the rebuilding: LSN of the last SHARD_NEEDS_REBUILD or
    /// SHARD_ABORT_REBUILD delta affecting this shard.
    pub version: Lsn,
    pub all_dirty_time_intervals: Vec<RecordTimeInterval>,
    pub num_recoverable: usize,
}

/// Folded view of the event log: what is rebuilding where, cluster-wide.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLogRebuildingSet {
    pub shards: BTreeMap<ShardIndex, ShardRebuildingInfo>,
    last_seen_lsn: Lsn,
}

impl EventLogRebuildingSet {
    pub fn last_seen_lsn(&self) -> Lsn {
        self.last_seen_lsn
    }

    pub fn for_shard(&self, shard: ShardIndex) -> Option<&ShardRebuildingInfo> {
        self.shards.get(&shard)
    }

    pub fn node_info(&self, node: NodeIndex, shard: ShardIndex) -> Option<&NodeRebuildingInfo> {
        self.shards.get(&shard).and_then(|s| s.nodes.get(&node))
    }

    fn recompute_donors(&mut self, shard: ShardIndex, cluster_nodes: &[NodeIndex]) {
        let Some(info) = self.shards.get_mut(&shard) else { return };
        let rebuilding: BTreeSet<NodeIndex> =
            info.nodes.iter().filter(|(_, n)| !n.acked).map(|(idx, _)| *idx).collect();
        let donors: BTreeSet<NodeIndex> =
            cluster_nodes.iter().copied().filter(|n| !rebuilding.contains(n)).collect();
        info.donor_progress =
            donors.iter().map(|d| (*d, RecordTimestamp::MIN)).collect();
        for node in info.nodes.values_mut() {
            node.donors_remaining = donors.clone();
        }
        info.num_recoverable = info.nodes.values().filter(|n| n.recoverable && !n.acked).count();
    }

    /// Applies one delta at `version`. Deltas referencing stale versions
    /// are ignored, which is what makes replayed/misordered donor events
    /// harmless.
    pub fn apply(&mut self, delta: &EventLogRecord, version: Lsn, cluster_nodes: &[NodeIndex]) {
        debug_assert!(version > self.last_seen_lsn);
        self.last_seen_lsn = version;
        match delta {
            EventLogRecord::ShardNeedsRebuild(e) => {
                if e.flags & shard_needs_rebuild_flags::CONDITIONAL_ON_VERSION != 0 {
                    let current =
                        self.shards.get(&e.shard).map(|s| s.version).unwrap_or(Lsn::INVALID);
                    if current != e.conditional_version {
                        tracing::info!(
                            target: "rebuilding",
                            node = e.node,
                            shard = e.shard,
                            "ignoring conditional SHARD_NEEDS_REBUILD with stale version"
                        );
                        return;
                    }
                }
                let info = self.shards.entry(e.shard).or_default();
                info.version = version;
                let mode = if e.flags & shard_needs_rebuild_flags::RELOCATE != 0 {
                    RebuildingMode::Relocate
                } else {
                    RebuildingMode::Restore
                };
                let mut dc_dirty_ranges = BTreeMap::new();
                if let Some(ranges) = &e.dirty_ranges {
                    if !ranges.append_ranges.is_empty() {
                        dc_dirty_ranges.insert(DataClass::Append, ranges.append_ranges.clone());
                    }
                    if !ranges.rebuild_ranges.is_empty() {
                        dc_dirty_ranges.insert(DataClass::Rebuild, ranges.rebuild_ranges.clone());
                    }
                }
                let ranged = !dc_dirty_ranges.is_empty();
                info.nodes.insert(
                    e.node,
                    NodeRebuildingInfo {
                        mode,
                        dc_dirty_ranges,
                        auth_status: AuthoritativeStatus::Underreplication,
                        drain: e.flags & shard_needs_rebuild_flags::DRAIN != 0,
                        acked: false,
                        recoverable: mode == RebuildingMode::Restore && !ranged,
                        donors_remaining: BTreeSet::new(),
                    },
                );
                let mut all: Vec<RecordTimeInterval> = Vec::new();
                for node in info.nodes.values() {
                    for ranges in node.dc_dirty_ranges.values() {
                        all.extend(ranges.iter().copied());
                    }
                }
                info.all_dirty_time_intervals = all;
                self.recompute_donors(e.shard, cluster_nodes);
            }
            EventLogRecord::ShardAbortRebuild { node, shard, version: cond } => {
                let Some(info) = self.shards.get_mut(shard) else { return };
                if cond.is_valid() && *cond != info.version {
                    return;
                }
                info.nodes.remove(node);
                info.version = version;
                if info.nodes.is_empty() {
                    self.shards.remove(shard);
                } else {
                    self.recompute_donors(*shard, cluster_nodes);
                }
            }
            EventLogRecord::ShardIsRebuilt { donor, shard, version: v, .. } => {
                let Some(info) = self.shards.get_mut(shard) else { return };
                if *v != info.version {
                    return;
                }
                info.donor_progress.remove(donor);
                for node in info.nodes.values_mut() {
                    node.donors_remaining.remove(donor);
                    // A full-shard RESTORE member whose donors all
                    // finished is rebuilt: its data lives elsewhere now
                    // and readers may skip it.
                    if node.donors_remaining.is_empty()
                        && !node.acked
                        && node.mode == RebuildingMode::Restore
                        && node.dc_dirty_ranges.is_empty()
                    {
                        node.auth_status = AuthoritativeStatus::AuthoritativeEmpty;
                        node.recoverable = false;
                    }
                }
                info.num_recoverable =
                    info.nodes.values().filter(|n| n.recoverable && !n.acked).count();
            }
            EventLogRecord::ShardDonorProgress { donor, shard, next_timestamp, version: v } => {
                let Some(info) = self.shards.get_mut(shard) else { return };
                if *v != info.version {
                    return;
                }
                if let Some(progress) = info.donor_progress.get_mut(donor) {
                    *progress = (*progress).max(*next_timestamp);
                }
            }
            EventLogRecord::ShardAckRebuilt { node, shard, version: v } => {
                let Some(info) = self.shards.get_mut(shard) else { return };
                if *v != info.version {
                    return;
                }
                info.nodes.remove(node);
                if info.nodes.is_empty() {
                    self.shards.remove(shard);
                } else {
                    self.recompute_donors(*shard, cluster_nodes);
                }
            }
            EventLogRecord::ShardUndrain { node, shard } => {
                if let Some(info) = self.shards.get_mut(shard) {
                    if let Some(n) = info.nodes.get_mut(node) {
                        n.drain = false;
                    }
                }
            }
            EventLogRecord::ShardUnrecoverable { node, shard } => {
                // The data is declared lost; the auth status still only
                // flips to empty once the donors finish.
                if let Some(info) = self.shards.get_mut(shard) {
                    if let Some(n) = info.nodes.get_mut(node) {
                        n.recoverable = false;
                    }
                    info.num_recoverable =
                        info.nodes.values().filter(|n| n.recoverable && !n.acked).count();
                }
            }
        }
    }
}

type Subscriber = Arc<dyn Fn(&EventLogRebuildingSet, Option<&EventLogRecord>, Lsn) + Send + Sync>;

struct RsmState {
    set: EventLogRebuildingSet,
    next_lsn: Lsn,
    cluster_nodes: Vec<NodeIndex>,
}

struct NotifyQueue {
    notifying: bool,
    queue: std::collections::VecDeque<(EventLogRebuildingSet, Option<EventLogRecord>, Lsn)>,
}

/// Handle keeping a subscription alive; dropping it unsubscribes.
pub struct EventLogSubscription {
    id: u64,
    rsm: Arc<EventLogStateMachine>,
}

impl Drop for EventLogSubscription {
    fn drop(&mut self) {
        self.rsm.subscribers.lock().retain(|(id, _)| *id != self.id);
    }
}

/// The replicated state machine itself. In production its delta log rides
/// on the append path; this in-process core is the folding and
/// subscription engine both the coordinator and tests drive.
///
/// Notifications are queued and delivered outside of every internal lock,
/// so a subscriber may write further deltas from its callback; they are
/// delivered after the current one, in append order.
pub struct EventLogStateMachine {
    state: Mutex<RsmState>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_sub_id: std::sync::atomic::AtomicU64,
    notify: Mutex<NotifyQueue>,
}

impl EventLogStateMachine {
    pub fn new(cluster_nodes: Vec<NodeIndex>) -> Arc<EventLogStateMachine> {
        Arc::new(EventLogStateMachine {
            state: Mutex::new(RsmState {
                set: EventLogRebuildingSet::default(),
                next_lsn: Lsn::OLDEST,
                cluster_nodes,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
            notify: Mutex::new(NotifyQueue { notifying: false, queue: Default::default() }),
        })
    }

    pub fn subscribe(
        self: &Arc<Self>,
        cb: impl Fn(&EventLogRebuildingSet, Option<&EventLogRecord>, Lsn) + Send + Sync + 'static,
    ) -> EventLogSubscription {
        let id = self.next_sub_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(cb)));
        EventLogSubscription { id, rsm: self.clone() }
    }

    pub fn current_set(&self) -> EventLogRebuildingSet {
        self.state.lock().set.clone()
    }

    /// Delivers the current state with no delta: the "caught up" signal
    /// subscribers get right after subscribing.
    pub fn deliver_snapshot(&self) {
        let (set, version) = {
            let state = self.state.lock();
            (state.set.clone(), state.set.last_seen_lsn())
        };
        self.enqueue_notification(set, None, version);
    }

    /// Appends one delta, folds it, and notifies subscribers.
    pub fn apply(&self, delta: EventLogRecord) -> Lsn {
        let (set, version) = {
            let mut state = self.state.lock();
            let version = state.next_lsn;
            state.next_lsn = version.next();
            let nodes = state.cluster_nodes.clone();
            state.set.apply(&delta, version, &nodes);
            (state.set.clone(), version)
        };
        tracing::debug!(target: "rebuilding", ?delta, %version, "event log delta applied");
        self.enqueue_notification(set, Some(delta), version);
        version
    }

    fn enqueue_notification(
        &self,
        set: EventLogRebuildingSet,
        delta: Option<EventLogRecord>,
        version: Lsn,
    ) {
        {
            let mut notify = self.notify.lock();
            notify.queue.push_back((set, delta, version));
            if notify.notifying {
                // The loop below (on some caller's stack) will pick this
                // up; delivering inline here would reorder or deadlock.
                return;
            }
            notify.notifying = true;
        }
        loop {
            let item = {
                let mut notify = self.notify.lock();
                match notify.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        notify.notifying = false;
                        return;
                    }
                }
            };
            let subs: Vec<Subscriber> =
                self.subscribers.lock().iter().map(|(_, s)| s.clone()).collect();
            for sub in subs {
                sub(&item.0, item.1.as_ref(), item.2);
            }
        }
    }
}

/// Writes deltas on behalf of the coordinator, batching bursts. With an
/// immediate writer (tests and the single-process node) every write is
/// applied synchronously.
pub struct EventLogWriter {
    rsm: Arc<EventLogStateMachine>,
    pending: Mutex<Vec<EventLogRecord>>,
    immediate: bool,
}

impl EventLogWriter {
    pub fn new(rsm: Arc<EventLogStateMachine>) -> EventLogWriter {
        EventLogWriter { rsm, pending: Mutex::new(Vec::new()), immediate: true }
    }

    pub fn new_batching(rsm: Arc<EventLogStateMachine>) -> EventLogWriter {
        EventLogWriter { rsm, pending: Mutex::new(Vec::new()), immediate: false }
    }

    pub fn write_event(&self, record: EventLogRecord) {
        if self.immediate {
            self.rsm.apply(record);
        } else {
            self.pending.lock().push(record);
        }
    }

    pub fn flush(&self) {
        let drained: Vec<EventLogRecord> = std::mem::take(&mut *self.pending.lock());
        for record in drained {
            self.rsm.apply(record);
        }
    }
}
