//! End-to-end rebuilding flows against a real LogsDB shard and storage
//! pool: dirty-range publication after an unclean shutdown, donor reads
//! and re-replication, and the acknowledgement protocol.

use logd_config::{
    LogAttributes, LogsConfig, NodeConfig, RebuildingSettings, ServerConfig, Settings,
    UpdateableConfig,
};
use logd_o11y::testonly::init_test_logger;
use logd_primitives::{
    Epoch, EpochMetaData, Esn, LogId, Lsn, NodeId, RecordTimeInterval, RecordTimestamp,
    ReplicationProperty, ShardId, Status,
};
use logd_rebuilding::event_log::ShardNeedsRebuildEvent;
use logd_rebuilding::{
    ChunkData, ChunkRereplicator, EventLogRecord, EventLogStateMachine, HistoricalMetadataSource,
    RebuildingCoordinator,
};
use logd_storage::{Params, StorageThreadPool, ThreadType};
use logd_store::{LogsDb, LogsDbSettings, RebuildingRangesMetadata, ShardedLogsDb, WriteOptions};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct FixedMetadata {
    metadata: Arc<EpochMetaData>,
}

impl HistoricalMetadataSource for FixedMetadata {
    fn historical_metadata(&self, _log: LogId) -> Vec<Arc<EpochMetaData>> {
        vec![self.metadata.clone()]
    }
}

#[derive(Default)]
struct CollectingRereplicator {
    chunks: Mutex<Vec<(LogId, Lsn, Lsn)>>,
}

impl ChunkRereplicator for CollectingRereplicator {
    fn store_chunk(&self, chunk: ChunkData, done: Box<dyn FnOnce(Status) + Send>) {
        self.chunks.lock().push((chunk.log, chunk.min_lsn, chunk.max_lsn));
        done(Status::Ok);
    }
}

struct Cluster {
    config: Arc<UpdateableConfig>,
    rsm: Arc<EventLogStateMachine>,
    metadata: Arc<EpochMetaData>,
}

fn cluster() -> Cluster {
    cluster_n(2)
}

fn cluster_n(num_nodes: u16) -> Cluster {
    init_test_logger();
    let mut nodes = BTreeMap::new();
    for idx in 0..num_nodes {
        nodes.insert(
            idx,
            NodeConfig {
                node_id: NodeId::new(idx, 1),
                address: format!("127.0.0.1:{}", 4440 + idx).parse().unwrap(),
                gossip_address: None,
                location: None,
                num_shards: 1,
                sequencer: true,
            },
        );
    }
    let server = ServerConfig {
        cluster_name: "test".to_owned(),
        version: 1,
        nodes,
        metadata_nodes: vec![0],
        sequencers_provision_epoch_store: true,
    };
    let logs = LogsConfig::new([(1, LogAttributes::test_default())].into_iter().collect());
    let config = Arc::new(UpdateableConfig::new(server, logs, Settings::test()));

    let mut metadata = EpochMetaData::new_for_provisioning(
        vec![ShardId::new(0, 0), ShardId::new(1, 0)],
        ReplicationProperty::simple(1),
        NodeId::new(0, 1),
    );
    metadata.effective_since = Epoch(1);
    metadata.epoch = Epoch(10);

    Cluster {
        config,
        rsm: EventLogStateMachine::new((0..num_nodes).collect()),
        metadata: Arc::new(metadata),
    }
}

fn open_shard(dir: &tempfile::TempDir) -> Arc<LogsDb> {
    Arc::new(LogsDb::open(dir.path(), 0, LogsDbSettings::test(), RecordTimestamp(10_000)).unwrap())
}

fn pool_for(store: &Arc<LogsDb>) -> Arc<StorageThreadPool> {
    let mut params = Params::default();
    params[ThreadType::Slow].nthreads = 1;
    params[ThreadType::Metadata].nthreads = 1;
    Arc::new(StorageThreadPool::new(0, params, store.clone(), 64, 32, 1 << 20))
}

fn coordinator_for(
    cluster: &Cluster,
    store: Arc<LogsDb>,
    pool: Arc<StorageThreadPool>,
    rereplicator: Arc<CollectingRereplicator>,
    my_node: u16,
) -> Arc<RebuildingCoordinator> {
    RebuildingCoordinator::new(
        cluster.config.clone(),
        cluster.rsm.clone(),
        Arc::new(ShardedLogsDb::from_shards(vec![store])),
        vec![pool],
        Arc::new(RebuildingSettings {
            rebuilding_restarts_grace_period: Duration::ZERO,
            ..RebuildingSettings::default()
        }),
        Arc::new(FixedMetadata { metadata: cluster.metadata.clone() }),
        rereplicator,
        my_node,
    )
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Startup finds dirty ranges from an unclean shutdown: the coordinator
/// publishes them as a mini-rebuilding, and once the lone donor reports
/// done the shard rewrites its marker and acks; the set drains to empty.
#[test]
fn mini_rebuild_after_crash_publishes_ranges_and_acks() {
    let c = cluster();
    let dir = tempfile::tempdir().unwrap();
    let store = open_shard(&dir);

    // Crash left a dirty append range on the shard.
    let mut ranges = RebuildingRangesMetadata::default();
    ranges
        .append_ranges
        .push(RecordTimeInterval::new(RecordTimestamp(5_000), RecordTimestamp(20_000)));
    store.write_store_metadata(&ranges, &WriteOptions::default()).unwrap();

    let pool = pool_for(&store);
    let rereplicator = Arc::new(CollectingRereplicator::default());
    // Node 1 is the dirty node.
    let coordinator = coordinator_for(&c, store.clone(), pool, rereplicator, 1);
    coordinator.start().unwrap();
    c.rsm.deliver_snapshot();

    // The dirty range is now published cluster-wide.
    let set = c.rsm.current_set();
    let info = set.node_info(1, 0).expect("my shard is in the rebuilding set");
    assert!(!info.dc_dirty_ranges.is_empty());
    let version = set.for_shard(0).unwrap().version;

    // The other node is the only donor; it reports completion.
    c.rsm.apply(EventLogRecord::ShardIsRebuilt { donor: 0, shard: 0, version, flags: 0 });

    // The marker write goes through the metadata storage thread, then
    // SHARD_ACK_REBUILT drains the set.
    wait_until(|| c.rsm.current_set().for_shard(0).is_none());
    // Dirty ranges were cleared together with the marker.
    wait_until(|| {
        store
            .read_store_metadata::<RebuildingRangesMetadata>()
            .unwrap()
            .map(|m| m.is_empty())
            .unwrap_or(true)
    });
}

/// The donor path: records whose copysets include the failed shard are
/// read and re-replicated; clean records are skipped; completion is
/// announced with SHARD_IS_REBUILT.
#[test]
fn donor_reads_and_rereplicates_affected_records() {
    let c = cluster();
    let dir = tempfile::tempdir().unwrap();
    let store = open_shard(&dir);

    // Two records with node 1 in the copyset, one without.
    for (esn, copyset) in [
        (1u32, vec![ShardId::new(0, 0), ShardId::new(1, 0)]),
        (2, vec![ShardId::new(0, 0), ShardId::new(1, 0)]),
        (3, vec![ShardId::new(0, 0)]),
    ] {
        store
            .write_record(
                &logd_store::RecordWrite {
                    log: LogId(1),
                    lsn: Lsn::from_parts(Epoch(2), Esn(esn)),
                    timestamp: RecordTimestamp(10_000 + esn as u64),
                    flags: 0,
                    wave: 1,
                    copyset: &copyset,
                    payload: b"payload",
                },
                &WriteOptions::default(),
            )
            .unwrap();
    }

    let pool = pool_for(&store);
    let rereplicator = Arc::new(CollectingRereplicator::default());
    // Node 0 is the donor; node 1 failed.
    let coordinator = coordinator_for(&c, store.clone(), pool, rereplicator.clone(), 0);
    coordinator.start().unwrap();
    c.rsm.deliver_snapshot();

    c.rsm.apply(EventLogRecord::ShardNeedsRebuild(ShardNeedsRebuildEvent {
        node: 1,
        shard: 0,
        source: "test".to_owned(),
        details: String::new(),
        flags: 0,
        conditional_version: Lsn::INVALID,
        dirty_ranges: None,
    }));

    // The donor finishes and announces it.
    wait_until(|| {
        c.rsm
            .current_set()
            .for_shard(0)
            .map(|info| !info.donor_progress.contains_key(&0))
            .unwrap_or(true)
    });

    let chunks = rereplicator.chunks.lock();
    assert_eq!(chunks.len(), 1, "consecutive records with one copyset form one chunk");
    let (log, min, max) = chunks[0];
    assert_eq!(log, LogId(1));
    assert_eq!(min, Lsn::from_parts(Epoch(2), Esn(1)));
    assert_eq!(max, Lsn::from_parts(Epoch(2), Esn(2)));
}

/// A second SHARD_NEEDS_REBUILD bumps the version; donor completions for
/// the old version are discarded and the rebuild keeps waiting.
#[test]
fn stale_donor_completions_are_discarded() {
    let c = cluster_n(3);
    let dir = tempfile::tempdir().unwrap();
    let store = open_shard(&dir);

    // Our shard (node 1) carries dirty ranges so the coordinator
    // publishes a mini-rebuilding instead of aborting.
    let mut ranges = RebuildingRangesMetadata::default();
    ranges
        .append_ranges
        .push(RecordTimeInterval::new(RecordTimestamp(5_000), RecordTimestamp(20_000)));
    store.write_store_metadata(&ranges, &WriteOptions::default()).unwrap();

    let pool = pool_for(&store);
    let rereplicator = Arc::new(CollectingRereplicator::default());
    let coordinator = coordinator_for(&c, store, pool, rereplicator, 1);
    coordinator.start().unwrap();
    c.rsm.deliver_snapshot();

    let v1 = c.rsm.current_set().for_shard(0).expect("dirty ranges published").version;
    wait_until(|| coordinator.last_seen_event_log_version() >= v1);

    // The set changes: node 0 fails too, bumping the version.
    c.rsm.apply(EventLogRecord::ShardNeedsRebuild(ShardNeedsRebuildEvent {
        node: 0,
        shard: 0,
        source: "test".to_owned(),
        details: String::new(),
        flags: 0,
        conditional_version: Lsn::INVALID,
        dirty_ranges: None,
    }));

    // Node 2 reporting completion against v1 is stale now.
    c.rsm.apply(EventLogRecord::ShardIsRebuilt { donor: 2, shard: 0, version: v1, flags: 0 });
    std::thread::sleep(Duration::from_millis(100));
    let set = c.rsm.current_set();
    assert!(set.for_shard(0).is_some(), "the rebuilding must still be pending");
    assert!(
        set.node_info(1, 0).unwrap().donors_remaining.contains(&2),
        "the stale completion must not count"
    );
}
