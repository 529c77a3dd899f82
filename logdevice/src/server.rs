//! Brings a node up: opens the sharded store, starts the storage pools
//! and workers, wires the transport, sequencers, rebuilding coordinator
//! and failure detector together, and owns the ordered shutdown.

use crate::appender::{Appender, ChunkStoreJob, StoreSendFn, StoredWaiterMap};
use crate::config_file::NodeConfigFile;
use crate::network_glue::{MessageDispatcher, NetworkGlue, ReplySender};
use crate::storage_handlers;
use logd_config::UpdateableConfig;
use logd_gossip::{FailureDetector, GossipSender};
use logd_network::messages::{
    store_flags, Address, AppendMessage, AppendedMessage, GossipMessage, Message, StoreHeader,
    StoreMessage,
};
use logd_primitives::{
    Epoch, EpochMetaData, LogId, Lsn, NodeId, NodeIndex, RecordTimestamp, ShardId, Status,
};
use logd_processor::Processor;
use logd_rebuilding::{
    ChunkData, ChunkRereplicator, EventLogStateMachine, HistoricalMetadataSource,
    RebuildingCoordinator,
};
use logd_sequencer::{
    AllSequencers, AlwaysEmptyChecker, EpochRecovery, InMemEpochStore, PendingAppend,
    ProcessorFanout, RecoveryTransport, SequencerState,
};
use logd_storage::{Params, StorageThreadPool, ThreadType};
use logd_store::ShardedLogsDb;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Storage thread counts per shard, by class. The shapes follow what a
/// spinning-disk deployment wants; flash nodes typically raise the fast
/// classes.
const NTHREADS_SLOW: usize = 2;
const NTHREADS_FAST_TIME_SENSITIVE: usize = 2;
const NTHREADS_FAST_STALLABLE: usize = 2;
const NTHREADS_METADATA: usize = 1;

pub struct Server {
    pub config: Arc<UpdateableConfig>,
    pub processor: Arc<Processor>,
    pub stores: Arc<ShardedLogsDb>,
    pools: Vec<Arc<StorageThreadPool>>,
    pub sequencers: Arc<AllSequencers>,
    pub rebuilding: Arc<RebuildingCoordinator>,
    pub failure_detector: Arc<FailureDetector>,
    pub event_log: Arc<EventLogStateMachine>,
    glue: Arc<NetworkGlue>,
    waiters: Arc<StoredWaiterMap>,
    recoveries: Mutex<HashMap<u64, Arc<EpochRecovery>>>,
    my_node: NodeId,
    instance_id: u64,
    shutdown_timeout: Duration,
    restarts_grace: Duration,
    _config_sub: Mutex<Option<logd_config::ConfigSubscription>>,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64
}

impl Server {
    pub fn start(file: NodeConfigFile) -> anyhow::Result<Arc<Server>> {
        file.validate()?;
        let instance_id = wall_clock_ms();
        let my_node = file
            .server
            .node(file.my_node_index)
            .map(|n| n.node_id)
            .expect("validated above");
        let num_shards = file.server.node(file.my_node_index).map(|n| n.num_shards).unwrap_or(0);
        let listen_addr = file.listen_addr;

        let config = Arc::new(UpdateableConfig::new(
            file.server,
            file.logs,
            file.settings.clone(),
        ));
        let settings = config.settings.get();

        let stores = Arc::new(ShardedLogsDb::open(
            &file.data_dir,
            num_shards,
            &file.logsdb,
            RecordTimestamp::now(),
        ).map_err(|status| anyhow::anyhow!("opening LogsDB: {}", status))?);

        let mut params = Params::default();
        params[ThreadType::Slow].nthreads = NTHREADS_SLOW;
        params[ThreadType::FastTimeSensitive].nthreads = NTHREADS_FAST_TIME_SENSITIVE;
        params[ThreadType::FastStallable].nthreads = NTHREADS_FAST_STALLABLE;
        params[ThreadType::Metadata].nthreads = NTHREADS_METADATA;
        let pools: Vec<Arc<StorageThreadPool>> = stores
            .iter()
            .map(|(shard, store)| {
                Arc::new(StorageThreadPool::new(
                    shard,
                    params,
                    store.clone(),
                    settings.per_worker_storage_task_queue_size,
                    settings.write_batch_size,
                    settings.write_batch_bytes,
                ))
            })
            .collect();

        let processor = Processor::new(settings.num_workers);
        let glue = NetworkGlue::new(
            processor.clone(),
            settings.clone(),
            my_node,
            instance_id,
            config.server_config(),
        )?;

        // Epoch-store completions land on a worker like every other
        // cross-thread completion.
        let poster_processor = processor.clone();
        let epoch_store = InMemEpochStore::with_poster(Arc::new(
            move |f: Box<dyn FnOnce() + Send>| {
                let _ = poster_processor.post(logd_processor::request(move |_| f()));
            },
        ));
        let sequencers = AllSequencers::new(
            config.clone(),
            epoch_store,
            Arc::new(ProcessorFanout(processor.clone())),
            Box::new(AlwaysEmptyChecker),
            my_node,
        );

        let event_log =
            EventLogStateMachine::new(config.server_config().nodes.keys().copied().collect());

        let waiters = StoredWaiterMap::new();

        let server = Arc::new_cyclic(|weak: &Weak<Server>| {
            let rebuilding = RebuildingCoordinator::new(
                config.clone(),
                event_log.clone(),
                stores.clone(),
                pools.clone(),
                Arc::new(file.rebuilding.clone()),
                Arc::new(SequencerMetadataSource { sequencers: sequencers.clone() }),
                Arc::new(GlueRereplicator {
                    server: weak.clone(),
                    my_node: my_node.index,
                }),
                my_node.index,
            );

            let failure_detector = FailureDetector::new(
                Arc::new(file.gossip.clone()),
                config.clone(),
                my_node,
                instance_id,
                Arc::new(GlueGossipSender { server: weak.clone() }),
            );
            {
                let sequencers = sequencers.clone();
                failure_detector.set_isolation_callback(Box::new(move || {
                    sequencers.disable_all_sequencers_due_to_isolation();
                }));
            }

            Server {
                config: config.clone(),
                processor: processor.clone(),
                stores: stores.clone(),
                pools: pools.clone(),
                sequencers: sequencers.clone(),
                rebuilding,
                failure_detector,
                event_log: event_log.clone(),
                glue: glue.clone(),
                waiters: waiters.clone(),
                recoveries: Mutex::new(HashMap::new()),
                my_node,
                instance_id,
                shutdown_timeout: settings.shutdown_timeout,
                restarts_grace: file.rebuilding.rebuilding_restarts_grace_period,
                _config_sub: Mutex::new(None),
            }
        });

        server.install_recovery_runner();
        server.install_rebuilding_restart_timer();
        glue.set_dispatcher(Arc::new(ServerDispatcher { server: Arc::downgrade(&server) }));
        let bound = glue.listen(listen_addr)?;
        tracing::info!(
            target: "server",
            node = %my_node,
            addr = %bound,
            instance_id,
            "listening"
        );

        // Config updates fan out to the socket tables.
        {
            let glue = glue.clone();
            let config_for_sub = config.clone();
            let sub = config.subscribe_to_updates(move || {
                glue.note_config_updated(config_for_sub.server_config());
            });
            *server._config_sub.lock() = Some(sub);
        }

        server.rebuilding.start().map_err(|status| anyhow::anyhow!("rebuilding start: {}", status))?;
        server.event_log.deliver_snapshot();

        server.start_timers();
        Ok(server)
    }

    fn install_recovery_runner(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.sequencers.install_recovery_runner(Box::new(move |seq| {
            let Some(server) = weak.upgrade() else { return };
            let Some(metadata) = seq.current_metadata() else { return };
            let log = seq.log_id();
            let recovery_id = wall_clock_ms();
            let transport = Arc::new(GlueRecoveryTransport { server: Arc::downgrade(&server) });
            let on_complete: Box<dyn FnOnce(Epoch) + Send> = {
                let server = Arc::downgrade(&server);
                Box::new(move |last_clean| {
                    if let Some(server) = server.upgrade() {
                        server.recoveries.lock().remove(&log.0);
                        tracing::info!(
                            target: "recovery",
                            %log,
                            %last_clean,
                            "log recovery finished"
                        );
                    }
                })
            };
            let recovery = EpochRecovery::new(
                log,
                &metadata,
                Epoch::INVALID,
                recovery_id,
                server.my_node,
                transport,
                on_complete,
            );
            server.recoveries.lock().insert(log.0, recovery.clone());
            recovery.start();
        }));
    }

    fn install_rebuilding_restart_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let grace = self.restarts_grace;
        self.rebuilding.set_restart_scheduler(Box::new(move |shard| {
            let Some(server) = weak.upgrade() else { return };
            let rebuilding = server.rebuilding.clone();
            server.processor.post_delayed(
                grace,
                logd_processor::request(move |_| {
                    rebuilding.restart_for_shard(shard);
                }),
            );
        }));
    }

    fn start_timers(self: &Arc<Self>) {
        // Gossip rounds on the failure-detector cadence.
        self.schedule_recurring(Duration::from_millis(100), |server| {
            server.failure_detector.gossip(Instant::now(), wall_clock_ms());
        });
        // Traffic shaper deposits. Shaping ships disabled; enabling it is
        // a config change away and the plumbing stays exercised.
        let settings = self.config.settings.get();
        let shaper = Mutex::new(logd_network::TrafficShaper::new(
            logd_network::ShapingConfig::disabled(),
            settings.traffic_shaping_interval,
        ));
        self.schedule_recurring(settings.traffic_shaping_interval.max(Duration::from_millis(10)), move |server| {
            let shaper = shaper.lock();
            if shaper.is_enabled() {
                server.glue.apply_shaping_update(shaper.make_update());
            }
        });
        // LogsDB maintenance: rotation, retention, disk space.
        self.schedule_recurring(Duration::from_secs(10), |server| {
            let logs = server.config.logs_config();
            let now = RecordTimestamp::now();
            for (shard, store) in server.stores.iter() {
                if let Err(status) = store.maybe_rotate(now) {
                    tracing::warn!(target: "logsdb", shard, %status, "rotation failed");
                }
                match store.trim_logs_based_on_time(&logs, now) {
                    Ok(dropped) if !dropped.is_empty() => {
                        tracing::info!(target: "logsdb", shard, ?dropped, "dropped partitions");
                    }
                    Ok(_) => {}
                    Err(status) => {
                        tracing::warn!(target: "logsdb", shard, %status, "retention pass failed");
                    }
                }
                store.refresh_space_state();
            }
        });
    }

    fn schedule_recurring(self: &Arc<Self>, every: Duration, f: impl Fn(&Arc<Server>) + Send + Sync + 'static) {
        let weak = Arc::downgrade(self);
        let f = Arc::new(f);
        fn arm(
            weak: Weak<Server>,
            every: Duration,
            f: Arc<dyn Fn(&Arc<Server>) + Send + Sync>,
        ) {
            let Some(server) = weak.upgrade() else { return };
            let timers = &server.processor.timers;
            let weak2 = weak.clone();
            timers.schedule(every, move || {
                if let Some(server) = weak2.upgrade() {
                    f(&server);
                    arm(weak2.clone(), every, f);
                }
            });
        }
        arm(weak, every, f);
    }

    fn send_to_shard(self: &Arc<Self>, worker: usize, shard: ShardId, msg: Message) {
        self.glue.send_from_worker(worker, Address::Node(shard.node), msg);
    }

    fn store_send_fn(self: &Arc<Self>, worker: usize) -> StoreSendFn {
        let server = self.clone();
        Arc::new(move |shard, msg| server.send_to_shard(worker, shard, msg))
    }

    fn num_shards(&self) -> u8 {
        self.stores.num_shards()
    }

    // ---- append path ----

    fn append_on_received(
        self: &Arc<Self>,
        worker: usize,
        from: Address,
        msg: AppendMessage,
        reply: &ReplySender,
    ) {
        let log = msg.log;
        let reply_appended = {
            let reply = reply.clone();
            let rqid = msg.rqid;
            move |status: Status, lsn: Lsn, timestamp: RecordTimestamp| {
                reply.send(
                    from,
                    Message::Appended(AppendedMessage {
                        rqid,
                        status,
                        lsn,
                        timestamp,
                        redirect: 0,
                    }),
                );
            }
        };
        if !self.config.logs_config().contains(log) {
            reply_appended(Status::Notfound, Lsn::INVALID, RecordTimestamp::MIN);
            return;
        }

        let seq = self.sequencers.find_sequencer(log);
        let active = seq.as_ref().map(|s| s.state() == SequencerState::Active).unwrap_or(false);
        if !active {
            // Buffer the append and (re)trigger activation; the buffered
            // completion re-enters this path once the sequencer is up.
            let server = self.clone();
            let buffered = PendingAppend {
                payload_size: msg.payload.len(),
                complete: {
                    let msg = msg.clone();
                    let reply = reply.clone();
                    Box::new(move |status| {
                        if status == Status::Ok {
                            server.append_on_received(worker, from, msg, &reply);
                        } else {
                            reply.send(
                                from,
                                Message::Appended(AppendedMessage {
                                    rqid: msg.rqid,
                                    status,
                                    lsn: Lsn::INVALID,
                                    timestamp: RecordTimestamp::MIN,
                                    redirect: 0,
                                }),
                            );
                        }
                    })
                },
            };
            if let Err(status) = self.sequencers.appender_buffer(worker).buffer_append(log, buffered)
            {
                reply_appended(status, Lsn::INVALID, RecordTimestamp::MIN);
                return;
            }
            match self.sequencers.activate_sequencer_if_not_active(log, true) {
                Ok(()) | Err(Status::Exists) | Err(Status::Inprogress) => {}
                Err(status) => {
                    tracing::debug!(target: "appender", %log, %status, "activation not started");
                }
            }
            return;
        }
        let seq = seq.expect("active implies present");

        let lsn = match seq.assign_lsn() {
            Ok(lsn) => lsn,
            Err(status) => {
                let redirect =
                    seq.preempted_by().map(|(_, by)| by.index).unwrap_or(0);
                reply.send(
                    from,
                    Message::Appended(AppendedMessage {
                        rqid: msg.rqid,
                        status,
                        lsn: Lsn::INVALID,
                        timestamp: RecordTimestamp::MIN,
                        redirect,
                    }),
                );
                return;
            }
        };
        let metadata = seq.current_metadata().expect("active sequencer has metadata");
        let timestamp = RecordTimestamp::now();

        let server = self.clone();
        let seq_for_completion = seq.clone();
        let appender = Appender::new(
            log,
            lsn,
            timestamp,
            msg.payload.clone(),
            &metadata,
            logd_primitives::Esn(lsn.esn().0.saturating_sub(1)),
            self.store_send_fn(worker),
            Box::new(move |status, lsn| {
                reply_appended(status, lsn, timestamp);
                if status == Status::Preempted {
                    // The redirect information arrives with the next
                    // activation; note the preemption so appends stop.
                    seq_for_completion
                        .note_preempted(lsn.epoch().next(), NodeId::new(0, 0));
                }
                if status == Status::Ok {
                    seq_for_completion.advance_last_released(lsn);
                }
                server.waiters.unregister(log, lsn);
                if seq_for_completion.note_appender_reaped() {
                    server
                        .sequencers
                        .on_graceful_reactivation_drained(&seq_for_completion);
                }
            }),
        );
        self.waiters.register(log, lsn, appender.clone());
        appender.start_wave();
    }
}

/// Routes inbound messages to their handlers. Holds the server weakly:
/// during shutdown, messages still in flight fall on the floor.
struct ServerDispatcher {
    server: Weak<Server>,
}

impl MessageDispatcher for ServerDispatcher {
    fn on_message(&self, worker: usize, from: Address, msg: Message, reply: &ReplySender) {
        let Some(this) = self.server.upgrade() else { return };
        let pools = &this.pools;
        match msg {
            Message::Append(m) => this.append_on_received(worker, from, m, reply),
            Message::Store(m) => {
                storage_handlers::store_on_received(m, from, this.num_shards(), pools, reply)
            }
            Message::Stored(m) => {
                if let Address::Node(node) = from {
                    this.waiters.dispatch(node, &m);
                }
            }
            Message::Trim(m) => storage_handlers::trim_on_received(m, from, pools, reply),
            Message::Seal(m) => storage_handlers::seal_on_received(m, from, pools, reply),
            Message::Sealed(m) => {
                if let Address::Node(node) = from {
                    let recovery = this.recoveries.lock().get(&m.log.0).cloned();
                    if let Some(recovery) = recovery {
                        recovery.on_sealed(ShardId::new(node, m.shard), m);
                    }
                }
            }
            Message::Clean(m) => storage_handlers::clean_on_received(m, from, pools, reply),
            Message::Cleaned(m) => {
                if let Address::Node(node) = from {
                    let recovery = this.recoveries.lock().get(&m.log.0).cloned();
                    if let Some(recovery) = recovery {
                        recovery.on_cleaned(ShardId::new(node, m.shard), m.recovery_id, m.status);
                    }
                }
            }
            Message::GetEpochRecoveryMetadata(m) => {
                storage_handlers::get_epoch_recovery_metadata_on_received(m, from, pools, reply)
            }
            Message::GetEpochRecoveryMetadataReply(_) => {
                // Purging consumes these; no purger is wired up yet.
            }
            Message::Gossip(m) => {
                this.failure_detector.on_gossip_received(m, Instant::now(), wall_clock_ms())
            }
            Message::ConfigAdvisory(m) => {
                tracing::debug!(
                    target: "server",
                    %from,
                    version = m.config_version,
                    "peer advertises a newer config"
                );
            }
            Message::ConfigChanged(_) | Message::Appended(_) | Message::Trimmed(_) => {
                // Client-side messages; a server peer sending them is
                // harmless noise.
            }
            Message::Hello(_) | Message::Ack(_) | Message::Shutdown(_) => {
                unreachable!("handshake messages are consumed by the Sender")
            }
        }
    }
}

impl Server {
    /// Ordered shutdown. Returns false when the timeout expired and the
    /// process should exit with a failure status.
    pub fn shutdown(self: &Arc<Self>) -> bool {
        tracing::info!(target: "server", instance_id = self.instance_id, "shutting down");
        // Announce the failover so peers fail us over fast.
        self.failure_detector.note_failing_over();
        self.failure_detector.gossip(Instant::now(), wall_clock_ms());

        self.sequencers.shutdown();
        self.rebuilding.shutdown();

        // Close client sockets first, then server sockets.
        self.glue.shutdown_sockets();

        // Drain storage queues, persisting caches. Joining happens when
        // the last reference drops; the pools' Drop blocks on it.
        for pool in &self.pools {
            pool.shut_down(true);
        }

        self.processor.shutdown(self.shutdown_timeout)
    }
}

// ---- collaborator adapters ----

/// Historical metadata for rebuilding plans: what the sequencers know.
/// A node without a sequencer for a log falls back to a single interval
/// covering everything the current epoch covers.
struct SequencerMetadataSource {
    sequencers: Arc<AllSequencers>,
}

impl HistoricalMetadataSource for SequencerMetadataSource {
    fn historical_metadata(&self, log: LogId) -> Vec<Arc<EpochMetaData>> {
        match self.sequencers.find_sequencer(log).and_then(|seq| seq.current_metadata()) {
            Some(meta) => vec![meta],
            None => Vec::new(),
        }
    }
}

/// Re-replicates rebuilding chunks through STOREs with the rebuilding
/// flags; amends reach shards that already hold a copy.
struct GlueRereplicator {
    server: Weak<Server>,
    my_node: NodeIndex,
}

impl ChunkRereplicator for GlueRereplicator {
    fn store_chunk(&self, chunk: ChunkData, done: Box<dyn FnOnce(Status) + Send>) {
        let Some(server) = self.server.upgrade() else {
            done(Status::Shutdown);
            return;
        };
        let survivors: Vec<ShardId> = chunk
            .metadata
            .nodeset
            .iter()
            .copied()
            .filter(|shard| shard.node != self.my_node)
            .collect();

        // Decode payloads up front so the STORED accounting matches the
        // number of sends exactly.
        let mut sends = Vec::with_capacity(chunk.records.len());
        for (i, (lsn, raw)) in chunk.records.iter().enumerate() {
            if survivors.is_empty() {
                break;
            }
            match logd_store::ParsedRecord::parse(raw) {
                Ok(parsed) => {
                    let target = survivors[i % survivors.len()];
                    sends.push((*lsn, target, bytes::Bytes::copy_from_slice(parsed.payload)));
                }
                Err(_) => {
                    tracing::warn!(
                        target: "rebuilding",
                        log = %chunk.log,
                        lsn = %lsn,
                        "skipping malformed record while re-replicating"
                    );
                }
            }
        }
        if sends.is_empty() {
            done(Status::Ok);
            return;
        }

        let job = ChunkStoreJob::new(sends.len(), done);
        for (lsn, target, payload) in sends {
            server.waiters.register(chunk.log, lsn, job.clone());
            let header = StoreHeader {
                log: chunk.log,
                epoch: lsn.epoch(),
                esn: lsn.esn(),
                timestamp: chunk.oldest_timestamp,
                last_known_good: logd_primitives::Esn::INVALID,
                wave: 1,
                flags: store_flags::REBUILDING | store_flags::WRITTEN_BY_REBUILDING,
                nsync: 1,
                copyset_offset: 0,
                copyset: vec![target],
                offset_within_epoch: 0,
                custom_key: String::new(),
            };
            server.glue.send_from_worker(
                0,
                Address::Node(target.node),
                Message::Store(StoreMessage { header, payload }),
            );
        }
    }
}

/// Gossips ride the data connections of worker 0.
struct GlueGossipSender {
    server: Weak<Server>,
}

impl GossipSender for GlueGossipSender {
    fn send_gossip(&self, node: NodeIndex, msg: GossipMessage) -> Result<(), Status> {
        let Some(server) = self.server.upgrade() else { return Err(Status::Shutdown) };
        server.glue.send_from_worker(0, Address::Node(node), Message::Gossip(msg));
        Ok(())
    }
}

/// SEAL/CLEAN delivery for epoch recovery.
struct GlueRecoveryTransport {
    server: Weak<Server>,
}

impl RecoveryTransport for GlueRecoveryTransport {
    fn send_seal(&self, shard: ShardId, msg: logd_network::messages::SealMessage) {
        if let Some(server) = self.server.upgrade() {
            server.glue.send_from_worker(0, Address::Node(shard.node), Message::Seal(msg));
        }
    }

    fn send_clean(&self, shard: ShardId, msg: logd_network::messages::CleanMessage) {
        if let Some(server) = self.server.upgrade() {
            server.glue.send_from_worker(0, Address::Node(shard.node), Message::Clean(msg));
        }
    }
}
