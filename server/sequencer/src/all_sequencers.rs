//! Per-process registry of sequencers and the activation orchestration
//! around the epoch store: provisioning checks, completion handling,
//! preemption detection and config-driven reactivation.

use crate::appender_buffer::AppenderBuffer;
use crate::background_activator::SequencerBackgroundActivator;
use crate::epoch_store::{EpochMetaDataUpdateToNextEpoch, EpochStore, EpochStoreMetaProperties};
use crate::fanout::WorkerFanout;
use crate::metrics;
use crate::sequencer::{ActivateResult, Sequencer, SequencerState};
use logd_config::{LogsConfig, ServerConfig, UpdateableConfig};
use logd_primitives::{Epoch, EpochMetaData, LogId, NodeId, Status};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Asks whether a log's metadata log holds any records. Completion status:
/// NOTFOUND means empty, NOTEMPTY means records exist, anything else is a
/// check failure.
pub trait MetadataLogChecker: Send + Sync {
    fn check_empty(&self, log: LogId, cb: Box<dyn FnOnce(Status) + Send>);
}

/// A cluster being bootstrapped has no metadata logs yet; everything is
/// empty. Also what tests want most of the time.
pub struct AlwaysEmptyChecker;

impl MetadataLogChecker for AlwaysEmptyChecker {
    fn check_empty(&self, _log: LogId, cb: Box<dyn FnOnce(Status) + Send>) {
        cb(Status::Notfound)
    }
}

type RecoveryRunner = Box<dyn Fn(Arc<Sequencer>) + Send + Sync>;

pub struct AllSequencers {
    /// Upgradable-read for the insert path: lookups share the lock,
    /// insertion upgrades it, so only one thread can be inserting.
    map: RwLock<HashMap<u64, Arc<Sequencer>>>,
    epoch_store: Arc<dyn EpochStore>,
    config: Arc<UpdateableConfig>,
    fanout: Arc<dyn WorkerFanout>,
    appender_buffers: Vec<AppenderBuffer>,
    pub background_activator: SequencerBackgroundActivator,
    metadata_checker: Box<dyn MetadataLogChecker>,
    recovery_runner: Mutex<Option<RecoveryRunner>>,
    my_node: NodeId,
    _config_sub: Mutex<Option<logd_config::ConfigSubscription>>,
}

impl AllSequencers {
    pub fn new(
        config: Arc<UpdateableConfig>,
        epoch_store: Arc<dyn EpochStore>,
        fanout: Arc<dyn WorkerFanout>,
        metadata_checker: Box<dyn MetadataLogChecker>,
        my_node: NodeId,
    ) -> Arc<AllSequencers> {
        let appender_buffers =
            (0..fanout.worker_count()).map(|_| AppenderBuffer::new(1024)).collect();
        let this = Arc::new(AllSequencers {
            map: RwLock::new(HashMap::new()),
            epoch_store,
            config: config.clone(),
            fanout,
            appender_buffers,
            background_activator: SequencerBackgroundActivator::new(),
            metadata_checker,
            recovery_runner: Mutex::new(None),
            my_node,
            _config_sub: Mutex::new(None),
        });
        let weak = Arc::downgrade(&this);
        let sub = config.subscribe_to_updates(move || {
            if let Some(this) = weak.upgrade() {
                this.note_configuration_changed();
            }
        });
        *this._config_sub.lock() = Some(sub);
        this
    }

    pub fn config(&self) -> &Arc<UpdateableConfig> {
        &self.config
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    pub fn appender_buffer(&self, worker: usize) -> &AppenderBuffer {
        &self.appender_buffers[worker]
    }

    /// Installs the function that drives recovery of a freshly activated
    /// sequencer. Absent (tests, bypass setups) recovery requests are
    /// recorded and dropped.
    pub fn install_recovery_runner(&self, runner: RecoveryRunner) {
        *self.recovery_runner.lock() = Some(runner);
    }

    pub(crate) fn run_recovery(&self, seq: Arc<Sequencer>) {
        match &*self.recovery_runner.lock() {
            Some(runner) => runner(seq),
            None => {
                tracing::debug!(
                    target: "sequencer",
                    log = %seq.log_id(),
                    "no recovery runner installed, skipping recovery"
                );
            }
        }
    }

    pub fn find_sequencer(&self, log: LogId) -> Option<Arc<Sequencer>> {
        self.map.read().get(&log.data_log().0).cloned()
    }

    pub fn all_sequencers(&self) -> Vec<Arc<Sequencer>> {
        self.map.read().values().cloned().collect()
    }

    fn get_or_create(self: &Arc<Self>, log: LogId) -> Arc<Sequencer> {
        let map = self.map.upgradable_read();
        if let Some(seq) = map.get(&log.0) {
            return seq.clone();
        }
        // Only one thread can hold the upgradable lock, so the insert
        // cannot race with another creator.
        let mut map = RwLockUpgradableReadGuard::upgrade(map);
        map.entry(log.0).or_insert_with(|| Sequencer::new(log, Arc::downgrade(self))).clone()
    }

    /// Inserts a Sequencer for the log if absent and starts an
    /// activation gated on `pred`.
    pub fn activate_sequencer(
        self: &Arc<Self>,
        log: LogId,
        pred: impl FnOnce(&Sequencer) -> bool,
        acceptable_epoch: Option<Epoch>,
        check_metadata_log_before_provisioning: bool,
    ) -> Result<(), Status> {
        debug_assert!(!log.is_metadata_log());
        if !self.config.logs_config().contains(log) {
            return Err(Status::Notfound);
        }
        let seq = self.get_or_create(log);
        let this = self.clone();
        seq.start_activation(
            move |log| {
                this.get_epoch_metadata(log, acceptable_epoch, check_metadata_log_before_provisioning)
            },
            pred,
        )
    }

    /// Issues the epoch-store next-epoch update. The completion lands on
    /// a worker and flows into `on_epoch_metadata_from_epoch_store`.
    fn get_epoch_metadata(
        self: &Arc<Self>,
        log: LogId,
        acceptable_epoch: Option<Epoch>,
        check_metadata_log_before_provisioning: bool,
    ) -> Result<(), Status> {
        // Verifying the metadata log before provisioning works by simply
        // refusing to provision here; if the check comes back empty the
        // request is reissued with provisioning allowed. The check is
        // skipped when activating on startup, before any reader exists.
        let updater = Arc::new(EpochMetaDataUpdateToNextEpoch {
            server_config: self.config.server_config(),
            logs_config: self.config.logs_config(),
            acceptable_epoch,
            provision_if_empty: !check_metadata_log_before_provisioning,
            my_node: self.my_node,
        });
        let weak = Arc::downgrade(self);
        let fanout = self.fanout.clone();
        let completion = Box::new(
            move |status: Status,
                  log: LogId,
                  meta: Option<EpochMetaData>,
                  props: Option<EpochStoreMetaProperties>| {
                let Some(this) = weak.upgrade() else { return };
                fanout.post_any(Box::new(move || {
                    this.on_epoch_metadata_from_epoch_store(status, log, meta, props);
                }));
            },
        );
        if let Err(status) = self.epoch_store.create_or_update_metadata(log, updater, completion) {
            tracing::error!(
                target: "sequencer",
                %log,
                store = %self.epoch_store.identify(),
                %status,
                "failed to request next epoch from the epoch store"
            );
            // Activation is retried by subsequent appends; appenders
            // buffered after the transition to ACTIVATING are drained by
            // those future activations' completions.
            return Err(Status::Again);
        }
        Ok(())
    }

    pub fn activate_sequencer_if_not_active(
        self: &Arc<Self>,
        log: LogId,
        check_metadata_log_before_provisioning: bool,
    ) -> Result<(), Status> {
        self.activate_sequencer(
            log,
            |seq| seq.state() != SequencerState::Active,
            None,
            check_metadata_log_before_provisioning,
        )
        .map_err(|status| if status == Status::Aborted { Status::Exists } else { status })
    }

    /// Reactivates an existing sequencer when `pred` holds.
    /// `only_consecutive` restricts the new epoch to current + 1, the
    /// graceful-reactivation constraint.
    pub fn reactivate_if(
        self: &Arc<Self>,
        log: LogId,
        pred: impl FnOnce(&Sequencer) -> bool,
        only_consecutive: bool,
    ) -> Result<(), Status> {
        debug_assert!(!log.is_metadata_log());
        let seq = self.find_sequencer(log).ok_or(Status::Nosequencer)?;
        if seq.state() == SequencerState::Activating {
            // Already being reactivated.
            return Ok(());
        }
        let acceptable_epoch = if only_consecutive {
            let current = seq.current_epoch();
            current.is_valid().then(|| current.next())
        } else {
            None
        };
        self.activate_sequencer(log, pred, acceptable_epoch, true)
    }

    /// Startup path: activates a sequencer for every configured log, then
    /// polls until all have left UNAVAILABLE/ACTIVATING or the timeout
    /// expires.
    pub fn activate_all_sequencers(self: &Arc<Self>, timeout: Duration) -> Result<(), Status> {
        let logs: Vec<LogId> = self.config.logs_config().iter().map(|(log, _)| log).collect();
        for log in &logs {
            // Can't verify against the metadata log before the read path
            // is up; allow provisioning straight into the epoch store.
            match self.activate_sequencer_if_not_active(*log, false) {
                Ok(()) => {
                    tracing::debug!(target: "sequencer", log = %log, "activating sequencer");
                }
                Err(Status::Exists | Status::Inprogress | Status::Syslimit) => {
                    tracing::error!(target: "sequencer", log = %log, "a sequencer for the log already exists");
                    return Err(Status::Exists);
                }
                Err(Status::Failed) => {
                    tracing::error!(
                        target: "sequencer",
                        log = %log,
                        "could not activate a sequencer because an epoch store request failed"
                    );
                    return Err(Status::Failed);
                }
                Err(status) => {
                    tracing::error!(target: "sequencer", log = %log, %status, "unexpected activation error");
                    return Err(Status::Internal);
                }
            }
        }

        let start = Instant::now();
        let interval = Duration::from_millis(100);
        loop {
            let initialized = logs
                .iter()
                .filter_map(|log| self.find_sequencer(*log))
                .filter(|seq| {
                    !matches!(
                        seq.state(),
                        SequencerState::Unavailable | SequencerState::Activating
                    )
                })
                .count();
            if initialized == logs.len() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Status::Timedout);
            }
            std::thread::sleep(interval);
        }
    }

    /// Epoch-store completion. Runs on a worker.
    pub fn on_epoch_metadata_from_epoch_store(
        self: &Arc<Self>,
        status: Status,
        log: LogId,
        meta: Option<EpochMetaData>,
        props: Option<EpochStoreMetaProperties>,
    ) {
        // Sequencers are never removed, and this completion only exists
        // because an activation inserted one.
        let Some(seq) = self.find_sequencer(log) else { return };
        let server_config = self.config.server_config();

        let mut permanent = false;
        match status {
            Status::Ok => {
                let meta = meta.expect("OK completion carries metadata");
                debug_assert!(meta.is_valid());
                // The local config may be stale relative to the epoch
                // store. Proceed with activation anyway: failing here
                // would make every incoming append retrigger activation
                // with the same stale config. The mismatch resolves when
                // a config or epoch-store update arrives.
                if !metadata_matches_config(&meta, &server_config) {
                    tracing::error!(
                        target: "sequencer",
                        %log,
                        metadata = %meta.describe(log),
                        "metadata from the epoch store is not compatible with the current \
                         configuration; the sequencer may not be able to perform writes"
                    );
                    metrics::INCOMPATIBLE_METADATA.inc();
                }
                let window = self
                    .config
                    .logs_config()
                    .get(log)
                    .map(|attrs| attrs.max_writes_in_flight)
                    .unwrap_or(0);
                let epoch = meta.epoch;
                let result = seq.complete_activation_with_metadata(epoch, Arc::new(meta), window);
                if result != ActivateResult::Failed {
                    tracing::info!(
                        target: "sequencer",
                        %log,
                        %epoch,
                        result = ?result,
                        "activated sequencer"
                    );
                }
                self.finalize_activation(result, &seq, epoch);
                return;
            }
            Status::Notfound | Status::Empty => {
                if !server_config.sequencers_provision_epoch_store {
                    tracing::error!(
                        target: "sequencer",
                        %log,
                        "activation failed: log is not provisioned in the epoch store"
                    );
                } else {
                    // The epoch store is empty for this log. Verify the
                    // metadata log is too, then retry with provisioning
                    // allowed.
                    self.start_metadata_log_empty_check(log);
                    return;
                }
            }
            Status::Again => {
                tracing::warn!(
                    target: "sequencer",
                    %log,
                    "activation lost a race against another node incrementing the epoch"
                );
            }
            Status::Aborted => {
                let writer = props.as_ref().and_then(|p| p.last_writer);
                match (writer, meta.as_ref()) {
                    (Some(writer), Some(meta))
                        if writer.index != self.my_node.index && meta.epoch.is_valid() =>
                    {
                        seq.note_preempted(meta.epoch, writer);
                        tracing::info!(
                            target: "sequencer",
                            %log,
                            epoch = %meta.epoch,
                            by = %writer,
                            "preempted after the epoch store reported a newer sequencer"
                        );
                    }
                    _ => {
                        tracing::info!(
                            target: "sequencer",
                            %log,
                            "not reactivating: not the most current sequencer for the log"
                        );
                    }
                }
            }
            Status::Disabled => {
                tracing::error!(
                    target: "sequencer",
                    %log,
                    "cannot activate: the epoch store marks this log disabled"
                );
            }
            Status::Badmsg => {
                tracing::error!(
                    target: "sequencer",
                    %log,
                    "epoch store record is corrupted; the log cannot be used until it is fixed"
                );
            }
            Status::Toobig => {
                tracing::error!(
                    target: "sequencer",
                    %log,
                    "epoch numbers exhausted; the log can no longer be written"
                );
                permanent = true;
            }
            Status::Internal => {
                tracing::error!(target: "sequencer", %log, "internal epoch store error");
                permanent = true;
            }
            Status::Connfailed | Status::Timedout | Status::Shutdown | Status::Access => {
                tracing::warn!(target: "sequencer", %log, %status, "epoch store unavailable");
            }
            other => {
                tracing::error!(
                    target: "sequencer",
                    %log,
                    status = %other,
                    "unexpected epoch store completion status"
                );
            }
        }
        self.on_activation_failed(log, status, &seq, permanent);
    }

    fn start_metadata_log_empty_check(self: &Arc<Self>, log: LogId) {
        let weak = Arc::downgrade(self);
        let fanout = self.fanout.clone();
        self.metadata_checker.check_empty(
            log,
            Box::new(move |status| {
                let Some(this) = weak.upgrade() else { return };
                fanout.post_any(Box::new(move || {
                    this.on_metadata_log_empty_check_result(status, log);
                }));
            }),
        );
    }

    pub fn on_metadata_log_empty_check_result(self: &Arc<Self>, status: Status, log: LogId) {
        let failure_status = match status {
            Status::Notfound => {
                // Epoch store empty and now the metadata log confirmed
                // empty too: provision, accepting only epoch 1 so a
                // concurrent provisioner is detected.
                match self.get_epoch_metadata(log, Some(Epoch::MIN), false) {
                    Ok(()) => return,
                    Err(_) => {
                        tracing::error!(
                            target: "sequencer",
                            %log,
                            "both epoch store and metadata log are empty but the provisioning \
                             update could not be issued"
                        );
                        Status::Again
                    }
                }
            }
            Status::Notempty => {
                // The epoch store is empty but the metadata log is not.
                // Probable cause: corruption or an accidental epoch store
                // wipe. Never auto-repair this; fail transiently and page
                // the operator.
                metrics::METADATA_INCONSISTENCY.inc();
                tracing::error!(
                    target: "sequencer",
                    %log,
                    "CRITICAL: epoch store is empty but the metadata log is NOT"
                );
                Status::Again
            }
            Status::InvalidParam => {
                tracing::warn!(
                    target: "sequencer",
                    %log,
                    "metadata log check raced with a config update, log not in config"
                );
                Status::Again
            }
            Status::Timedout => {
                metrics::METADATA_CHECK_TIMEOUTS.inc();
                tracing::warn!(target: "sequencer", %log, "metadata log emptiness check timed out");
                Status::Again
            }
            Status::Access => {
                tracing::warn!(
                    target: "sequencer",
                    %log,
                    "denied access reading the metadata log during activation"
                );
                Status::Access
            }
            other => {
                tracing::error!(
                    target: "sequencer",
                    %log,
                    status = %other,
                    "unexpected error from the metadata log emptiness check"
                );
                Status::Again
            }
        };
        let Some(seq) = self.find_sequencer(log) else { return };
        self.on_activation_failed(log, failure_status, &seq, false);
    }

    fn on_activation_failed(
        self: &Arc<Self>,
        log: LogId,
        status: Status,
        seq: &Arc<Sequencer>,
        permanent: bool,
    ) {
        if permanent {
            seq.on_permanent_error();
        } else {
            seq.on_activation_failed();
        }
        self.notify_worker_activation_completion(log, status);
        metrics::ACTIVATION_FAILURES.inc();
    }

    fn finalize_activation(self: &Arc<Self>, result: ActivateResult, seq: &Arc<Sequencer>, epoch: Epoch) {
        let log = seq.log_id();
        let bypass_recovery = self.config.settings.get().bypass_recovery;
        match result {
            ActivateResult::Recovery => {
                if bypass_recovery {
                    tracing::warn!(
                        target: "sequencer",
                        %log,
                        %epoch,
                        "bypassing recovery according to test options"
                    );
                } else if seq.start_recovery().is_err() {
                    // Only happens while shutting down.
                    return;
                }
                self.complete_activation_success(seq, epoch);
            }
            ActivateResult::GracefulDraining => {
                // Success is deferred until the last appender of the old
                // epoch is reaped; the appender path then calls
                // on_graceful_reactivation_drained.
                metrics::GRACEFUL_DEFERRED.inc();
                tracing::debug!(
                    target: "sequencer",
                    %log,
                    %epoch,
                    "graceful reactivation deferred until the previous epoch drains"
                );
            }
            ActivateResult::Failed => {}
        }
    }

    /// The previous epoch drained after a graceful reactivation
    /// (`Sequencer::note_appender_reaped` returned true): run the
    /// deferred completion steps.
    pub fn on_graceful_reactivation_drained(self: &Arc<Self>, seq: &Arc<Sequencer>) {
        self.complete_activation_success(seq, seq.current_epoch());
    }

    fn complete_activation_success(self: &Arc<Self>, seq: &Arc<Sequencer>, epoch: Epoch) {
        let log = seq.log_id();
        let bypass_recovery = self.config.settings.get().bypass_recovery;
        self.notify_worker_activation_completion(log, Status::Ok);
        seq.metadata_writer().on_data_sequencer_reactivated(epoch);
        let meta_log = log.metadata_log();
        let has_buffered_meta = self.appender_buffers.iter().any(|buf| buf.has_buffered(meta_log));
        // Metadata-log recovery makes the log's tail known and lets
        // data-log recovery read historical metadata. Buffered metadata
        // appenders will take care of it themselves.
        if !has_buffered_meta && !bypass_recovery {
            seq.metadata_writer().recover_metadata_log();
        }
    }

    /// Posts a completion to every worker: replay (or fail) buffered
    /// appenders of the log and its metadata log, and let the background
    /// activator move on.
    fn notify_worker_activation_completion(self: &Arc<Self>, log: LogId, status: Status) {
        for worker in 0..self.fanout.worker_count() {
            let weak = Arc::downgrade(self);
            self.fanout.post_to(
                worker,
                Box::new(move || {
                    let Some(this) = weak.upgrade() else { return };
                    let buffer = &this.appender_buffers[worker];
                    if status == Status::Ok {
                        buffer.process_queue(log);
                        buffer.process_queue(log.metadata_log());
                    } else {
                        // Activation failed; clear pending appenders with
                        // an error that tells clients to go elsewhere.
                        buffer.send_error(log, Status::Nosequencer);
                        buffer.send_error(log.metadata_log(), Status::Nosequencer);
                    }
                    this.background_activator.notify_completion(log, status, &this);
                }),
            );
        }
    }

    /// Reprovisioning is allowed only once the current metadata made it
    /// into the metadata log.
    pub fn sequencer_should_reprovision(
        seq: &Sequencer,
        server_config: &ServerConfig,
        logs_config: &LogsConfig,
    ) -> bool {
        if !server_config.sequencers_provision_epoch_store {
            return false;
        }
        let Some(attrs) = logs_config.get(seq.log_id()) else {
            return false;
        };
        if seq.state() != SequencerState::Active {
            return false;
        }
        let Some(meta) = seq.current_metadata() else { return false };
        if !meta.written_in_metadata_log() {
            return false;
        }
        meta.replication != attrs.replication
    }

    pub fn sequencer_should_reactivate(
        seq: &Sequencer,
        server_config: &ServerConfig,
        logs_config: &LogsConfig,
    ) -> bool {
        if Self::sequencer_should_reprovision(seq, server_config, logs_config) {
            return true;
        }
        if seq.state() != SequencerState::Active {
            return false;
        }
        let current_window = seq.max_window_size();
        if current_window == 0 {
            return false;
        }
        let Some(attrs) = logs_config.get(seq.log_id()) else {
            // Log no longer in config; do not reactivate.
            return false;
        };
        let needs = current_window != attrs.max_writes_in_flight;
        if needs {
            tracing::info!(
                target: "sequencer",
                log = %seq.log_id(),
                epoch = %seq.current_epoch(),
                new_window = attrs.max_writes_in_flight,
                old_window = current_window,
                "scheduling reactivation: window size changed in config"
            );
        }
        needs
    }

    /// Config subscription callback: queue a reactivation scan of every
    /// known sequencer.
    pub fn note_configuration_changed(self: &Arc<Self>) {
        let server_config = self.config.server_config();
        if server_config.node(self.my_node.index).is_none() {
            debug_assert!(self.map.read().is_empty());
            return;
        }
        let logs: Vec<LogId> = {
            let map = self.map.read();
            map.values().map(|seq| seq.log_id()).collect()
        };
        if logs.is_empty() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.fanout.post_any(Box::new(move || {
            let Some(this) = weak.upgrade() else { return };
            let server_config = this.config.server_config();
            let logs_config = this.config.logs_config();
            let needs: Vec<LogId> = logs
                .into_iter()
                .filter_map(|log| this.find_sequencer(log))
                .filter(|seq| {
                    Self::sequencer_should_reactivate(seq, &server_config, &logs_config)
                })
                .map(|seq| seq.log_id())
                .collect();
            if !needs.is_empty() {
                this.background_activator.schedule(needs);
                this.background_activator.maybe_process_next(&this);
            }
        }));
    }

    pub fn disable_all_sequencers_due_to_isolation(&self) {
        for seq in self.map.read().values() {
            seq.on_node_isolated();
        }
    }

    pub fn shutdown(&self) {
        for seq in self.map.read().values() {
            seq.shutdown();
        }
    }
}

fn metadata_matches_config(meta: &EpochMetaData, config: &ServerConfig) -> bool {
    meta.nodeset.iter().all(|shard| {
        config
            .node(shard.node)
            .map(|node| shard.shard < node.num_shards)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch_store::InMemEpochStore;
    use crate::fanout::InlineFanout;
    use assert_matches::assert_matches;
    use logd_config::{LogAttributes, NodeConfig, Settings};
    use logd_primitives::{ReplicationProperty, ShardId};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server_config(version: u64) -> ServerConfig {
        let mut nodes = BTreeMap::new();
        for idx in 0..4u16 {
            nodes.insert(
                idx,
                NodeConfig {
                    node_id: NodeId::new(idx, 1),
                    address: format!("127.0.0.1:{}", 4440 + idx).parse().unwrap(),
                    gossip_address: None,
                    location: None,
                    num_shards: 2,
                    sequencer: true,
                },
            );
        }
        ServerConfig {
            cluster_name: "test".to_owned(),
            version,
            nodes,
            metadata_nodes: vec![0, 1],
            sequencers_provision_epoch_store: true,
        }
    }

    fn logs(attrs: LogAttributes) -> LogsConfig {
        LogsConfig::new([(1, attrs)].into_iter().collect())
    }

    struct Harness {
        all: Arc<AllSequencers>,
        store: Arc<InMemEpochStore>,
        config: Arc<UpdateableConfig>,
        recoveries: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        harness_with(LogAttributes::test_default(), Box::new(AlwaysEmptyChecker))
    }

    fn harness_with(attrs: LogAttributes, checker: Box<dyn MetadataLogChecker>) -> Harness {
        let config = Arc::new(UpdateableConfig::new(
            server_config(1),
            logs(attrs),
            Settings::test(),
        ));
        let store = InMemEpochStore::new_inline();
        let all = AllSequencers::new(
            config.clone(),
            store.clone(),
            Arc::new(InlineFanout { workers: 2 }),
            checker,
            NodeId::new(0, 1),
        );
        let recoveries = Arc::new(AtomicUsize::new(0));
        let r = recoveries.clone();
        all.install_recovery_runner(Box::new(move |_seq| {
            r.fetch_add(1, Ordering::Relaxed);
        }));
        Harness { all, store, config, recoveries }
    }

    /// Cold log: epoch store and metadata log both empty. Activation
    /// provisions epoch 1, the sequencer becomes ACTIVE and recovery is
    /// not needed beyond the trivial drive.
    #[test]
    fn clean_activation_provisions_epoch_one() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), true).unwrap();

        let seq = h.all.find_sequencer(LogId(1)).unwrap();
        assert_eq!(seq.state(), SequencerState::Active);
        assert_eq!(seq.current_epoch(), Epoch(1));
        assert_eq!(h.store.get_record(LogId(1)).unwrap().epoch, Epoch(1));
        assert_eq!(h.recoveries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn activation_for_unknown_log_is_notfound() {
        let h = harness();
        assert_matches!(
            h.all.activate_sequencer_if_not_active(LogId(9), false),
            Err(Status::Notfound)
        );
    }

    #[test]
    fn second_activation_maps_aborted_to_exists() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), false).unwrap();
        assert_matches!(
            h.all.activate_sequencer_if_not_active(LogId(1), false),
            Err(Status::Exists)
        );
        // Only one epoch-store increment happened.
        assert_eq!(h.store.get_record(LogId(1)).unwrap().epoch, Epoch(1));
    }

    #[test]
    fn populated_store_with_nonempty_metadata_log_fails_transiently() {
        struct NotEmptyChecker;
        impl MetadataLogChecker for NotEmptyChecker {
            fn check_empty(&self, _log: LogId, cb: Box<dyn FnOnce(Status) + Send>) {
                cb(Status::Notempty)
            }
        }
        let h = harness_with(LogAttributes::test_default(), Box::new(NotEmptyChecker));
        // check_metadata_log_before_provisioning on: the empty epoch
        // store triggers the check, which reports records present. This
        // is the critical inconsistency: no auto-repair, transient fail.
        h.all.activate_sequencer_if_not_active(LogId(1), true).unwrap();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();
        assert_eq!(seq.state(), SequencerState::Unavailable);
        assert!(h.store.get_record(LogId(1)).is_none());
    }

    /// Node A ran epoch 7; node B wrote epoch 8 to the store. A's
    /// consecutive reactivation comes back ABORTED with B as the last
    /// writer and A transitions to PREEMPTED by (B, 8).
    #[test]
    fn preemption_via_epoch_store() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), false).unwrap();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();

        // Fast-forward the sequencer to epoch 7 and plant B's epoch 8.
        for _ in 0..6 {
            h.all.reactivate_if(LogId(1), |_| true, false).unwrap();
        }
        assert_eq!(seq.current_epoch(), Epoch(7));
        let mut planted = h.store.get_record(LogId(1)).unwrap();
        planted.epoch = Epoch(8);
        planted.written_by = Some(NodeId::new(3, 1));
        h.store.put_record(LogId(1), planted);

        // A reactivates accepting only epoch 8; the store already holds
        // 8, so the next epoch would be 9.
        h.all.reactivate_if(LogId(1), |_| true, true).unwrap();
        assert_eq!(seq.state(), SequencerState::Preempted);
        assert_eq!(seq.preempted_by(), Some((Epoch(8), NodeId::new(3, 1))));
    }

    /// Config change bumps max_writes_in_flight: the background activator
    /// reactivates gracefully into the consecutive epoch and the old
    /// epoch drains.
    #[test]
    fn graceful_reactivation_on_window_change() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), false).unwrap();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();
        let lsn = seq.assign_lsn().unwrap();
        assert_eq!(lsn.epoch(), Epoch(1));

        let mut attrs = LogAttributes::test_default();
        attrs.max_writes_in_flight += 64;
        h.config.update_logs_config(logs(attrs.clone()));
        let mut bumped = server_config(2);
        bumped.version = 2;
        h.config.update_server_config(bumped);

        assert_eq!(seq.current_epoch(), Epoch(2));
        assert_eq!(seq.state(), SequencerState::Active);
        assert_eq!(seq.max_window_size(), attrs.max_writes_in_flight);
        // The appender from epoch 1 still drains.
        assert!(seq.note_appender_reaped());
    }

    #[test]
    fn epoch_exhaustion_is_a_permanent_error() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), false).unwrap();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();

        let mut planted = h.store.get_record(LogId(1)).unwrap();
        planted.epoch = Epoch::MAX;
        h.store.put_record(LogId(1), planted);
        h.all.reactivate_if(LogId(1), |_| true, false).unwrap();

        assert_eq!(seq.state(), SequencerState::PermanentError);
        assert_eq!(seq.assign_lsn().err(), Some(Status::Failed));
    }

    #[test]
    fn activate_all_waits_for_every_log() {
        let h = harness();
        h.all.activate_all_sequencers(Duration::from_secs(5)).unwrap();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();
        assert_eq!(seq.state(), SequencerState::Active);
    }

    #[test]
    fn isolation_disables_sequencers() {
        let h = harness();
        h.all.activate_sequencer_if_not_active(LogId(1), false).unwrap();
        h.all.disable_all_sequencers_due_to_isolation();
        let seq = h.all.find_sequencer(LogId(1)).unwrap();
        assert_eq!(seq.state(), SequencerState::Unavailable);
    }
}
