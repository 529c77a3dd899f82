//! The epoch store client: an opaque read-modify-write coordination
//! service holding exactly one current EpochMetaData per data log. The
//! updater runs against the stored record inside the store's atomicity
//! domain; completions are reported asynchronously with
//! `(status, metadata, properties)`.

use logd_config::{LogsConfig, ServerConfig};
use logd_primitives::{Epoch, EpochMetaData, LogId, NodeId, ReplicationProperty, ShardId, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata about the stored record itself, alongside its content.
#[derive(Clone, Debug, Default)]
pub struct EpochStoreMetaProperties {
    /// Node that last successfully wrote the record. Used to detect
    /// preemption on ABORTED updates.
    pub last_writer: Option<NodeId>,
}

pub type EpochStoreCompletion =
    Box<dyn FnOnce(Status, LogId, Option<EpochMetaData>, Option<EpochStoreMetaProperties>) + Send>;

/// Read-modify-write closure applied to the stored record.
pub trait EpochMetaDataUpdater: Send + Sync {
    fn update(
        &self,
        log: LogId,
        current: Option<&EpochMetaData>,
        props: &EpochStoreMetaProperties,
    ) -> Result<EpochMetaData, Status>;
}

pub trait EpochStore: Send + Sync {
    fn create_or_update_metadata(
        &self,
        log: LogId,
        updater: Arc<dyn EpochMetaDataUpdater>,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status>;

    /// Descriptive string for log messages.
    fn identify(&self) -> String;
}

/// Advances a log to its next epoch, or provisions epoch 1 when the store
/// has no record and provisioning is allowed.
pub struct EpochMetaDataUpdateToNextEpoch {
    pub server_config: Arc<ServerConfig>,
    pub logs_config: Arc<LogsConfig>,
    /// When set, the update only succeeds if the next epoch is exactly
    /// this; otherwise it fails with ABORTED (a newer writer moved ahead).
    pub acceptable_epoch: Option<Epoch>,
    pub provision_if_empty: bool,
    pub my_node: NodeId,
}

impl EpochMetaDataUpdateToNextEpoch {
    fn select_nodeset(
        &self,
        log: LogId,
        nodeset_size: usize,
        replication: &ReplicationProperty,
    ) -> Result<Vec<ShardId>, Status> {
        let storage_nodes: Vec<_> =
            self.server_config.nodes.values().filter(|n| n.num_shards > 0).collect();
        if storage_nodes.len() < replication.replication_factor() as usize {
            return Err(Status::Failed);
        }
        // Deterministic spread: logs start at different offsets of the
        // node list so nodesets do not all pile on the same nodes.
        let want = nodeset_size.clamp(replication.replication_factor() as usize, storage_nodes.len());
        let start = (log.0 as usize) % storage_nodes.len();
        let mut nodeset = Vec::with_capacity(want);
        for i in 0..want {
            let node = storage_nodes[(start + i) % storage_nodes.len()];
            let shard = (log.0 % node.num_shards as u64) as u8;
            nodeset.push(ShardId::new(node.node_id.index, shard));
        }
        Ok(nodeset)
    }
}

impl EpochMetaDataUpdater for EpochMetaDataUpdateToNextEpoch {
    fn update(
        &self,
        log: LogId,
        current: Option<&EpochMetaData>,
        _props: &EpochStoreMetaProperties,
    ) -> Result<EpochMetaData, Status> {
        let Some(attrs) = self.logs_config.get(log) else {
            return Err(Status::Notfound);
        };
        match current {
            None => {
                if !self.provision_if_empty {
                    return Err(Status::Empty);
                }
                let nodeset = self.select_nodeset(log, attrs.nodeset_size, &attrs.replication)?;
                Ok(EpochMetaData::new_for_provisioning(
                    nodeset,
                    attrs.replication.clone(),
                    self.my_node,
                ))
            }
            Some(cur) => {
                if cur.is_disabled() {
                    return Err(Status::Disabled);
                }
                if cur.epoch >= Epoch::MAX {
                    return Err(Status::Toobig);
                }
                let next = cur.epoch.next();
                if let Some(acceptable) = self.acceptable_epoch {
                    if next != acceptable {
                        return Err(Status::Aborted);
                    }
                }
                let mut new = cur.clone();
                new.epoch = next;
                new.written_by = Some(self.my_node);
                // Reprovision placement when the replication policy in the
                // config changed; otherwise the nodeset carries over.
                if cur.replication != attrs.replication {
                    let nodeset = self.select_nodeset(log, attrs.nodeset_size, &attrs.replication)?;
                    new.nodeset = nodeset;
                    new.replication = attrs.replication.clone();
                    new.effective_since = next;
                    new.flags &= !logd_primitives::epoch_metadata::epoch_metadata_flags::WRITTEN_IN_METADATA_LOG;
                }
                Ok(new)
            }
        }
    }
}

/// In-memory epoch store: the coordination backend for tests and
/// single-node deployments. Updaters run under one mutex; completions are
/// delivered through the configured poster.
pub struct InMemEpochStore {
    state: Mutex<HashMap<u64, (EpochMetaData, EpochStoreMetaProperties)>>,
    poster: Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>,
}

impl InMemEpochStore {
    /// Completions run inline on the calling thread.
    pub fn new_inline() -> Arc<InMemEpochStore> {
        Arc::new(InMemEpochStore {
            state: Mutex::new(HashMap::new()),
            poster: Arc::new(|f| f()),
        })
    }

    pub fn with_poster(
        poster: Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>,
    ) -> Arc<InMemEpochStore> {
        Arc::new(InMemEpochStore { state: Mutex::new(HashMap::new()), poster })
    }

    /// Test hook: plants a record as if another node had written it.
    pub fn put_record(&self, log: LogId, meta: EpochMetaData) {
        let props = EpochStoreMetaProperties { last_writer: meta.written_by };
        self.state.lock().insert(log.0, (meta, props));
    }

    pub fn get_record(&self, log: LogId) -> Option<EpochMetaData> {
        self.state.lock().get(&log.0).map(|(m, _)| m.clone())
    }
}

impl EpochStore for InMemEpochStore {
    fn create_or_update_metadata(
        &self,
        log: LogId,
        updater: Arc<dyn EpochMetaDataUpdater>,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status> {
        let outcome = {
            let mut state = self.state.lock();
            let existing = state.get(&log.0).cloned();
            let props = existing.as_ref().map(|(_, p)| p.clone()).unwrap_or_default();
            match updater.update(log, existing.as_ref().map(|(m, _)| m), &props) {
                Ok(new_meta) => {
                    if !new_meta.is_valid() {
                        (Status::Failed, None, None)
                    } else {
                        let new_props =
                            EpochStoreMetaProperties { last_writer: new_meta.written_by };
                        state.insert(log.0, (new_meta.clone(), new_props.clone()));
                        (Status::Ok, Some(new_meta), Some(new_props))
                    }
                }
                Err(Status::Aborted) => {
                    // Hand back the stored record so the caller can see
                    // who moved past it.
                    match existing {
                        Some((meta, props)) => (Status::Aborted, Some(meta), Some(props)),
                        None => (Status::Aborted, None, None),
                    }
                }
                Err(status) => (status, None, None),
            }
        };
        let (status, meta, props) = outcome;
        (self.poster)(Box::new(move || completion(status, log, meta, props)));
        Ok(())
    }

    fn identify(&self) -> String {
        "in-memory epoch store".to_owned()
    }
}
