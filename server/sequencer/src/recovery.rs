//! Epoch recovery drive. Activating a sequencer at epoch `e` leaves the
//! range `(last_clean, e)` of its predecessors in an unknown state; the
//! drive seals that range on the nodeset, aggregates the SEALED replies
//! (per-epoch last-known-good, tails, offsets), finalizes with CLEAN and
//! advances the last clean epoch once enough shards confirmed.

use logd_network::messages::{CleanMessage, SealMessage, SealedMessage};
use logd_primitives::{Epoch, EpochMetaData, Esn, LogId, Lsn, NodeId, ShardId, Status};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How recovery talks to storage shards. The node assembly implements
/// this on top of the Sender; tests stub it.
pub trait RecoveryTransport: Send + Sync {
    fn send_seal(&self, shard: ShardId, msg: SealMessage);
    fn send_clean(&self, shard: ShardId, msg: CleanMessage);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Sealing,
    Cleaning,
    Done,
}

struct RecoveryState {
    phase: Phase,
    sealed: BTreeMap<ShardId, SealedMessage>,
    cleaned: BTreeSet<ShardId>,
    /// Highest LNG reported per epoch in the recovered range.
    lng_by_epoch: BTreeMap<Epoch, Esn>,
    last_seen_lsn: Lsn,
}

/// One recovery attempt of one log. Restarted wholesale on timeout by the
/// owner; `recovery_id` lets stale replies be discarded.
pub struct EpochRecovery {
    log: LogId,
    /// Epoch the sequencer just activated with.
    sequencer_epoch: Epoch,
    /// Epochs at or below this are sealed by this recovery.
    seal_epoch: Epoch,
    last_clean: Epoch,
    recovery_id: u64,
    nodeset: Vec<ShardId>,
    /// Replies needed before a phase completes: an f-majority of the
    /// nodeset, so that any copyset must intersect the sealed set.
    threshold: usize,
    my_node: NodeId,
    transport: Arc<dyn RecoveryTransport>,
    state: Mutex<RecoveryState>,
    on_complete: Mutex<Option<Box<dyn FnOnce(Epoch) + Send>>>,
}

impl EpochRecovery {
    pub fn new(
        log: LogId,
        metadata: &EpochMetaData,
        last_clean: Epoch,
        recovery_id: u64,
        my_node: NodeId,
        transport: Arc<dyn RecoveryTransport>,
        on_complete: Box<dyn FnOnce(Epoch) + Send>,
    ) -> Arc<EpochRecovery> {
        let nodeset = metadata.nodeset.clone();
        let replication = metadata.replication.replication_factor() as usize;
        let threshold = nodeset.len().saturating_sub(replication) + 1;
        Arc::new(EpochRecovery {
            log,
            sequencer_epoch: metadata.epoch,
            seal_epoch: Epoch(metadata.epoch.0.saturating_sub(1)),
            last_clean,
            recovery_id,
            nodeset,
            threshold: threshold.max(1),
            my_node,
            transport,
            state: Mutex::new(RecoveryState {
                phase: Phase::Sealing,
                sealed: BTreeMap::new(),
                cleaned: BTreeSet::new(),
                lng_by_epoch: BTreeMap::new(),
                last_seen_lsn: Lsn::INVALID,
            }),
            on_complete: Mutex::new(Some(on_complete)),
        })
    }

    pub fn log(&self) -> LogId {
        self.log
    }

    pub fn recovery_id(&self) -> u64 {
        self.recovery_id
    }

    /// Nothing to recover when the previous epoch is already clean; the
    /// completion fires immediately.
    pub fn start(&self) {
        if self.seal_epoch <= self.last_clean || !self.seal_epoch.is_valid() {
            self.complete();
            return;
        }
        tracing::info!(
            target: "recovery",
            log = %self.log,
            seal_epoch = %self.seal_epoch,
            last_clean = %self.last_clean,
            nodeset = ?self.nodeset,
            "starting epoch recovery"
        );
        for shard in &self.nodeset {
            self.transport.send_seal(
                *shard,
                SealMessage {
                    log: self.log,
                    seal_epoch: self.seal_epoch,
                    sequencer_epoch: self.sequencer_epoch,
                    last_clean_epoch: self.last_clean,
                    sealed_by: self.my_node,
                    shard: shard.shard,
                },
            );
        }
    }

    /// Re-sends the current phase's wave; the owner calls this on its
    /// retry timer.
    pub fn retry(&self) {
        let phase = self.state.lock().phase;
        match phase {
            Phase::Sealing => self.start(),
            Phase::Cleaning => self.send_cleans(),
            Phase::Done => {}
        }
    }

    pub fn on_sealed(&self, from: ShardId, msg: SealedMessage) {
        if msg.log != self.log || msg.seal_epoch != self.seal_epoch {
            return; // stale reply from an earlier attempt
        }
        let advance = {
            let mut state = self.state.lock();
            if state.phase != Phase::Sealing {
                return;
            }
            if msg.status != Status::Ok {
                tracing::debug!(
                    target: "recovery",
                    log = %self.log,
                    shard = %from,
                    status = %msg.status,
                    "shard failed to seal"
                );
                return;
            }
            // lng_list covers (last_clean, seal_epoch], oldest first.
            for (i, lng) in msg.lng_list.iter().enumerate() {
                let epoch = Epoch(self.last_clean.0 + 1 + i as u32);
                if epoch > self.seal_epoch {
                    break;
                }
                let entry = state.lng_by_epoch.entry(epoch).or_insert(Esn::INVALID);
                *entry = (*entry).max(*lng);
            }
            state.last_seen_lsn = state.last_seen_lsn.max(msg.last_lsn);
            state.sealed.insert(from, msg);
            if state.sealed.len() >= self.threshold {
                state.phase = Phase::Cleaning;
                true
            } else {
                false
            }
        };
        if advance {
            tracing::info!(
                target: "recovery",
                log = %self.log,
                sealed = self.threshold,
                "seal wave complete, sending CLEANs"
            );
            self.send_cleans();
        }
    }

    fn send_cleans(&self) {
        let sealed: Vec<ShardId> = self.state.lock().sealed.keys().copied().collect();
        for shard in sealed {
            self.transport.send_clean(
                shard,
                CleanMessage {
                    log: self.log,
                    epoch: self.seal_epoch,
                    recovery_id: self.recovery_id,
                    shard: shard.shard,
                },
            );
        }
    }

    pub fn on_cleaned(&self, from: ShardId, recovery_id: u64, status: Status) {
        if recovery_id != self.recovery_id {
            return;
        }
        let done = {
            let mut state = self.state.lock();
            if state.phase != Phase::Cleaning || status != Status::Ok {
                return;
            }
            state.cleaned.insert(from);
            if state.cleaned.len() >= self.threshold {
                state.phase = Phase::Done;
                true
            } else {
                false
            }
        };
        if done {
            self.complete();
        }
    }

    /// Consensus last-known-good of an epoch in the recovered range.
    pub fn last_known_good(&self, epoch: Epoch) -> Option<Esn> {
        self.state.lock().lng_by_epoch.get(&epoch).copied()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().phase == Phase::Done
    }

    fn complete(&self) {
        self.state.lock().phase = Phase::Done;
        if let Some(cb) = self.on_complete.lock().take() {
            tracing::info!(
                target: "recovery",
                log = %self.log,
                last_clean = %self.seal_epoch,
                "epoch recovery complete"
            );
            cb(self.seal_epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logd_primitives::ReplicationProperty;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        seals: StdMutex<Vec<(ShardId, SealMessage)>>,
        cleans: StdMutex<Vec<(ShardId, CleanMessage)>>,
    }

    impl MockTransport {
        fn new() -> Arc<MockTransport> {
            Arc::new(MockTransport {
                seals: StdMutex::new(Vec::new()),
                cleans: StdMutex::new(Vec::new()),
            })
        }
    }

    impl RecoveryTransport for MockTransport {
        fn send_seal(&self, shard: ShardId, msg: SealMessage) {
            self.seals.lock().unwrap().push((shard, msg));
        }
        fn send_clean(&self, shard: ShardId, msg: CleanMessage) {
            self.cleans.lock().unwrap().push((shard, msg));
        }
    }

    fn metadata(epoch: Epoch) -> EpochMetaData {
        let mut meta = EpochMetaData::new_for_provisioning(
            vec![
                ShardId::new(0, 0),
                ShardId::new(1, 0),
                ShardId::new(2, 0),
                ShardId::new(3, 0),
            ],
            ReplicationProperty::simple(2),
            NodeId::new(0, 1),
        );
        meta.epoch = epoch;
        meta
    }

    fn sealed(shard: ShardId, lng: u32) -> SealedMessage {
        SealedMessage {
            log: LogId(1),
            seal_epoch: Epoch(4),
            shard: shard.shard,
            status: Status::Ok,
            lng_list: vec![Esn(lng)],
            last_lsn: Lsn::from_parts(Epoch(4), Esn(lng)),
            tail_records: vec![],
            epoch_offset_map: vec![],
        }
    }

    #[test]
    fn seals_then_cleans_then_completes() {
        let transport = MockTransport::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        // Sequencer activated at epoch 5; epoch 4 is the seal target and
        // 3 is already clean.
        let recovery = EpochRecovery::new(
            LogId(1),
            &metadata(Epoch(5)),
            Epoch(3),
            42,
            NodeId::new(0, 1),
            transport.clone(),
            Box::new(move |last_clean| {
                assert_eq!(last_clean, Epoch(4));
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        recovery.start();
        assert_eq!(transport.seals.lock().unwrap().len(), 4);

        // Nodeset of 4, replication 2: an f-majority is 3 shards.
        recovery.on_sealed(ShardId::new(0, 0), sealed(ShardId::new(0, 0), 7));
        recovery.on_sealed(ShardId::new(1, 0), sealed(ShardId::new(1, 0), 9));
        assert!(transport.cleans.lock().unwrap().is_empty());
        recovery.on_sealed(ShardId::new(2, 0), sealed(ShardId::new(2, 0), 8));
        assert_eq!(transport.cleans.lock().unwrap().len(), 3);

        // Consensus LNG is the maximum reported.
        assert_eq!(recovery.last_known_good(Epoch(4)), Some(Esn(9)));

        recovery.on_cleaned(ShardId::new(0, 0), 42, Status::Ok);
        recovery.on_cleaned(ShardId::new(1, 0), 42, Status::Ok);
        assert_eq!(completions.load(Ordering::Relaxed), 0);
        recovery.on_cleaned(ShardId::new(2, 0), 42, Status::Ok);
        assert_eq!(completions.load(Ordering::Relaxed), 1);
        assert!(recovery.is_done());
    }

    #[test]
    fn nothing_to_recover_completes_immediately() {
        let transport = MockTransport::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        let recovery = EpochRecovery::new(
            LogId(1),
            &metadata(Epoch(1)),
            Epoch::INVALID,
            1,
            NodeId::new(0, 1),
            transport.clone(),
            Box::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        recovery.start();
        assert!(transport.seals.lock().unwrap().is_empty());
        assert_eq!(completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stale_replies_are_ignored() {
        let transport = MockTransport::new();
        let recovery = EpochRecovery::new(
            LogId(1),
            &metadata(Epoch(5)),
            Epoch(3),
            42,
            NodeId::new(0, 1),
            transport,
            Box::new(|_| {}),
        );
        recovery.start();
        let mut stale = sealed(ShardId::new(0, 0), 7);
        stale.seal_epoch = Epoch(2);
        recovery.on_sealed(ShardId::new(0, 0), stale);
        assert!(recovery.last_known_good(Epoch(4)).is_none());
        recovery.on_cleaned(ShardId::new(0, 0), 41, Status::Ok);
        assert!(!recovery.is_done());
    }
}
