//! The write path of one record: an Appender owns the STORE wave for one
//! assigned LSN, collects STOREDs and completes once enough copies are
//! durable. Rebuilding's chunk re-replication shares the STORED routing
//! through [`StoredWaiterMap`].

use bytes::Bytes;
use logd_network::messages::{Message, StoreHeader, StoreMessage, StoredMessage};
use logd_primitives::{EpochMetaData, Esn, LogId, Lsn, RecordTimestamp, ShardId, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes a STORED reply to whoever is waiting on that record. Keyed by
/// `(log, lsn)`; wave mismatches are handled by the waiter.
pub struct StoredWaiterMap {
    map: Mutex<HashMap<(u64, u64), Arc<dyn StoredWaiter>>>,
}

pub trait StoredWaiter: Send + Sync {
    /// Returns true when the waiter is finished and can be dropped from
    /// the map. `from_node` is the storage node the reply came from.
    fn on_stored(&self, from_node: u16, msg: &StoredMessage) -> bool;
}

impl StoredWaiterMap {
    pub fn new() -> Arc<StoredWaiterMap> {
        Arc::new(StoredWaiterMap { map: Mutex::new(HashMap::new()) })
    }

    pub fn register(&self, log: LogId, lsn: Lsn, waiter: Arc<dyn StoredWaiter>) {
        self.map.lock().insert((log.0, lsn.0), waiter);
    }

    pub fn unregister(&self, log: LogId, lsn: Lsn) {
        self.map.lock().remove(&(log.0, lsn.0));
    }

    pub fn dispatch(&self, from_node: u16, msg: &StoredMessage) {
        let key = (msg.log.0, Lsn::from_parts(msg.epoch, msg.esn).0);
        let waiter = self.map.lock().get(&key).cloned();
        if let Some(waiter) = waiter {
            if waiter.on_stored(from_node, msg) {
                self.map.lock().remove(&key);
            }
        }
    }
}

/// How STOREs leave the building; the server glues this to the Sender.
pub type StoreSendFn = Arc<dyn Fn(ShardId, Message) + Send + Sync>;

pub type AppendCompletion = Box<dyn FnOnce(Status, Lsn) + Send>;

struct AppendState {
    wave: u32,
    successes: Vec<ShardId>,
    completion: Option<AppendCompletion>,
}

/// One record's placement. The copyset is drawn from the epoch's nodeset,
/// rotated by ESN so consecutive records spread over the storage set.
pub struct Appender {
    log: LogId,
    lsn: Lsn,
    timestamp: RecordTimestamp,
    payload: Bytes,
    nodeset: Vec<ShardId>,
    replication: usize,
    last_known_good: Esn,
    send: StoreSendFn,
    state: Mutex<AppendState>,
}

impl Appender {
    pub fn new(
        log: LogId,
        lsn: Lsn,
        timestamp: RecordTimestamp,
        payload: Bytes,
        metadata: &EpochMetaData,
        last_known_good: Esn,
        send: StoreSendFn,
        completion: AppendCompletion,
    ) -> Arc<Appender> {
        Arc::new(Appender {
            log,
            lsn,
            timestamp,
            payload,
            nodeset: metadata.nodeset.clone(),
            replication: metadata.replication.replication_factor() as usize,
            last_known_good,
            send,
            state: Mutex::new(AppendState {
                wave: 0,
                successes: Vec::new(),
                completion: Some(completion),
            }),
        })
    }

    pub fn log(&self) -> LogId {
        self.log
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn pick_copyset(&self, wave: u32) -> Vec<ShardId> {
        let n = self.nodeset.len();
        let start = (self.lsn.esn().0 as usize + wave as usize) % n;
        (0..self.replication.min(n)).map(|i| self.nodeset[(start + i) % n]).collect()
    }

    /// Sends the next STORE wave.
    pub fn start_wave(&self) {
        let (wave, copyset) = {
            let mut state = self.state.lock();
            if state.completion.is_none() {
                return;
            }
            state.wave += 1;
            state.successes.clear();
            (state.wave, self.pick_copyset(state.wave))
        };
        tracing::debug!(
            target: "appender",
            log = %self.log,
            lsn = %self.lsn,
            wave,
            ?copyset,
            "sending STORE wave"
        );
        for (offset, shard) in copyset.iter().enumerate() {
            let header = StoreHeader {
                log: self.log,
                epoch: self.lsn.epoch(),
                esn: self.lsn.esn(),
                timestamp: self.timestamp,
                last_known_good: self.last_known_good,
                wave,
                flags: 0,
                nsync: 1,
                copyset_offset: offset as u8,
                copyset: copyset.clone(),
                offset_within_epoch: 0,
                custom_key: String::new(),
            };
            (self.send)(*shard, Message::Store(StoreMessage {
                header,
                payload: self.payload.clone(),
            }));
        }
    }

    fn complete(&self, status: Status) -> bool {
        let completion = self.state.lock().completion.take();
        match completion {
            Some(completion) => {
                completion(status, self.lsn);
                true
            }
            None => false,
        }
    }
}

impl StoredWaiter for Appender {
    fn on_stored(&self, from_node: u16, msg: &StoredMessage) -> bool {
        debug_assert_eq!(msg.log, self.log);
        match msg.status {
            Status::Ok => {
                let done = {
                    let mut state = self.state.lock();
                    if msg.wave != state.wave {
                        return false; // stale wave
                    }
                    let copy = ShardId::new(from_node, msg.shard);
                    if !state.successes.contains(&copy) {
                        state.successes.push(copy);
                    }
                    state.successes.len() >= self.replication
                };
                if done {
                    return self.complete(Status::Ok);
                }
                false
            }
            Status::Preempted => {
                // A newer sequencer sealed this epoch; the append fails
                // and the owner notes the preemption.
                self.complete(Status::Preempted)
            }
            Status::Nospc | Status::Disabled | Status::Nobufs => {
                // This copy failed; retry with a different copyset.
                tracing::debug!(
                    target: "appender",
                    log = %self.log,
                    lsn = %self.lsn,
                    shard = msg.shard,
                    status = %msg.status,
                    "copy failed, retrying with a new wave"
                );
                self.start_wave();
                false
            }
            other => {
                tracing::debug!(
                    target: "appender",
                    log = %self.log,
                    lsn = %self.lsn,
                    status = %other,
                    "copy failed"
                );
                self.start_wave();
                false
            }
        }
    }
}

/// Chunk re-replication for rebuilding: every record of the chunk goes to
/// the surviving copyset members as a STORE carrying the rebuilding
/// flags; the job completes once every record got one STORED.
pub struct ChunkStoreJob {
    expected: usize,
    received: Mutex<usize>,
    failed: Mutex<Option<Status>>,
    completion: Mutex<Option<Box<dyn FnOnce(Status) + Send>>>,
}

impl ChunkStoreJob {
    pub fn new(expected: usize, completion: Box<dyn FnOnce(Status) + Send>) -> Arc<ChunkStoreJob> {
        Arc::new(ChunkStoreJob {
            expected,
            received: Mutex::new(0),
            failed: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
        })
    }
}

impl StoredWaiter for ChunkStoreJob {
    fn on_stored(&self, _from_node: u16, msg: &StoredMessage) -> bool {
        if msg.status != Status::Ok {
            *self.failed.lock() = Some(msg.status);
        }
        let done = {
            let mut received = self.received.lock();
            *received += 1;
            *received >= self.expected
        };
        if done {
            let status = self.failed.lock().take().unwrap_or(Status::Ok);
            if let Some(completion) = self.completion.lock().take() {
                completion(status);
            }
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logd_primitives::{Epoch, NodeId, ReplicationProperty};
    use std::sync::Mutex as StdMutex;

    fn metadata() -> EpochMetaData {
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
        meta.epoch = Epoch(5);
        meta
    }

    fn stored(appender: &Appender, shard: ShardId, wave: u32, status: Status) -> StoredMessage {
        StoredMessage {
            log: appender.log(),
            epoch: appender.lsn().epoch(),
            esn: appender.lsn().esn(),
            wave,
            status,
            redirect: shard.node,
            flags: 0,
            shard: shard.shard,
        }
    }

    #[test]
    fn completes_after_replication_factor_acks() {
        let sent: Arc<StdMutex<Vec<(ShardId, Message)>>> = Arc::new(StdMutex::new(Vec::new()));
        let s = sent.clone();
        let result: Arc<StdMutex<Option<(Status, Lsn)>>> = Arc::new(StdMutex::new(None));
        let r = result.clone();
        let appender = Appender::new(
            LogId(1),
            Lsn::from_parts(Epoch(5), Esn(10)),
            RecordTimestamp(1000),
            Bytes::from_static(b"payload"),
            &metadata(),
            Esn(9),
            Arc::new(move |shard, msg| s.lock().unwrap().push((shard, msg))),
            Box::new(move |status, lsn| *r.lock().unwrap() = Some((status, lsn))),
        );
        appender.start_wave();
        let wave_sends: Vec<ShardId> = sent.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(wave_sends.len(), 2, "replication factor copies per wave");

        assert!(!appender.on_stored(
            wave_sends[0].node,
            &stored(&appender, wave_sends[0], 1, Status::Ok)
        ));
        assert!(appender.on_stored(
            wave_sends[1].node,
            &stored(&appender, wave_sends[1], 1, Status::Ok)
        ));
        assert_eq!(
            *result.lock().unwrap(),
            Some((Status::Ok, Lsn::from_parts(Epoch(5), Esn(10))))
        );
    }

    #[test]
    fn failed_copy_triggers_a_new_wave_and_stale_acks_are_ignored() {
        let sent: Arc<StdMutex<Vec<(ShardId, Message)>>> = Arc::new(StdMutex::new(Vec::new()));
        let s = sent.clone();
        let appender = Appender::new(
            LogId(1),
            Lsn::from_parts(Epoch(5), Esn(10)),
            RecordTimestamp(1000),
            Bytes::new(),
            &metadata(),
            Esn::INVALID,
            Arc::new(move |shard, msg| s.lock().unwrap().push((shard, msg))),
            Box::new(|_, _| {}),
        );
        appender.start_wave();
        let first_wave: Vec<ShardId> = sent.lock().unwrap().iter().map(|(s, _)| *s).collect();

        // One shard is out of space: a second wave goes out.
        assert!(!appender.on_stored(
            first_wave[0].node,
            &stored(&appender, first_wave[0], 1, Status::Nospc)
        ));
        assert_eq!(sent.lock().unwrap().len(), 4, "two waves of two copies");

        // A late ack of wave 1 no longer counts.
        assert!(!appender.on_stored(
            first_wave[1].node,
            &stored(&appender, first_wave[1], 1, Status::Ok)
        ));
    }

    #[test]
    fn preemption_fails_the_append() {
        let result: Arc<StdMutex<Option<(Status, Lsn)>>> = Arc::new(StdMutex::new(None));
        let r = result.clone();
        let appender = Appender::new(
            LogId(1),
            Lsn::from_parts(Epoch(5), Esn(10)),
            RecordTimestamp(1000),
            Bytes::new(),
            &metadata(),
            Esn::INVALID,
            Arc::new(|_, _| {}),
            Box::new(move |status, lsn| *r.lock().unwrap() = Some((status, lsn))),
        );
        appender.start_wave();
        let preempted = StoredMessage {
            log: LogId(1),
            epoch: Epoch(5),
            esn: Esn(10),
            wave: 1,
            status: Status::Preempted,
            redirect: 3,
            flags: 0,
            shard: 0,
        };
        assert!(appender.on_stored(0, &preempted));
        assert_eq!(result.lock().unwrap().unwrap().0, Status::Preempted);
    }

    #[test]
    fn waiter_map_routes_by_rid() {
        let map = StoredWaiterMap::new();
        let hits = Arc::new(StdMutex::new(0));
        struct Counting(Arc<StdMutex<i32>>);
        impl StoredWaiter for Counting {
            fn on_stored(&self, _from_node: u16, _msg: &StoredMessage) -> bool {
                *self.0.lock().unwrap() += 1;
                true
            }
        }
        map.register(LogId(1), Lsn::from_parts(Epoch(1), Esn(1)), Arc::new(Counting(hits.clone())));
        let msg = StoredMessage {
            log: LogId(1),
            epoch: Epoch(1),
            esn: Esn(1),
            wave: 1,
            status: Status::Ok,
            redirect: 0,
            flags: 0,
            shard: 0,
        };
        map.dispatch(2, &msg);
        // The waiter finished and was removed; a duplicate is ignored.
        map.dispatch(2, &msg);
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
