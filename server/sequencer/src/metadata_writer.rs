use crate::sequencer::Sequencer;
use logd_primitives::{Epoch, LogId, Status};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Weak;

type WriteCompletion = Box<dyn FnOnce(Status) + Send>;

struct WriterState {
    /// Data-log epoch of the most recent reactivation we were told about.
    last_reactivation_epoch: Epoch,
    /// One metadata-log write runs at a time; the rest wait here.
    running: bool,
    pending: VecDeque<(Vec<u8>, WriteCompletion)>,
    recovery_pending: bool,
}

/// Serializes writes into a data log's metadata log. Owned by the data
/// log's Sequencer; the back-reference is the parent handle it was
/// constructed with.
pub struct MetaDataLogWriter {
    log_id: LogId,
    parent: Weak<Sequencer>,
    state: Mutex<WriterState>,
}

impl MetaDataLogWriter {
    pub(crate) fn new(log_id: LogId, parent: Weak<Sequencer>) -> MetaDataLogWriter {
        MetaDataLogWriter {
            log_id,
            parent,
            state: Mutex::new(WriterState {
                last_reactivation_epoch: Epoch::INVALID,
                running: false,
                pending: VecDeque::new(),
                recovery_pending: false,
            }),
        }
    }

    pub fn metadata_log_id(&self) -> LogId {
        self.log_id.metadata_log()
    }

    /// The data sequencer activated (or reactivated) at `epoch`. Aborts
    /// nothing; writes queued under an older epoch still drain, the
    /// metadata log is ordered by the data log's epochs.
    pub fn on_data_sequencer_reactivated(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        if epoch > state.last_reactivation_epoch {
            state.last_reactivation_epoch = epoch;
        }
        tracing::debug!(
            target: "sequencer",
            log = %self.log_id,
            %epoch,
            "metadata log writer notified of reactivation"
        );
    }

    /// Requests recovery of the metadata log so its last released LSN is
    /// known and data-log recovery can read historical epoch metadata.
    /// Deduplicated while one is pending.
    pub fn recover_metadata_log(&self) {
        let mut state = self.state.lock();
        if state.recovery_pending {
            return;
        }
        state.recovery_pending = true;
        tracing::debug!(
            target: "sequencer",
            log = %self.metadata_log_id(),
            "scheduling metadata log recovery"
        );
    }

    pub fn take_recovery_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().recovery_pending)
    }

    /// Appends a serialized EpochMetaData record to the metadata log.
    /// Writes are strictly one at a time; completion fires when the write
    /// is either performed or failed.
    pub fn write_metadata_record(
        &self,
        record: Vec<u8>,
        completion: WriteCompletion,
        perform: impl FnOnce(LogId, Vec<u8>, WriteCompletion),
    ) {
        {
            let mut state = self.state.lock();
            if state.running {
                state.pending.push_back((record, completion));
                return;
            }
            state.running = true;
        }
        perform(self.metadata_log_id(), record, completion);
    }

    /// The in-flight write finished; starts the next queued one through
    /// `perform`.
    pub fn on_write_done(&self, perform: impl FnOnce(LogId, Vec<u8>, WriteCompletion)) {
        let next = {
            let mut state = self.state.lock();
            match state.pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    state.running = false;
                    None
                }
            }
        };
        if let Some((record, completion)) = next {
            perform(self.metadata_log_id(), record, completion);
        }
    }

    pub fn parent(&self) -> Weak<Sequencer> {
        self.parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn writes_are_serialized() {
        let writer = MetaDataLogWriter::new(LogId(1), Weak::new());
        let performed = Arc::new(AtomicUsize::new(0));

        let p = performed.clone();
        writer.write_metadata_record(vec![1], Box::new(|_| {}), |log, _, _| {
            assert!(log.is_metadata_log());
            p.fetch_add(1, Ordering::Relaxed);
        });
        // Second write queues behind the first.
        let p = performed.clone();
        writer.write_metadata_record(vec![2], Box::new(|_| {}), |_, _, _| {
            p.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(performed.load(Ordering::Relaxed), 1);

        let p = performed.clone();
        writer.on_write_done(|_, record, _| {
            assert_eq!(record, vec![2]);
            p.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(performed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn recovery_requests_are_deduplicated()
    {
        let writer = MetaDataLogWriter::new(LogId(1), Weak::new());
        writer.recover_metadata_log();
        writer.recover_metadata_log();
        assert!(writer.take_recovery_request());
        assert!(!writer.take_recovery_request());
    }
}
