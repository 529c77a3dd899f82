use crate::all_sequencers::AllSequencers;
use logd_primitives::{LogId, Status};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

struct Inner {
    queue: VecDeque<u64>,
    queued: HashSet<u64>,
    in_flight: Option<u64>,
}

/// Paces config-driven reactivations: one at a time, deduplicated, so a
/// config change touching every log does not stampede the epoch store.
pub struct SequencerBackgroundActivator {
    inner: Mutex<Inner>,
}

impl SequencerBackgroundActivator {
    pub fn new() -> SequencerBackgroundActivator {
        SequencerBackgroundActivator {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: None,
            }),
        }
    }

    pub fn schedule(&self, logs: impl IntoIterator<Item = LogId>) {
        let mut inner = self.inner.lock();
        for log in logs {
            if inner.queued.insert(log.0) {
                inner.queue.push_back(log.0);
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Starts the next queued reactivation if none is in flight.
    pub fn maybe_process_next(&self, all: &Arc<AllSequencers>) {
        let log = {
            let mut inner = self.inner.lock();
            if inner.in_flight.is_some() {
                return;
            }
            let Some(log) = inner.queue.pop_front() else { return };
            inner.queued.remove(&log);
            inner.in_flight = Some(log);
            LogId(log)
        };

        let config = all.config();
        let server_config = config.server_config();
        let logs_config = config.logs_config();
        let result = all.reactivate_if(
            log,
            move |seq| AllSequencers::sequencer_should_reactivate(seq, &server_config, &logs_config),
            /* only_consecutive */ true,
        );
        match result {
            Ok(()) => {}
            Err(status) => {
                tracing::debug!(
                    target: "sequencer",
                    %log,
                    %status,
                    "background reactivation not started"
                );
                self.clear_in_flight(log);
                self.maybe_process_next(all);
            }
        }
    }

    fn clear_in_flight(&self, log: LogId) {
        let mut inner = self.inner.lock();
        if inner.in_flight == Some(log.0) {
            inner.in_flight = None;
        }
    }

    /// Activation of `log` finished (either way); move on.
    pub fn notify_completion(&self, log: LogId, _status: Status, all: &Arc<AllSequencers>) {
        self.clear_in_flight(log);
        self.maybe_process_next(all);
    }
}

impl Default for SequencerBackgroundActivator {
    fn default() -> Self {
        SequencerBackgroundActivator::new()
    }
}
