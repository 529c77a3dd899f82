use crate::all_sequencers::AllSequencers;
use crate::metadata_writer::MetaDataLogWriter;
use crate::metrics;
use logd_primitives::{Epoch, EpochMetaData, Esn, LogId, Lsn, NodeId, Status};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::FromRepr, strum::IntoStaticStr)]
#[repr(u8)]
pub enum SequencerState {
    /// Not activated, or a transient activation failure put it back here.
    Unavailable = 0,
    /// An epoch-store update is in flight.
    Activating = 1,
    Active = 2,
    /// A newer sequencer for this log exists at a higher epoch.
    Preempted = 3,
    /// Epoch space exhausted or an internal epoch-store error; appends
    /// fail permanently until operator intervention.
    PermanentError = 4,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ActivateResult {
    /// Activation finished; the new epoch needs recovery of its
    /// predecessors.
    Recovery,
    /// Activation finished, but appenders of the previous epoch are still
    /// in flight; completion is deferred until they are reaped.
    GracefulDraining,
    Failed,
}

struct Inner {
    state: SequencerState,
    current_epoch: Epoch,
    metadata: Option<Arc<EpochMetaData>>,
    preempted_by: Option<(Epoch, NodeId)>,
    window_size: usize,
    next_esn: Esn,
    appenders_in_flight: usize,
    /// Epoch being drained by a graceful reactivation.
    draining_epoch: Option<Epoch>,
    last_released: Lsn,
}

/// Per-log sequencer. Created lazily on first reference and never removed
/// while the process lives. State transitions are serialized by the
/// internal lock; `state()`/`current_epoch()` are lock-free reads of
/// atomic mirrors.
pub struct Sequencer {
    log_id: LogId,
    inner: Mutex<Inner>,
    state_atomic: AtomicU8,
    epoch_atomic: AtomicU32,
    meta_writer: MetaDataLogWriter,
    parent: Weak<AllSequencers>,
}

impl Sequencer {
    pub(crate) fn new(log_id: LogId, parent: Weak<AllSequencers>) -> Arc<Sequencer> {
        Arc::new_cyclic(|weak| Sequencer {
            log_id,
            inner: Mutex::new(Inner {
                state: SequencerState::Unavailable,
                current_epoch: Epoch::INVALID,
                metadata: None,
                preempted_by: None,
                window_size: 0,
                next_esn: Esn::MIN,
                appenders_in_flight: 0,
                draining_epoch: None,
                last_released: Lsn::INVALID,
            }),
            state_atomic: AtomicU8::new(SequencerState::Unavailable as u8),
            epoch_atomic: AtomicU32::new(0),
            meta_writer: MetaDataLogWriter::new(log_id, weak.clone()),
            parent,
        })
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn state(&self) -> SequencerState {
        SequencerState::from_repr(self.state_atomic.load(Ordering::Acquire))
            .unwrap_or(SequencerState::Unavailable)
    }

    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch_atomic.load(Ordering::Acquire))
    }

    pub fn metadata_writer(&self) -> &MetaDataLogWriter {
        &self.meta_writer
    }

    pub fn current_metadata(&self) -> Option<Arc<EpochMetaData>> {
        self.inner.lock().metadata.clone()
    }

    pub fn preempted_by(&self) -> Option<(Epoch, NodeId)> {
        self.inner.lock().preempted_by
    }

    pub fn max_window_size(&self) -> usize {
        self.inner.lock().window_size
    }

    fn set_state(&self, inner: &mut Inner, state: SequencerState) {
        inner.state = state;
        self.state_atomic.store(state as u8, Ordering::Release);
    }

    /// Starts an activation: checks the predicate, transitions to
    /// ACTIVATING and invokes `get_metadata`, which issues the epoch-store
    /// update. Idempotent with respect to the predicate: when the
    /// predicate rejects, the epoch store is never touched and ABORTED is
    /// returned.
    pub fn start_activation(
        &self,
        get_metadata: impl FnOnce(LogId) -> Result<(), Status>,
        pred: impl FnOnce(&Sequencer) -> bool,
    ) -> Result<(), Status> {
        // The predicate runs before the state lock is taken so it may use
        // any accessor; the Activating check below still guards against
        // concurrent activations.
        if !pred(self) {
            return Err(Status::Aborted);
        }
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SequencerState::Activating => return Err(Status::Inprogress),
                SequencerState::PermanentError => return Err(Status::Failed),
                _ => {}
            }
            self.set_state(&mut inner, SequencerState::Activating);
        }
        match get_metadata(self.log_id) {
            Ok(()) => Ok(()),
            Err(status) => {
                // The epoch-store request never went out; fall back to the
                // pre-activation state. Appenders buffered meanwhile will
                // retrigger activation.
                self.on_activation_failed();
                Err(status)
            }
        }
    }

    /// Installs metadata fetched from the epoch store: epoch, nodeset and
    /// replication move to the new values in one transition.
    pub fn complete_activation_with_metadata(
        &self,
        epoch: Epoch,
        metadata: Arc<EpochMetaData>,
        window_size: usize,
    ) -> ActivateResult {
        let mut inner = self.inner.lock();
        if inner.state != SequencerState::Activating {
            return ActivateResult::Failed;
        }
        if epoch <= inner.current_epoch {
            tracing::error!(
                target: "sequencer",
                log = %self.log_id,
                new = %epoch,
                current = %inner.current_epoch,
                "epoch store returned a non-increasing epoch"
            );
            return ActivateResult::Failed;
        }
        let prev_epoch = inner.current_epoch;
        let draining = prev_epoch.is_valid() && inner.appenders_in_flight > 0;

        inner.current_epoch = epoch;
        inner.metadata = Some(metadata);
        inner.window_size = window_size;
        inner.next_esn = Esn::MIN;
        if let Some((pre_epoch, _)) = inner.preempted_by {
            if pre_epoch < epoch {
                inner.preempted_by = None;
            }
        }
        self.epoch_atomic.store(epoch.0, Ordering::Release);
        self.set_state(&mut inner, SequencerState::Active);
        metrics::ACTIVATIONS.inc();

        if draining {
            inner.draining_epoch = Some(prev_epoch);
            ActivateResult::GracefulDraining
        } else {
            ActivateResult::Recovery
        }
    }

    /// Transient activation failure: return to the state activation
    /// started from.
    pub fn on_activation_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SequencerState::Activating {
            return;
        }
        let fallback = if inner.preempted_by.is_some() {
            SequencerState::Preempted
        } else if inner.current_epoch.is_valid() {
            SequencerState::Active
        } else {
            SequencerState::Unavailable
        };
        self.set_state(&mut inner, fallback);
    }

    pub fn on_permanent_error(&self) {
        let mut inner = self.inner.lock();
        self.set_state(&mut inner, SequencerState::PermanentError);
    }

    /// A newer sequencer exists: records who preempted us and at which
    /// epoch. Appends fail with PREEMPTED until a reactivation wins a
    /// higher epoch.
    pub fn note_preempted(&self, epoch: Epoch, by: NodeId) {
        let mut inner = self.inner.lock();
        match inner.preempted_by {
            Some((cur, _)) if cur >= epoch => {}
            _ => inner.preempted_by = Some((epoch, by)),
        }
        if epoch >= inner.current_epoch && inner.state != SequencerState::PermanentError {
            self.set_state(&mut inner, SequencerState::Preempted);
        }
        tracing::info!(
            target: "sequencer",
            log = %self.log_id,
            %epoch,
            by = %by,
            "sequencer preempted"
        );
        metrics::PREEMPTIONS.inc();
    }

    /// Assigns the next LSN of the current epoch to an appender.
    pub fn assign_lsn(&self) -> Result<Lsn, Status> {
        let mut inner = self.inner.lock();
        match inner.state {
            SequencerState::Active => {}
            SequencerState::Preempted => return Err(Status::Preempted),
            SequencerState::PermanentError => return Err(Status::Failed),
            _ => return Err(Status::Nosequencer),
        }
        if inner.appenders_in_flight >= inner.window_size {
            return Err(Status::Seqnobufs);
        }
        if inner.next_esn == Esn::MAX {
            return Err(Status::Toobig);
        }
        let esn = inner.next_esn;
        inner.next_esn = esn.next();
        inner.appenders_in_flight += 1;
        Ok(Lsn::from_parts(inner.current_epoch, esn))
    }

    /// An appender finished (success or failure). Completes a graceful
    /// draining once the last appender of the old epoch is reaped;
    /// returns true when that happened so the caller can run the deferred
    /// completion steps.
    pub fn note_appender_reaped(&self) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(inner.appenders_in_flight > 0);
        inner.appenders_in_flight = inner.appenders_in_flight.saturating_sub(1);
        if inner.appenders_in_flight == 0 {
            if let Some(drained) = inner.draining_epoch.take() {
                tracing::debug!(
                    target: "sequencer",
                    log = %self.log_id,
                    epoch = %drained,
                    "previous epoch drained, graceful reactivation complete"
                );
                return true;
            }
        }
        false
    }

    pub fn advance_last_released(&self, lsn: Lsn) -> Lsn {
        let mut inner = self.inner.lock();
        if lsn > inner.last_released {
            inner.last_released = lsn;
        }
        inner.last_released
    }

    pub fn last_released(&self) -> Lsn {
        self.inner.lock().last_released
    }

    /// Kicks off recovery of the epochs below the one just activated.
    pub fn start_recovery(self: &Arc<Self>) -> Result<(), Status> {
        let Some(parent) = self.parent.upgrade() else {
            return Err(Status::Shutdown);
        };
        metrics::RECOVERY_SCHEDULED.inc();
        parent.run_recovery(self.clone());
        Ok(())
    }

    /// The cluster-state machinery decided this node is isolated; stop
    /// pretending we can sequence.
    pub fn on_node_isolated(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SequencerState::Active || inner.state == SequencerState::Activating {
            self.set_state(&mut inner, SequencerState::Unavailable);
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SequencerState::PermanentError {
            self.set_state(&mut inner, SequencerState::Unavailable);
        }
    }
}
