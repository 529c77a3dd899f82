//! The sequencer subsystem: per-log epoch assignment coordinated through
//! the epoch store, activation and preemption, graceful reactivation, and
//! the recovery drive for freshly activated epochs.

pub mod all_sequencers;
pub mod appender_buffer;
pub mod background_activator;
pub mod epoch_store;
pub mod fanout;
pub mod metadata_writer;
mod metrics;
pub mod recovery;
pub mod sequencer;

pub use all_sequencers::{AllSequencers, AlwaysEmptyChecker, MetadataLogChecker};
pub use appender_buffer::{AppenderBuffer, PendingAppend};
pub use background_activator::SequencerBackgroundActivator;
pub use epoch_store::{
    EpochMetaDataUpdateToNextEpoch, EpochMetaDataUpdater, EpochStore, EpochStoreCompletion,
    EpochStoreMetaProperties, InMemEpochStore,
};
pub use fanout::{InlineFanout, ProcessorFanout, WorkerFanout};
pub use metadata_writer::MetaDataLogWriter;
pub use recovery::{EpochRecovery, RecoveryTransport};
pub use sequencer::{ActivateResult, Sequencer, SequencerState};
