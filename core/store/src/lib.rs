//! LogsDB: the local log store of a storage shard.
//!
//! The database is a time-partitioned rocksdb instance: one column family
//! per partition holding record data, one `metadata` column family holding
//! the partition directory and all store/log/per-epoch metadata, and one
//! `unpartitioned` column family holding records of metadata and internal
//! logs, which are exempt from retention.
//!
//! Records are keyed `(log_id, lsn)`, both big-endian so that rocksdb's
//! lexicographic order is the log order. The directory maps
//! `(log_id, min_lsn, partition_id)` to the maximum LSN that log has in the
//! partition; records above that bound are orphans from an interrupted
//! write and are never surfaced by iterators.

pub mod db;
pub mod iterator;
pub mod keys;
pub mod meta;
mod metrics;
pub mod partition;
pub mod record;
pub mod settings;
pub mod sharded;

pub use db::{LogsDb, RecordWrite, WriteOptions};
pub use iterator::{
    AllLogsIterator, DirectoryIterator, IteratorState, Location, LogIterator, PassThroughFilter,
    ReadFilter, ReadStats,
};
pub use meta::{
    EpochRecoveryMetadata, LastCleanMetadata, LastReleasedMetadata, LogMetadata,
    RebuildingCompleteMetadata, RebuildingRangesMetadata, SealMetadata, StoreMetadata,
    TrimMetadata,
};
pub use partition::{DirtyState, Partition, PartitionPtr};
pub use record::{record_flags, ParsedRecord};
pub use settings::LogsDbSettings;
pub use sharded::ShardedLogsDb;
