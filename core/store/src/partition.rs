use borsh::{BorshDeserialize, BorshSerialize};
use logd_primitives::{PartitionId, RecordTimestamp};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Replication health of a partition.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::FromRepr)]
#[repr(u8)]
pub enum DirtyState {
    Clean = 0,
    /// Some records in this partition may be missing locally (e.g. the
    /// partition overlaps a time range being rebuilt). Iterators crossing
    /// it report possibly incomplete results.
    UnderReplicated = 1,
    /// Writes in this partition were not known durable at an unclean
    /// shutdown.
    Dirty = 2,
}

/// In-memory descriptor of one partition. The authoritative copy of the
/// timestamps lives in the metadata column family and is written in the
/// same batch as the records that move them.
pub struct Partition {
    pub id: PartitionId,
    /// Lower bound of record timestamps this partition is meant to cover.
    pub starting_timestamp: RecordTimestamp,
    /// Observed extremes of record timestamps actually stored.
    min_timestamp: AtomicU64,
    max_timestamp: AtomicU64,
    dirty: AtomicU8,
}

pub type PartitionPtr = Arc<Partition>;

impl Partition {
    pub fn new(id: PartitionId, starting_timestamp: RecordTimestamp) -> Partition {
        Partition {
            id,
            starting_timestamp,
            min_timestamp: AtomicU64::new(u64::MAX),
            max_timestamp: AtomicU64::new(0),
            dirty: AtomicU8::new(DirtyState::Clean as u8),
        }
    }

    pub fn cf_name(id: PartitionId) -> String {
        format!("partition_{}", id)
    }

    pub fn parse_cf_name(name: &str) -> Option<PartitionId> {
        name.strip_prefix("partition_")?.parse().ok()
    }

    /// Time range of records in the partition: `[min, max]`, inclusive.
    /// Empty partitions report the inverted range `[+inf, -inf]`.
    pub fn time_range(&self) -> (RecordTimestamp, RecordTimestamp) {
        (
            RecordTimestamp(self.min_timestamp.load(Ordering::Acquire)),
            RecordTimestamp(self.max_timestamp.load(Ordering::Acquire)),
        )
    }

    pub fn note_timestamp(&self, ts: RecordTimestamp) {
        self.min_timestamp.fetch_min(ts.0, Ordering::AcqRel);
        self.max_timestamp.fetch_max(ts.0, Ordering::AcqRel);
    }

    pub fn dirty_state(&self) -> DirtyState {
        DirtyState::from_repr(self.dirty.load(Ordering::Acquire)).unwrap_or(DirtyState::Clean)
    }

    pub fn set_dirty_state(&self, state: DirtyState) {
        self.dirty.store(state as u8, Ordering::Release);
    }

    pub fn to_meta(&self) -> PartitionMeta {
        let (min, max) = self.time_range();
        PartitionMeta {
            starting_timestamp: self.starting_timestamp,
            min_timestamp: min,
            max_timestamp: max,
            dirty: self.dirty_state() as u8,
        }
    }

    pub fn from_meta(id: PartitionId, meta: PartitionMeta) -> Partition {
        let p = Partition::new(id, meta.starting_timestamp);
        p.min_timestamp.store(meta.min_timestamp.0, Ordering::Release);
        p.max_timestamp.store(meta.max_timestamp.0, Ordering::Release);
        p.dirty.store(meta.dirty, Ordering::Release);
        p
    }
}

/// Persistent form of [`Partition`], stored under the partition-meta key.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartitionMeta {
    pub starting_timestamp: RecordTimestamp,
    pub min_timestamp: RecordTimestamp,
    pub max_timestamp: RecordTimestamp,
    pub dirty: u8,
}
