//! Store-wide, per-log and per-epoch metadata records kept in the metadata
//! column family. Values are borsh; merge rules keep every cursor
//! monotonic so that replayed or reordered updates cannot move state
//! backwards.

use borsh::{BorshDeserialize, BorshSerialize};
use logd_primitives::{Epoch, Esn, Lsn, NodeIndex, RecordTimeInterval};

/// A record stored once per shard.
pub trait StoreMetadata: BorshSerialize + BorshDeserialize {
    const KIND: u8;
    const NAME: &'static str;
}

/// A record stored once per log. `supersedes` decides whether a new value
/// may replace the stored one; updates that do not supersede complete with
/// `UPTODATE`.
pub trait LogMetadata: BorshSerialize + BorshDeserialize {
    const KIND: u8;
    const NAME: &'static str;

    fn supersedes(&self, prev: &Self) -> bool;
}

/// Marker that the shard holds a complete copy of its data: rebuilding has
/// finished (or never was needed). Its absence on startup means the shard
/// lost data and must be rebuilt.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RebuildingCompleteMetadata;

impl StoreMetadata for RebuildingCompleteMetadata {
    const KIND: u8 = 1;
    const NAME: &'static str = "RebuildingCompleteMetadata";
}

/// Time ranges that may have lost records in an unclean shutdown, per data
/// class. Published as a mini-rebuilding on the next startup.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RebuildingRangesMetadata {
    /// Ranges dirty for normally appended records.
    pub append_ranges: Vec<RecordTimeInterval>,
    /// Ranges dirty for records written by rebuilding.
    pub rebuild_ranges: Vec<RecordTimeInterval>,
}

impl RebuildingRangesMetadata {
    pub fn is_empty(&self) -> bool {
        self.append_ranges.is_empty() && self.rebuild_ranges.is_empty()
    }

    pub fn all_ranges(&self) -> impl Iterator<Item = &RecordTimeInterval> {
        self.append_ranges.iter().chain(self.rebuild_ranges.iter())
    }
}

impl StoreMetadata for RebuildingRangesMetadata {
    const KIND: u8 = 2;
    const NAME: &'static str = "RebuildingRangesMetadata";
}

/// Version of the on-disk schema, bumped by migrations.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaVersionMetadata(pub u32);

impl StoreMetadata for SchemaVersionMetadata {
    const KIND: u8 = 0;
    const NAME: &'static str = "SchemaVersionMetadata";
}

/// Records at or below this LSN are trimmed and must not be served.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimMetadata(pub Lsn);

impl LogMetadata for TrimMetadata {
    const KIND: u8 = 0;
    const NAME: &'static str = "TrimMetadata";

    fn supersedes(&self, prev: &Self) -> bool {
        self.0 > prev.0
    }
}

/// Highest epoch this shard has promised not to accept regular STOREs for.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SealMetadata {
    pub epoch: Epoch,
    pub sealed_by: NodeIndex,
}

impl LogMetadata for SealMetadata {
    const KIND: u8 = 1;
    const NAME: &'static str = "SealMetadata";

    fn supersedes(&self, prev: &Self) -> bool {
        self.epoch > prev.epoch
    }
}

/// Highest epoch whose recovery has fully finished.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastCleanMetadata(pub Epoch);

impl LogMetadata for LastCleanMetadata {
    const KIND: u8 = 2;
    const NAME: &'static str = "LastCleanMetadata";

    fn supersedes(&self, prev: &Self) -> bool {
        self.0 > prev.0
    }
}

/// Highest LSN released for delivery on this shard.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastReleasedMetadata(pub Lsn);

impl LogMetadata for LastReleasedMetadata {
    const KIND: u8 = 3;
    const NAME: &'static str = "LastReleasedMetadata";

    fn supersedes(&self, prev: &Self) -> bool {
        self.0 > prev.0
    }
}

/// Outcome of an epoch's recovery as far as this shard is concerned,
/// queried by GET_EPOCH_RECOVERY_METADATA during purging.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct EpochRecoveryMetadata {
    /// Highest ESN known fully replicated in the epoch.
    pub last_known_good: Esn,
    /// Highest ESN of any record in the epoch.
    pub last_record: Esn,
    /// Bytes appended to the epoch, as far as recovery could tell.
    pub epoch_size: u64,
    /// Byte offset of the epoch's end within the log.
    pub epoch_end_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_rules_are_monotonic() {
        assert!(TrimMetadata(Lsn(10)).supersedes(&TrimMetadata(Lsn(9))));
        assert!(!TrimMetadata(Lsn(9)).supersedes(&TrimMetadata(Lsn(9))));
        assert!(!TrimMetadata(Lsn(8)).supersedes(&TrimMetadata(Lsn(9))));
        assert!(SealMetadata { epoch: Epoch(5), sealed_by: 1 }
            .supersedes(&SealMetadata { epoch: Epoch(4), sealed_by: 7 }));
        assert!(!LastCleanMetadata(Epoch(3)).supersedes(&LastCleanMetadata(Epoch(3))));
    }

    #[test]
    fn dirty_ranges_emptiness() {
        let mut meta = RebuildingRangesMetadata::default();
        assert!(meta.is_empty());
        meta.append_ranges.push(RecordTimeInterval::new(
            logd_primitives::RecordTimestamp(1),
            logd_primitives::RecordTimestamp(2),
        ));
        assert!(!meta.is_empty());
        assert_eq!(meta.all_ranges().count(), 1);
    }
}
