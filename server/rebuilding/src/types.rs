use logd_primitives::{RecordTimeInterval, ShardId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::IntoStaticStr)]
pub enum RebuildingMode {
    /// The shard's data is lost; donors restore it from their copies.
    Restore,
    /// The shard's data is intact and is being moved off (drain).
    Relocate,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AuthoritativeStatus {
    FullyAuthoritative,
    /// Some records may exist only on shards in the rebuilding set.
    Underreplication,
    /// The shard is rebuilt (or declared unrecoverable) and holds no
    /// needed data; readers may skip it.
    AuthoritativeEmpty,
    Unavailable,
}

/// Class of data a dirty time range applies to. Ranges are tracked
/// separately for regular appends and rebuilding writes because an
/// unclean shutdown can lose one without the other.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, strum::IntoStaticStr)]
pub enum DataClass {
    Append,
    Rebuild,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RebuildingNodeInfo {
    pub mode: RebuildingMode,
    /// Empty means the shard is dirty for all time points. Non-empty
    /// means a mini-rebuilding of just these ranges (always RESTORE).
    pub dc_dirty_ranges: BTreeMap<DataClass, Vec<RecordTimeInterval>>,
}

impl RebuildingNodeInfo {
    pub fn full(mode: RebuildingMode) -> RebuildingNodeInfo {
        RebuildingNodeInfo { mode, dc_dirty_ranges: BTreeMap::new() }
    }

    pub fn is_ranged(&self) -> bool {
        !self.dc_dirty_ranges.is_empty()
    }

    pub fn ranges_for(&self, dc: DataClass) -> Option<&[RecordTimeInterval]> {
        self.dc_dirty_ranges.get(&dc).map(|v| v.as_slice())
    }
}

/// The set of shards a ShardRebuilding run is rebuilding, as materialized
/// from the event-log state for one shard offset.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct RebuildingSet {
    pub shards: BTreeMap<ShardId, RebuildingNodeInfo>,
    /// Shards already AUTHORITATIVE_EMPTY; excluded as targets.
    pub empty: BTreeSet<ShardId>,
    /// Union of all dirty time intervals of ranged members; full-shard
    /// members make this irrelevant (everything is in scope).
    pub all_dirty_time_intervals: Vec<RecordTimeInterval>,
}

impl RebuildingSet {
    pub fn contains(&self, shard: ShardId) -> bool {
        self.shards.contains_key(&shard)
    }

    pub fn describe(&self) -> String {
        let mut out = String::from("{");
        for (i, (shard, info)) in self.shards.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let mode: &'static str = info.mode.into();
            let _ = write!(out, "{}:{}", shard, mode);
            if info.is_ranged() {
                let _ = write!(out, "(ranged)");
            }
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_is_compact() {
        let mut set = RebuildingSet::default();
        set.shards.insert(ShardId::new(2, 1), RebuildingNodeInfo::full(RebuildingMode::Restore));
        let mut ranged = RebuildingNodeInfo::full(RebuildingMode::Restore);
        ranged.dc_dirty_ranges.insert(
            DataClass::Append,
            vec![RecordTimeInterval::new(
                logd_primitives::RecordTimestamp(1),
                logd_primitives::RecordTimestamp(2),
            )],
        );
        set.shards.insert(ShardId::new(3, 0), ranged);
        assert_eq!(set.describe(), "{N2:S1:Restore,N3:S0:Restore(ranged)}");
    }
}
