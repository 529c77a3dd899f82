//! Decides which epochs of which logs a donor must re-read: every epoch
//! whose nodeset intersects the rebuilding set. A plan is authoritative
//! only if every epoch in scope can still meet its replication after the
//! rebuilding set is excluded.

use crate::types::RebuildingSet;
use logd_primitives::{Epoch, EpochMetaData, LogId};
use std::sync::Arc;

/// Where historical per-epoch metadata comes from: the metadata log of
/// each data log, read through whatever cache the node keeps.
pub trait HistoricalMetadataSource: Send + Sync {
    /// All metadata intervals of the log, oldest first. Each entry covers
    /// `[effective_since, next.effective_since)`; the last extends to the
    /// current epoch.
    fn historical_metadata(&self, log: LogId) -> Vec<Arc<EpochMetaData>>;
}

#[derive(Clone, Debug, Default)]
pub struct RebuildingPlan {
    /// `[since, until]` epoch ranges to read, with the metadata governing
    /// them.
    pub epochs: Vec<(Epoch, Epoch, Arc<EpochMetaData>)>,
}

impl RebuildingPlan {
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn metadata_for_epoch(&self, epoch: Epoch) -> Option<&Arc<EpochMetaData>> {
        self.epochs
            .iter()
            .find(|(since, until, _)| epoch >= *since && epoch <= *until)
            .map(|(_, _, meta)| meta)
    }
}

pub struct RebuildingPlanner;

impl RebuildingPlanner {
    /// Plans one log. Returns the plan and whether it is authoritative.
    pub fn plan_log(
        log: LogId,
        metadata: &[Arc<EpochMetaData>],
        rebuilding_set: &RebuildingSet,
    ) -> (RebuildingPlan, bool) {
        let mut plan = RebuildingPlan::default();
        let mut authoritative = true;
        for (i, meta) in metadata.iter().enumerate() {
            let since = meta.effective_since;
            let until = metadata
                .get(i + 1)
                .map(|next| Epoch(next.effective_since.0.saturating_sub(1)))
                .unwrap_or(meta.epoch);
            if until < since {
                continue;
            }
            let dirty_members =
                meta.nodeset.iter().filter(|shard| rebuilding_set.contains(**shard)).count();
            if dirty_members == 0 {
                continue;
            }
            let survivors = meta.nodeset.len() - dirty_members;
            if survivors < meta.replication.replication_factor() as usize {
                // Records of these epochs may exist only on rebuilding
                // shards; the rebuild cannot be authoritative.
                tracing::warn!(
                    target: "rebuilding",
                    %log,
                    since = %since,
                    until = %until,
                    survivors,
                    "epoch range cannot meet replication without the rebuilding set"
                );
                authoritative = false;
            }
            plan.epochs.push((since, until, meta.clone()));
        }
        (plan, authoritative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RebuildingMode, RebuildingNodeInfo};
    use logd_primitives::{NodeId, ReplicationProperty, ShardId};

    fn meta(effective_since: u32, epoch: u32, nodes: &[u16], replication: u8) -> Arc<EpochMetaData> {
        let mut m = EpochMetaData::new_for_provisioning(
            nodes.iter().map(|n| ShardId::new(*n, 0)).collect(),
            ReplicationProperty::simple(replication),
            NodeId::new(0, 1),
        );
        m.effective_since = Epoch(effective_since);
        m.epoch = Epoch(epoch);
        Arc::new(m)
    }

    fn set_with(nodes: &[u16]) -> RebuildingSet {
        let mut set = RebuildingSet::default();
        for n in nodes {
            set.shards
                .insert(ShardId::new(*n, 0), RebuildingNodeInfo::full(RebuildingMode::Restore));
        }
        set
    }

    #[test]
    fn only_intersecting_epochs_are_planned() {
        let history = vec![
            meta(1, 4, &[0, 1, 2], 2),  // epochs 1..=4
            meta(5, 9, &[3, 4, 5], 2),  // epochs 5..=9, no dirty member
        ];
        let set = set_with(&[1]);
        let (plan, authoritative) = RebuildingPlanner::plan_log(LogId(7), &history, &set);
        assert!(authoritative);
        assert_eq!(plan.epochs.len(), 1);
        assert_eq!((plan.epochs[0].0, plan.epochs[0].1), (Epoch(1), Epoch(4)));
        assert!(plan.metadata_for_epoch(Epoch(3)).is_some());
        assert!(plan.metadata_for_epoch(Epoch(6)).is_none());
    }

    #[test]
    fn unsatisfiable_replication_is_non_authoritative() {
        // Replication 3 over a nodeset of 3 with one member dirty: the
        // two survivors cannot hold every record.
        let history = vec![meta(1, 5, &[0, 1, 2], 3)];
        let set = set_with(&[2]);
        let (plan, authoritative) = RebuildingPlanner::plan_log(LogId(7), &history, &set);
        assert!(!authoritative);
        assert_eq!(plan.epochs.len(), 1);
    }

    #[test]
    fn untouched_log_yields_empty_plan() {
        let history = vec![meta(1, 5, &[0, 1, 2], 2)];
        let set = set_with(&[9]);
        let (plan, authoritative) = RebuildingPlanner::plan_log(LogId(7), &history, &set);
        assert!(plan.is_empty());
        assert!(authoritative);
    }
}
