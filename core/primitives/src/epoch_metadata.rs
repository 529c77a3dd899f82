use crate::types::{Epoch, LogId, NodeId, ShardId};
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Failure domain scopes, from narrowest to widest. Replication constraints
/// and flow groups are expressed against these.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
pub enum NodeLocationScope {
    Node,
    Rack,
    Row,
    Cluster,
    Region,
    /// The whole universe. A FlowGroup at this scope matches any peer.
    Root,
}

impl NodeLocationScope {
    pub const NUM: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<NodeLocationScope> {
        use NodeLocationScope::*;
        [Node, Rack, Row, Cluster, Region, Root].get(i).copied()
    }
}

/// Replication requirement of a log: for each scope, across how many
/// distinct domains of that scope every record must be replicated. The
/// factor at the narrowest scope is the total number of copies.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Debug,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ReplicationProperty {
    /// Sorted by scope, narrowest first. Factors are non-increasing as the
    /// scope widens.
    factors: Vec<(NodeLocationScope, u8)>,
}

impl ReplicationProperty {
    pub fn new(mut factors: Vec<(NodeLocationScope, u8)>) -> Result<ReplicationProperty, String> {
        if factors.is_empty() {
            return Err("replication property must have at least one scope".to_owned());
        }
        factors.sort_by_key(|(scope, _)| *scope);
        let mut prev: Option<(NodeLocationScope, u8)> = None;
        for &(scope, factor) in &factors {
            if factor == 0 {
                return Err(format!("replication factor at scope {:?} is zero", scope));
            }
            if let Some((pscope, pfactor)) = prev {
                if pscope == scope {
                    return Err(format!("duplicate scope {:?}", scope));
                }
                if factor > pfactor {
                    return Err(format!(
                        "replication factor may not grow with scope: {:?}:{} > {:?}:{}",
                        scope, factor, pscope, pfactor
                    ));
                }
            }
            prev = Some((scope, factor));
        }
        Ok(ReplicationProperty { factors })
    }

    pub fn simple(copies: u8) -> ReplicationProperty {
        ReplicationProperty { factors: vec![(NodeLocationScope::Node, copies)] }
    }

    /// Total number of copies of every record.
    pub fn replication_factor(&self) -> u8 {
        self.factors[0].1
    }

    pub fn factor_at(&self, scope: NodeLocationScope) -> Option<u8> {
        self.factors.iter().find(|(s, _)| *s == scope).map(|(_, f)| *f)
    }

    pub fn factors(&self) -> &[(NodeLocationScope, u8)] {
        &self.factors
    }
}

impl fmt::Display for ReplicationProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (scope, factor) in &self.factors {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            let name: &'static str = (*scope).into();
            write!(f, "{}:{}", name, factor)?;
        }
        Ok(())
    }
}

pub mod epoch_metadata_flags {
    /// The log is administratively disabled; sequencers must not activate.
    pub const DISABLED: u32 = 1 << 0;
    /// This record has been written into the metadata log of the data log.
    /// Reprovisioning is only allowed once this is set.
    pub const WRITTEN_IN_METADATA_LOG: u32 = 1 << 1;
}

/// Immutable per-epoch placement policy of a log, stored in the epoch
/// store and replicated through the metadata log. The epoch store holds
/// exactly one current EpochMetaData per data log, monotonic in epoch.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Debug,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct EpochMetaData {
    /// Epoch this metadata is effective for.
    pub epoch: Epoch,
    /// First epoch this nodeset/replication combination applied to.
    pub effective_since: Epoch,
    pub nodeset: Vec<ShardId>,
    pub replication: ReplicationProperty,
    pub flags: u32,
    /// Version of the storage-set encoding this record was written with.
    pub format_version: u16,
    /// Node that last wrote this record to the epoch store.
    pub written_by: Option<NodeId>,
}

impl EpochMetaData {
    pub const CURRENT_FORMAT_VERSION: u16 = 2;

    pub fn new_for_provisioning(
        nodeset: Vec<ShardId>,
        replication: ReplicationProperty,
        written_by: NodeId,
    ) -> EpochMetaData {
        EpochMetaData {
            epoch: Epoch::MIN,
            effective_since: Epoch::MIN,
            nodeset,
            replication,
            flags: 0,
            format_version: Self::CURRENT_FORMAT_VERSION,
            written_by: Some(written_by),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.epoch.is_valid()
            && !self.nodeset.is_empty()
            && self.nodeset.len() >= self.replication.replication_factor() as usize
    }

    pub fn is_disabled(&self) -> bool {
        self.flags & epoch_metadata_flags::DISABLED != 0
    }

    pub fn written_in_metadata_log(&self) -> bool {
        self.flags & epoch_metadata_flags::WRITTEN_IN_METADATA_LOG != 0
    }

    /// Whether the nodeset fits `num_shards` shards per node and the
    /// replication factor is satisfiable. Used to cross-check metadata from
    /// the epoch store against the local view of the cluster.
    pub fn valid_with_cluster(&self, num_shards: u8, max_node_index: u16) -> bool {
        self.is_valid()
            && self
                .nodeset
                .iter()
                .all(|s| s.shard < num_shards && s.node <= max_node_index)
    }

    pub fn describe(&self, log: LogId) -> String {
        format!(
            "log {} epoch {} since {} nodeset {:?} replication {}",
            log, self.epoch, self.effective_since, self.nodeset, self.replication
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodeset(nodes: &[u16]) -> Vec<ShardId> {
        nodes.iter().map(|&n| ShardId::new(n, 0)).collect()
    }

    #[test]
    fn replication_property_validation() {
        assert!(ReplicationProperty::new(vec![]).is_err());
        assert!(ReplicationProperty::new(vec![(NodeLocationScope::Node, 0)]).is_err());
        // Factor growing with scope is rejected.
        assert!(ReplicationProperty::new(vec![
            (NodeLocationScope::Node, 2),
            (NodeLocationScope::Rack, 3),
        ])
        .is_err());
        let rp = ReplicationProperty::new(vec![
            (NodeLocationScope::Rack, 2),
            (NodeLocationScope::Node, 3),
        ])
        .unwrap();
        assert_eq!(rp.replication_factor(), 3);
        assert_eq!(rp.factor_at(NodeLocationScope::Rack), Some(2));
        assert_eq!(rp.to_string(), "Node:3,Rack:2");
    }

    #[test]
    fn metadata_validity() {
        let mut meta = EpochMetaData::new_for_provisioning(
            nodeset(&[0, 1, 2]),
            ReplicationProperty::simple(3),
            NodeId::new(0, 1),
        );
        assert!(meta.is_valid());
        assert!(meta.valid_with_cluster(1, 5));
        // Shard index outside the cluster shape.
        meta.nodeset[0] = ShardId::new(0, 4);
        assert!(!meta.valid_with_cluster(1, 5));
        // Nodeset smaller than the replication factor.
        let meta = EpochMetaData {
            nodeset: nodeset(&[0, 1]),
            ..EpochMetaData::new_for_provisioning(
                nodeset(&[0, 1]),
                ReplicationProperty::simple(3),
                NodeId::new(0, 1),
            )
        };
        assert!(!meta.is_valid());
    }
}
