use logd_primitives::{NodeId, NodeIndex, NodeLocationScope, ShardIndex};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Position of a node in the failure-domain hierarchy, widest domain first:
/// `region.cluster.row.rack`. Missing components are allowed at the tail.
#[derive(Clone, PartialEq, Eq, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeLocation {
    /// region, cluster, row, rack
    pub domains: Vec<String>,
}

impl NodeLocation {
    pub fn parse(s: &str) -> NodeLocation {
        NodeLocation { domains: s.split('.').map(str::to_owned).collect() }
    }

    /// The narrowest scope whose domain this node shares with `other`.
    /// Nodes with equal full locations share `Node` scope only if they are
    /// the same node, which the caller decides; this returns `Rack` at best.
    pub fn shared_scope(&self, other: &NodeLocation) -> NodeLocationScope {
        // domains[0] is the region; index 3 is the rack.
        let scopes = [
            NodeLocationScope::Region,
            NodeLocationScope::Cluster,
            NodeLocationScope::Row,
            NodeLocationScope::Rack,
        ];
        let mut shared = NodeLocationScope::Root;
        for (i, scope) in scopes.iter().enumerate() {
            match (self.domains.get(i), other.domains.get(i)) {
                (Some(a), Some(b)) if a == b => shared = *scope,
                _ => break,
            }
        }
        shared
    }
}

#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub gossip_address: Option<SocketAddr>,
    #[serde(default)]
    pub location: Option<NodeLocation>,
    /// Number of LogsDB shards on this node. Zero for sequencer-only nodes.
    pub num_shards: ShardIndex,
    /// Whether this node may run sequencers.
    #[serde(default = "default_true")]
    pub sequencer: bool,
}

fn default_true() -> bool {
    true
}

/// Static description of the cluster. Immutable once loaded; updates come
/// as whole new instances through [`crate::UpdateableConfig`].
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    pub cluster_name: String,
    /// Monotonic version of this config instance. Peers compare versions to
    /// decide who is stale.
    pub version: u64,
    pub nodes: BTreeMap<NodeIndex, NodeConfig>,
    /// Nodes whose shards store metadata logs.
    pub metadata_nodes: Vec<NodeIndex>,
    /// Whether sequencers are allowed to provision empty epoch-store
    /// entries on activation.
    #[serde(default = "default_true")]
    pub sequencers_provision_epoch_store: bool,
}

impl ServerConfig {
    pub fn node(&self, idx: NodeIndex) -> Option<&NodeConfig> {
        self.nodes.get(&idx)
    }

    pub fn max_node_index(&self) -> NodeIndex {
        self.nodes.keys().next_back().copied().unwrap_or(0)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Scope of the flow group that traffic to `peer` should be charged to,
    /// as seen from `from`. Unknown locations fall back to Root.
    pub fn peer_scope(&self, from: NodeIndex, peer: NodeIndex) -> NodeLocationScope {
        if from == peer {
            return NodeLocationScope::Node;
        }
        match (
            self.nodes.get(&from).and_then(|n| n.location.as_ref()),
            self.nodes.get(&peer).and_then(|n| n.location.as_ref()),
        ) {
            (Some(a), Some(b)) => a.shared_scope(b),
            _ => NodeLocationScope::Root,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.cluster_name.is_empty(), "cluster_name is empty");
        anyhow::ensure!(!self.nodes.is_empty(), "config has no nodes");
        for (idx, node) in &self.nodes {
            anyhow::ensure!(
                node.node_id.index == *idx,
                "node {} has mismatching node_id index {}",
                idx,
                node.node_id.index
            );
            anyhow::ensure!(node.node_id.generation >= 1, "node {} has generation 0", idx);
        }
        for meta in &self.metadata_nodes {
            anyhow::ensure!(
                self.nodes.contains_key(meta),
                "metadata node {} is not in the config",
                meta
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(idx: NodeIndex, location: &str) -> NodeConfig {
        NodeConfig {
            node_id: NodeId::new(idx, 1),
            address: format!("127.0.0.1:{}", 4440 + idx).parse().unwrap(),
            gossip_address: None,
            location: Some(NodeLocation::parse(location)),
            num_shards: 2,
            sequencer: true,
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            cluster_name: "test".to_owned(),
            version: 1,
            nodes: [(0, node(0, "rgn0.cl0.row0.rk0")), (1, node(1, "rgn0.cl0.row0.rk1")), (2, node(2, "rgn1.cl0.row0.rk0"))]
                .into_iter()
                .collect(),
            metadata_nodes: vec![0, 1],
            sequencers_provision_epoch_store: true,
        }
    }

    #[test]
    fn shared_scopes() {
        let cfg = config();
        assert_eq!(cfg.peer_scope(0, 0), NodeLocationScope::Node);
        assert_eq!(cfg.peer_scope(0, 1), NodeLocationScope::Row);
        assert_eq!(cfg.peer_scope(0, 2), NodeLocationScope::Root);
    }

    #[test]
    fn validation_catches_bad_metadata_node() {
        let mut cfg = config();
        cfg.metadata_nodes.push(9);
        assert!(cfg.validate().is_err());
        assert!(config().validate().is_ok());
    }
}
