use std::sync::atomic::{AtomicU8, Ordering};

/// What the rest of the node needs to know about a peer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::FromRepr)]
#[repr(u8)]
pub enum ClusterNodeState {
    Alive = 0,
    Dead = 1,
}

/// Lock-free liveness map consulted on hot paths (copyset selection,
/// sequencer routing). Written only by the failure detector.
pub struct ClusterState {
    nodes: Vec<AtomicU8>,
}

impl ClusterState {
    pub fn new(num_nodes: usize) -> ClusterState {
        // Nodes start dead until the bootstrap fetch or the first gossip
        // round says otherwise.
        ClusterState {
            nodes: (0..num_nodes).map(|_| AtomicU8::new(ClusterNodeState::Dead as u8)).collect(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_node_alive(&self, idx: u16) -> bool {
        self.nodes
            .get(idx as usize)
            .map(|s| s.load(Ordering::Acquire) == ClusterNodeState::Alive as u8)
            .unwrap_or(false)
    }

    pub fn set_node_state(&self, idx: u16, state: ClusterNodeState) {
        if let Some(slot) = self.nodes.get(idx as usize) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    pub fn dead_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|s| s.load(Ordering::Acquire) == ClusterNodeState::Dead as u8)
            .count()
    }
}
