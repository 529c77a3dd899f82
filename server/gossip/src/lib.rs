//! The failure detector: every node gossips heartbeat-staleness counters
//! and process instance ids; everyone folds what they hear into the same
//! liveness map. Nodes come back through a suspect period so flapping
//! processes do not immediately attract traffic.

pub mod cluster_state;
pub mod failure_detector;
mod metrics;

pub use cluster_state::{ClusterState, ClusterNodeState};
pub use failure_detector::{FailureDetector, GossipSender, NodeState};
