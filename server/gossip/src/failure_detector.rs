use crate::cluster_state::{ClusterNodeState, ClusterState};
use crate::metrics;
use logd_config::{GossipSettings, UpdateableConfig};
use logd_network::messages::gossip::gossip_flags;
use logd_network::messages::GossipMessage;
use logd_primitives::{NodeId, NodeIndex, Status};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

/// How the detector sends gossips; the node assembly routes them through
/// the Sender on the failure-detector worker.
pub trait GossipSender: Send + Sync {
    fn send_gossip(&self, node: NodeIndex, msg: GossipMessage) -> Result<(), Status>;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::IntoStaticStr)]
pub enum NodeState {
    Alive,
    /// Recently back from the dead; treated as dead for placement until
    /// the suspect period passes.
    Suspect,
    Dead,
}

struct FdState {
    /// `gossip_list[i]`: intervals since anyone heard from node i.
    gossip_list: Vec<u32>,
    /// `instance_ids[i]`: newest known process instance of node i.
    instance_ids: Vec<u64>,
    /// Nonzero entries announce a graceful failover of that instance.
    failover_list: Vec<u64>,
    node_states: Vec<NodeState>,
    suspect_since: Vec<Option<Instant>>,
    last_tick: Option<Instant>,
    num_gossips_received: u64,
    next_dest: usize,
    current_msg_id: u64,
    failover: bool,
    isolated: bool,
}

/// The failure detector proper. Runs on the dedicated failure-detector
/// worker; timers tick `gossip` and the receive path feeds
/// `on_gossip_received`. Time is passed in explicitly.
pub struct FailureDetector {
    settings: Arc<GossipSettings>,
    config: Arc<UpdateableConfig>,
    my_node: NodeId,
    /// Wall clock at process start; lets peers tell this instance from
    /// its predecessors.
    instance_id: u64,
    sender: Arc<dyn GossipSender>,
    cluster_state: Arc<ClusterState>,
    isolation_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    state: Mutex<FdState>,
}

impl FailureDetector {
    pub fn new(
        settings: Arc<GossipSettings>,
        config: Arc<UpdateableConfig>,
        my_node: NodeId,
        instance_id: u64,
        sender: Arc<dyn GossipSender>,
    ) -> Arc<FailureDetector> {
        let num_nodes = config.server_config().max_node_index() as usize + 1;
        let cluster_state = Arc::new(ClusterState::new(num_nodes));
        let mut node_states = vec![NodeState::Dead; num_nodes];
        let my_idx = my_node.index as usize;
        // We start in suspect state ourselves.
        node_states[my_idx] = NodeState::Suspect;
        let mut instance_ids = vec![0u64; num_nodes];
        instance_ids[my_idx] = instance_id;
        Arc::new(FailureDetector {
            settings,
            config,
            my_node,
            instance_id,
            sender,
            cluster_state,
            isolation_callback: Mutex::new(None),
            state: Mutex::new(FdState {
                gossip_list: vec![u32::MAX; num_nodes],
                instance_ids,
                failover_list: vec![0; num_nodes],
                node_states,
                suspect_since: vec![None; num_nodes],
                last_tick: None,
                num_gossips_received: 0,
                next_dest: 0,
                current_msg_id: 0,
                failover: false,
                isolated: false,
            }),
        })
    }

    pub fn cluster_state(&self) -> Arc<ClusterState> {
        self.cluster_state.clone()
    }

    pub fn set_isolation_callback(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.isolation_callback.lock() = Some(cb);
    }

    pub fn node_state(&self, idx: NodeIndex) -> NodeState {
        self.state
            .lock()
            .node_states
            .get(idx as usize)
            .copied()
            .unwrap_or(NodeState::Dead)
    }

    /// Bootstrap result from GET_CLUSTER_STATE (or its timeout): seed the
    /// liveness map instead of assuming the whole cluster is dead.
    pub fn build_initial_state(&self, alive: &[NodeIndex], now: Instant) {
        let mut state = self.state.lock();
        for &idx in alive {
            let i = idx as usize;
            if i >= state.node_states.len() || idx == self.my_node.index {
                continue;
            }
            state.gossip_list[i] = 0;
            self.transition(&mut state, i, NodeState::Alive, now);
        }
        tracing::info!(target: "gossip", alive = alive.len(), "built initial cluster state");
    }

    /// Graceful shutdown: subsequent gossips announce our failover so
    /// peers mark us dead immediately instead of after the threshold.
    pub fn note_failing_over(&self) {
        self.state.lock().failover = true;
    }

    /// One gossip round: bump staleness, run failure detection, send our
    /// view to one peer.
    pub fn gossip(&self, now: Instant, now_wall_ms: u64) {
        let server_config = self.config.server_config();
        let my_idx = self.my_node.index as usize;
        let msg = {
            let mut state = self.state.lock();
            let n = state.gossip_list.len();

            // Bump staleness counters once per interval, never for
            // ourselves.
            let tick_due = state
                .last_tick
                .map(|last| now.duration_since(last) >= self.settings.gossip_interval)
                .unwrap_or(true);
            if tick_due {
                for i in 0..n {
                    if i != my_idx {
                        state.gossip_list[i] = state.gossip_list[i].saturating_add(1);
                    }
                }
                state.last_tick = Some(now);
            }
            state.gossip_list[my_idx] = 0;
            state.instance_ids[my_idx] = self.instance_id;
            state.failover_list[my_idx] = if state.failover { self.instance_id } else { 0 };

            // Until enough gossips arrived, the default counters would
            // declare everyone dead; only advance our own state machine.
            if state.num_gossips_received >= self.settings.min_gossips_for_stable_state as u64 {
                self.detect_failures(&mut state, now);
            } else {
                self.maybe_finish_suspect(&mut state, my_idx, now);
            }

            let Some(dest) = self.pick_destination(&mut state, &server_config) else {
                tracing::warn!(target: "gossip", "no node to send a gossip to");
                return;
            };

            state.current_msg_id += 1;
            let mut flags = 0u8;
            if state.failover_list.iter().any(|&f| f > 0) {
                flags |= gossip_flags::HAS_FAILOVER_LIST;
            }
            let msg = GossipMessage {
                node: self.my_node,
                instance_id: self.instance_id,
                sent_time_ms: now_wall_ms,
                flags,
                gossip_list: state.gossip_list.clone(),
                instance_ids: state.instance_ids.clone(),
                failover_list: if flags & gossip_flags::HAS_FAILOVER_LIST != 0 {
                    state.failover_list.clone()
                } else {
                    Vec::new()
                },
                boycott_list: Vec::new(),
                msg_id: state.current_msg_id,
            };
            (dest, msg)
        };

        metrics::GOSSIPS_SENT.inc();
        if let Err(status) = self.sender.send_gossip(msg.0, msg.1) {
            tracing::debug!(target: "gossip", dest = msg.0, %status, "failed to send gossip");
        }
    }

    /// Round-robin over the other alive-ish nodes, with a random start so
    /// a restarted cluster does not converge on one victim.
    fn pick_destination(
        &self,
        state: &mut FdState,
        server_config: &logd_config::ServerConfig,
    ) -> Option<NodeIndex> {
        let n = state.gossip_list.len();
        if state.next_dest == 0 {
            state.next_dest = rand::thread_rng().gen_range(0..n.max(1));
        }
        for _ in 0..n {
            state.next_dest = (state.next_dest + 1) % n;
            let idx = state.next_dest as NodeIndex;
            if idx != self.my_node.index && server_config.node(idx).is_some() {
                return Some(idx);
            }
        }
        None
    }

    pub fn on_gossip_received(&self, msg: GossipMessage, now: Instant, now_wall_ms: u64) {
        metrics::GOSSIPS_RECEIVED.inc();
        let skew_ms = now_wall_ms.abs_diff(msg.sent_time_ms);
        if skew_ms > self.settings.gossip_time_skew_threshold.as_millis() as u64 {
            tracing::warn!(
                target: "gossip",
                from = %msg.node,
                skew_ms,
                "dropping gossip with excessive clock skew"
            );
            metrics::GOSSIPS_REJECTED_SKEW.inc();
            return;
        }

        let my_idx = self.my_node.index as usize;
        let sender_idx = msg.node.index as usize;
        let mut state = self.state.lock();
        let n = state.gossip_list.len();
        if sender_idx >= n {
            tracing::error!(target: "gossip", from = %msg.node, "gossip from a node outside the config");
            return;
        }
        if state.instance_ids[sender_idx] > msg.instance_id {
            tracing::warn!(
                target: "gossip",
                from = %msg.node,
                received = msg.instance_id,
                known = state.instance_ids[sender_idx],
                "dropping gossip with a stale instance id"
            );
            metrics::GOSSIPS_REJECTED_INSTANCE_ID.inc();
            return;
        }

        state.num_gossips_received += 1;

        // The sender is alive by virtue of talking to us.
        state.gossip_list[sender_idx] = 0;
        state.instance_ids[sender_idx] = msg.instance_id;
        state.failover_list[sender_idx] = 0;
        if msg.flags & gossip_flags::SUSPECT_STATE_FINISHED != 0 {
            self.transition(&mut state, sender_idx, NodeState::Alive, now);
        } else {
            self.note_alive(&mut state, sender_idx, now);
        }

        let has_failover = msg.flags & gossip_flags::HAS_FAILOVER_LIST != 0;
        let count = n.min(msg.gossip_list.len()).min(msg.instance_ids.len());
        for i in 0..count {
            if i == my_idx {
                // Never let someone else's view override our own state.
                continue;
            }
            let msg_instance = msg.instance_ids[i];
            if state.instance_ids[i] > msg_instance {
                // The sender knows an older instance of node i.
                continue;
            }
            if state.instance_ids[i] < msg_instance {
                // A newer instance: adopt everything the sender knows.
                state.instance_ids[i] = msg_instance;
                state.gossip_list[i] = msg.gossip_list[i];
                state.failover_list[i] =
                    if has_failover { *msg.failover_list.get(i).unwrap_or(&0) } else { 0 };
                continue;
            }
            // Same instance: staleness merges towards the minimum,
            // failover towards the maximum.
            state.gossip_list[i] = state.gossip_list[i].min(msg.gossip_list[i]);
            if has_failover {
                state.failover_list[i] =
                    state.failover_list[i].max(*msg.failover_list.get(i).unwrap_or(&0));
            }
        }

        if state.num_gossips_received >= self.settings.min_gossips_for_stable_state as u64 {
            self.detect_failures(&mut state, now);
        }
    }

    fn detect_failures(&self, state: &mut FdState, now: Instant) {
        let my_idx = self.my_node.index as usize;
        let threshold = self.settings.gossip_failure_threshold;
        for i in 0..state.gossip_list.len() {
            if i == my_idx {
                self.maybe_finish_suspect(state, i, now);
                continue;
            }
            let failed_over =
                state.failover_list[i] != 0 && state.failover_list[i] >= state.instance_ids[i];
            if state.gossip_list[i] > threshold || failed_over {
                self.transition(state, i, NodeState::Dead, now);
            } else {
                self.note_alive(state, i, now);
            }
        }
        self.check_isolation(state);
    }

    /// Dead nodes come back through SUSPECT; the suspect period expiring
    /// promotes to ALIVE.
    fn note_alive(&self, state: &mut FdState, idx: usize, now: Instant) {
        match state.node_states[idx] {
            NodeState::Dead => self.transition(state, idx, NodeState::Suspect, now),
            NodeState::Suspect => self.maybe_finish_suspect(state, idx, now),
            NodeState::Alive => {}
        }
    }

    fn maybe_finish_suspect(&self, state: &mut FdState, idx: usize, now: Instant) {
        if state.node_states[idx] != NodeState::Suspect {
            return;
        }
        let expired = state.suspect_since[idx]
            .map(|since| now.duration_since(since) >= self.settings.suspect_duration)
            .unwrap_or(true);
        if expired {
            self.transition(state, idx, NodeState::Alive, now);
        }
    }

    fn transition(&self, state: &mut FdState, idx: usize, to: NodeState, now: Instant) {
        let from = state.node_states[idx];
        if from == to {
            return;
        }
        state.node_states[idx] = to;
        state.suspect_since[idx] = (to == NodeState::Suspect).then_some(now);
        // Suspect nodes stay dead for placement purposes.
        let exported = match to {
            NodeState::Alive => ClusterNodeState::Alive,
            NodeState::Suspect | NodeState::Dead => ClusterNodeState::Dead,
        };
        self.cluster_state.set_node_state(idx as NodeIndex, exported);
        tracing::info!(
            target: "gossip",
            node = idx,
            from = <&'static str>::from(from),
            to = <&'static str>::from(to),
            "node state transition"
        );
    }

    /// All other nodes dead means we cannot tell the cluster from a
    /// partition with us on the wrong side; sequencers must stop handing
    /// out LSNs.
    fn check_isolation(&self, state: &mut FdState) {
        let my_idx = self.my_node.index as usize;
        let everyone_else_dead = state
            .node_states
            .iter()
            .enumerate()
            .all(|(i, s)| i == my_idx || *s == NodeState::Dead);
        if everyone_else_dead && state.node_states.len() > 1 {
            if !state.isolated {
                state.isolated = true;
                metrics::NODE_ISOLATION_DETECTED.inc();
                tracing::error!(target: "gossip", "this node appears to be isolated");
                if let Some(cb) = &*self.isolation_callback.lock() {
                    cb();
                }
            }
        } else {
            state.isolated = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logd_config::{LogsConfig, NodeConfig, ServerConfig, Settings};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct CapturingSender {
        sent: StdMutex<Vec<(NodeIndex, GossipMessage)>>,
    }

    impl CapturingSender {
        fn new() -> Arc<CapturingSender> {
            Arc::new(CapturingSender { sent: StdMutex::new(Vec::new()) })
        }
    }

    impl GossipSender for CapturingSender {
        fn send_gossip(&self, node: NodeIndex, msg: GossipMessage) -> Result<(), Status> {
            self.sent.lock().unwrap().push((node, msg));
            Ok(())
        }
    }

    fn config(num_nodes: u16) -> Arc<UpdateableConfig> {
        let mut nodes = BTreeMap::new();
        for idx in 0..num_nodes {
            nodes.insert(
                idx,
                NodeConfig {
                    node_id: NodeId::new(idx, 1),
                    address: format!("127.0.0.1:{}", 4440 + idx).parse().unwrap(),
                    gossip_address: None,
                    location: None,
                    num_shards: 1,
                    sequencer: true,
                },
            );
        }
        Arc::new(UpdateableConfig::new(
            ServerConfig {
                cluster_name: "test".to_owned(),
                version: 1,
                nodes,
                metadata_nodes: vec![0],
                sequencers_provision_epoch_store: true,
            },
            LogsConfig::default(),
            Settings::test(),
        ))
    }

    fn settings() -> Arc<GossipSettings> {
        Arc::new(GossipSettings {
            gossip_interval: Duration::from_millis(100),
            gossip_failure_threshold: 3,
            suspect_duration: Duration::from_secs(1),
            min_gossips_for_stable_state: 1,
            ..GossipSettings::default()
        })
    }

    fn detector(idx: u16, sender: Arc<dyn GossipSender>) -> Arc<FailureDetector> {
        FailureDetector::new(settings(), config(3), NodeId::new(idx, 1), 1000 + idx as u64, sender)
    }

    #[test]
    fn initial_state_seeds_liveness() {
        let fd = detector(0, CapturingSender::new());
        let now = Instant::now();
        fd.build_initial_state(&[1, 2], now);
        // Fresh nodes pass through suspect; with no prior suspect start
        // they promote immediately.
        assert_eq!(fd.node_state(1), NodeState::Alive);
        assert!(fd.cluster_state().is_node_alive(1));
        assert!(!fd.cluster_state().is_node_alive(0));
    }

    #[test]
    fn peers_go_dead_after_missed_intervals_and_return_via_suspect() {
        let sender = CapturingSender::new();
        let fd = detector(0, sender.clone());
        let mut now = Instant::now();
        fd.build_initial_state(&[1, 2], now);

        // Receive one gossip so detection engages.
        fd.on_gossip_received(
            GossipMessage {
                node: NodeId::new(1, 1),
                instance_id: 1001,
                sent_time_ms: 1_000,
                flags: 0,
                gossip_list: vec![1, 0, 1],
                instance_ids: vec![1000, 1001, 1002],
                failover_list: vec![],
                boycott_list: vec![],
                msg_id: 1,
            },
            now,
            1_000,
        );
        assert_eq!(fd.node_state(1), NodeState::Alive);

        // Five silent intervals push node 2 over the threshold of 3.
        for _ in 0..5 {
            now += Duration::from_millis(150);
            fd.gossip(now, 1_000);
        }
        assert_eq!(fd.node_state(2), NodeState::Dead);
        assert!(!fd.cluster_state().is_node_alive(2));

        // Node 2 talks again: suspect first, alive after the period.
        let from_node2 = GossipMessage {
            node: NodeId::new(2, 1),
            instance_id: 1002,
            sent_time_ms: 1_000,
            flags: 0,
            gossip_list: vec![0, 0, 0],
            instance_ids: vec![1000, 1001, 1002],
            failover_list: vec![],
            boycott_list: vec![],
            msg_id: 2,
        };
        fd.on_gossip_received(from_node2.clone(), now, 1_000);
        assert_eq!(fd.node_state(2), NodeState::Suspect);
        assert!(!fd.cluster_state().is_node_alive(2));

        now += Duration::from_secs(2);
        fd.on_gossip_received(GossipMessage { msg_id: 3, ..from_node2 }, now, 1_000);
        assert_eq!(fd.node_state(2), NodeState::Alive);
        assert!(fd.cluster_state().is_node_alive(2));
    }

    #[test]
    fn stale_instance_ids_are_rejected() {
        let fd = detector(0, CapturingSender::new());
        let now = Instant::now();
        let mut msg = GossipMessage {
            node: NodeId::new(1, 1),
            instance_id: 2000,
            sent_time_ms: 1_000,
            flags: 0,
            gossip_list: vec![0, 0, 0],
            instance_ids: vec![1000, 2000, 1002],
            failover_list: vec![],
            boycott_list: vec![],
            msg_id: 1,
        };
        fd.on_gossip_received(msg.clone(), now, 1_000);
        assert_eq!(fd.node_state(1), NodeState::Suspect);

        // The same node restarts backwards in time: rejected.
        msg.instance_id = 1500;
        msg.instance_ids[1] = 1500;
        msg.msg_id = 2;
        fd.on_gossip_received(msg, now, 1_000);
        // Still the newer instance on record.
        let sent = fd.state.lock().instance_ids[1];
        assert_eq!(sent, 2000);
    }

    #[test]
    fn skewed_gossips_are_dropped() {
        let fd = detector(0, CapturingSender::new());
        let now = Instant::now();
        fd.on_gossip_received(
            GossipMessage {
                node: NodeId::new(1, 1),
                instance_id: 1001,
                sent_time_ms: 1_000_000, // far from our 1_000
                flags: 0,
                gossip_list: vec![0, 0, 0],
                instance_ids: vec![0, 1001, 0],
                failover_list: vec![],
                boycott_list: vec![],
                msg_id: 1,
            },
            now,
            1_000,
        );
        assert_eq!(fd.node_state(1), NodeState::Dead);
    }

    #[test]
    fn failover_announcement_kills_the_node_immediately() {
        let sender = CapturingSender::new();
        let fd = detector(0, sender.clone());
        let now = Instant::now();
        fd.build_initial_state(&[1, 2], now);

        fd.on_gossip_received(
            GossipMessage {
                node: NodeId::new(2, 1),
                instance_id: 1002,
                sent_time_ms: 1_000,
                flags: gossip_flags::HAS_FAILOVER_LIST,
                gossip_list: vec![0, 0, 0],
                instance_ids: vec![1000, 1001, 1002],
                // Node 1 announced failover of its current instance.
                failover_list: vec![0, 1001, 0],
                boycott_list: vec![],
                msg_id: 1,
            },
            now,
            1_000,
        );
        assert_eq!(fd.node_state(1), NodeState::Dead);
    }

    #[test]
    fn gossips_carry_our_view_and_rotate_destinations() {
        let sender = CapturingSender::new();
        let fd = detector(0, sender.clone());
        let now = Instant::now();
        fd.build_initial_state(&[1, 2], now);
        for _ in 0..4 {
            fd.gossip(now, 1_000);
        }
        let sent = sender.sent.lock().unwrap();
        assert!(!sent.is_empty());
        for (dest, msg) in sent.iter() {
            assert_ne!(*dest, 0, "never gossip to ourselves");
            assert_eq!(msg.gossip_list.len(), 3);
            assert_eq!(msg.gossip_list[0], 0, "our own entry is always fresh");
            assert_eq!(msg.instance_ids[0], 1000);
        }
        // Both peers get traffic.
        let dests: std::collections::BTreeSet<NodeIndex> =
            sent.iter().map(|(d, _)| *d).collect();
        assert_eq!(dests.len(), 2);
    }

    #[test]
    fn isolation_triggers_callback_once() {
        let sender = CapturingSender::new();
        let fd = detector(0, sender);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        fd.set_isolation_callback(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        let mut now = Instant::now();
        fd.build_initial_state(&[1, 2], now);
        // One gossip to engage detection, then silence from everyone.
        fd.on_gossip_received(
            GossipMessage {
                node: NodeId::new(1, 1),
                instance_id: 1001,
                sent_time_ms: 1_000,
                flags: 0,
                gossip_list: vec![0, 0, 0],
                instance_ids: vec![1000, 1001, 1002],
                failover_list: vec![],
                boycott_list: vec![],
                msg_id: 1,
            },
            now,
            1_000,
        );
        for _ in 0..8 {
            now += Duration::from_millis(150);
            fd.gossip(now, 1_000);
        }
        assert_eq!(fd.node_state(1), NodeState::Dead);
        assert_eq!(fd.node_state(2), NodeState::Dead);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
