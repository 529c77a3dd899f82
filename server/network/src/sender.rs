//! Per-worker message sending. A Sender owns every socket of its worker:
//! server sockets keyed by node index, accepted client sockets keyed by
//! ClientId. Sockets never migrate between workers; sends targeting a
//! socket owned elsewhere go through a request to the owning worker.
//!
//! The Sender is sans-io: socket byte streams and connection lifecycle
//! events surface as [`TransportOp`]s that the tcp glue executes.

use crate::compatibility::MIN_PROTOCOL_SUPPORTED;
use crate::envelope::OnSent;
use crate::flow_group::{BwAvailableCallback, FlowAction, FlowGroup, FlowGroupsUpdate};
use crate::messages::{
    AckMessage, Address, ConfigAdvisoryMessage, ConfigChangedMessage, HelloMessage, Message,
    ShutdownMessage,
};
use crate::messages::handshake::hello_flags;
use crate::metrics;
use crate::socket::{Socket, SocketType};
use crate::throttle::ConnectionThrottle;
use bytes::Bytes;
use logd_config::{ServerConfig, Settings};
use logd_primitives::{
    ClientId, NodeId, NodeIndex, NodeLocationScope, Status, TrafficClass,
};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Action the transport glue must take on behalf of the Sender.
#[derive(Debug)]
pub enum TransportOp {
    Connect { node: NodeIndex, addr: SocketAddr },
    ConnectAfter { node: NodeIndex, addr: SocketAddr, delay: Duration },
    Send { peer: Address, bytes: Bytes },
    Close { peer: Address },
}

#[derive(Debug)]
pub struct ReceivedMessage {
    pub from: Address,
    pub msg: Message,
}

struct ServerSlot {
    socket: Socket,
    connect_attempts: usize,
}

pub struct Sender {
    my_node: NodeId,
    cluster_name: String,
    server_instance_id: u64,
    settings: Arc<Settings>,
    config: Arc<ServerConfig>,

    server_sockets: HashMap<NodeIndex, ServerSlot>,
    /// Reconnect throttles survive socket teardown.
    throttles: HashMap<NodeIndex, ConnectionThrottle>,
    client_sockets: HashMap<ClientId, Socket>,
    next_client_id: u32,

    flow_groups: Vec<FlowGroup>,
    /// Set when a flow group has queued work and budget may arrive; the
    /// worker turns this into a run_flow_groups call.
    run_requested: bool,

    ops: Vec<TransportOp>,
}

impl Sender {
    pub fn new(
        my_node: NodeId,
        server_instance_id: u64,
        settings: Arc<Settings>,
        config: Arc<ServerConfig>,
    ) -> Sender {
        let cluster_name = config.cluster_name.clone();
        Sender {
            my_node,
            cluster_name,
            server_instance_id,
            settings,
            config,
            server_sockets: HashMap::new(),
            throttles: HashMap::new(),
            client_sockets: HashMap::new(),
            next_client_id: 1,
            flow_groups: (0..NodeLocationScope::NUM)
                .map(|i| FlowGroup::new(NodeLocationScope::from_index(i).unwrap()))
                .collect(),
            run_requested: false,
            ops: Vec::new(),
        }
    }

    /// Transport actions accumulated since the last call.
    pub fn take_transport_ops(&mut self) -> Vec<TransportOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn total_bytes_pending(&self) -> usize {
        self.server_sockets.values().map(|s| s.socket.bytes_pending()).sum::<usize>()
            + self.client_sockets.values().map(|s| s.bytes_pending()).sum::<usize>()
    }

    fn socket_mut(&mut self, peer: Address) -> Option<&mut Socket> {
        match peer {
            Address::Node(idx) => self.server_sockets.get_mut(&idx).map(|s| &mut s.socket),
            Address::Client(cid) => self.client_sockets.get_mut(&cid),
        }
    }

    fn scope_of(&self, peer: Address) -> NodeLocationScope {
        match peer {
            Address::Node(idx) => self.config.peer_scope(self.my_node.index, idx),
            // Client locations are unknown; everything lands in the widest
            // scope.
            Address::Client(_) => NodeLocationScope::Root,
        }
    }

    // ---- connection lifecycle ----

    /// The glue accepted a TCP connection; creates the client socket and
    /// assigns the worker-local id under which we will know this peer.
    pub fn add_client(&mut self, sock_type: SocketType) -> ClientId {
        let cid = ClientId(self.next_client_id);
        self.next_client_id += 1;
        let socket = Socket::new_client(
            cid,
            sock_type,
            self.settings.max_protocol,
            self.settings.checksumming_enabled,
            self.settings.outbuf_overflow_kb * 1024,
        );
        self.client_sockets.insert(cid, socket);
        metrics::CONNECTIONS_ACCEPTED.inc();
        cid
    }

    fn init_server_socket(&mut self, node: NodeIndex, now: Instant) -> Result<(), Status> {
        let (peer_node_id, addr) = match self.config.node(node) {
            Some(node_cfg) => (node_cfg.node_id, node_cfg.address),
            None => return Err(Status::Notinconfig),
        };
        let initial_backoff = self.settings.connect_timeout;
        let throttle = self
            .throttles
            .entry(node)
            .or_insert_with(|| ConnectionThrottle::new(initial_backoff, Duration::from_secs(60)));
        if !throttle.may_connect(now) {
            return Err(Status::Connfailed);
        }
        let socket = Socket::new_server(
            peer_node_id,
            SocketType::Data,
            self.settings.max_protocol,
            self.settings.checksumming_enabled,
            self.settings.outbuf_overflow_kb * 1024,
        );
        self.server_sockets.insert(node, ServerSlot { socket, connect_attempts: 0 });
        self.ops.push(TransportOp::Connect { node, addr });
        Ok(())
    }

    /// TCP connect to a server peer succeeded: run the handshake.
    pub fn on_connected(&mut self, node: NodeIndex) {
        let hello = Message::Hello(HelloMessage {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: self.settings.max_protocol,
            flags: hello_flags::SOURCE_NODE
                | hello_flags::DESTINATION_NODE
                | hello_flags::CLUSTER_NAME,
            rqid: 0,
            source_node: Some(self.my_node),
            destination_node: self.config.node(node).map(|n| n.node_id),
            cluster_name: self.cluster_name.clone(),
        });
        let Some(slot) = self.server_sockets.get_mut(&node) else { return };
        slot.socket.on_connected();
        slot.connect_attempts = 0;
        match slot.socket.register_message(hello, None) {
            Ok(id) => {
                let _ = slot.socket.release_message(id);
            }
            Err((status, _)) => {
                tracing::error!(target: "network", node, %status, "failed to queue HELLO");
            }
        }
        self.flush_socket_output(Address::Node(node));
    }

    /// TCP connect failed. Retries with multiplicative backoff until the
    /// configured attempt budget runs out, then the socket closes with
    /// CONNFAILED and the reconnect throttle arms.
    pub fn on_connect_failed(&mut self, node: NodeIndex, now: Instant) {
        let max_retries = self.settings.connection_retries;
        let (give_up, delay, addr) = {
            let Some(slot) = self.server_sockets.get_mut(&node) else { return };
            slot.connect_attempts += 1;
            let give_up = slot.connect_attempts > max_retries;
            let backoff = self.settings.connect_timeout.as_secs_f64()
                * self.settings.connect_timeout_retry_multiplier.powi(slot.connect_attempts as i32);
            (give_up, Duration::from_secs_f64(backoff), self.config.node(node).map(|n| n.address))
        };
        if give_up || addr.is_none() {
            self.close_socket(Address::Node(node), Status::Connfailed, now);
            return;
        }
        self.ops.push(TransportOp::ConnectAfter { node, addr: addr.unwrap(), delay });
    }

    /// Closes a socket with a reason: every queued message completes with
    /// it, close callbacks fire exactly once, bandwidth waiters are
    /// cancelled.
    pub fn close_socket(&mut self, peer: Address, reason: Status, now: Instant) {
        let socket = match peer {
            Address::Node(idx) => self.server_sockets.remove(&idx).map(|s| s.socket),
            Address::Client(cid) => self.client_sockets.remove(&cid),
        };
        let Some(mut socket) = socket else { return };
        tracing::info!(target: "network", %peer, %reason, "closing socket");
        metrics::SOCKETS_CLOSED.with_label_values(&[reason.name()]).inc();
        let artifacts = socket.close(reason);
        for envelope in artifacts.envelopes {
            envelope.complete(reason);
        }
        for cb in artifacts.on_close {
            cb(reason);
        }
        for group in &mut self.flow_groups {
            group.cancel_peer(peer, reason);
        }
        if let Address::Node(idx) = peer {
            // Transient network errors arm the reconnect throttle; an
            // orderly shutdown or config-driven close does not.
            if matches!(reason, Status::Connfailed | Status::Timedout | Status::PeerClosed) {
                if let Some(throttle) = self.throttles.get_mut(&idx) {
                    throttle.on_failure(now);
                }
            }
        }
        self.ops.push(TransportOp::Close { peer });
    }

    pub fn close_all_clients(&mut self, reason: Status, now: Instant) {
        let clients: Vec<ClientId> = self.client_sockets.keys().copied().collect();
        for cid in clients {
            self.close_socket(Address::Client(cid), reason, now);
        }
    }

    pub fn close_all_servers(&mut self, reason: Status, now: Instant) {
        let nodes: Vec<NodeIndex> = self.server_sockets.keys().copied().collect();
        for node in nodes {
            self.close_socket(Address::Node(node), reason, now);
        }
    }

    /// Tells every handshaken peer we are going away, then the caller
    /// closes the sockets.
    pub fn send_shutdown_to_all(&mut self) {
        let shutdown = ShutdownMessage {
            status: Status::Shutdown,
            server_instance_id: self.server_instance_id,
        };
        let peers: Vec<Address> = self
            .server_sockets
            .keys()
            .map(|n| Address::Node(*n))
            .chain(self.client_sockets.keys().map(|c| Address::Client(*c)))
            .collect();
        for peer in peers {
            let msg = Message::Shutdown(shutdown.clone());
            if let Some(socket) = self.socket_mut(peer) {
                if socket.is_handshaken() {
                    if let Ok(id) = socket.register_message(msg, None) {
                        let _ = socket.release_message(id);
                    }
                }
            }
            self.flush_socket_output(peer);
        }
    }

    // ---- sending ----

    /// Sends a message. Lazily connects to server peers. Fails with:
    /// NOTINCONFIG (unknown node), NOBUFS (buffers full), PROTONOSUPPORT
    /// (peer too old; message returned unsent), CONNFAILED (reconnect
    /// throttled), SHUTDOWN.
    pub fn send_message(
        &mut self,
        msg: Message,
        peer: Address,
        on_sent: Option<OnSent>,
        now: Instant,
    ) -> Result<(), Status> {
        if let Address::Node(idx) = peer {
            if !self.server_sockets.contains_key(&idx) {
                self.init_server_socket(idx, now)?;
            }
        }

        // Worker-wide byte bound across all sockets.
        if !msg.is_handshake()
            && self.total_bytes_pending() > self.settings.outbufs_mb_max_per_thread * 1024 * 1024
        {
            metrics::SEND_NOBUFS.inc();
            return Err(Status::Nobufs);
        }

        self.maybe_notify_peer_config(peer);

        let scope = self.scope_of(peer);
        let socket = self.socket_mut(peer).ok_or(Status::Notconn)?;
        // On failure the message is handed back by the socket; callers of
        // the worker-level API get the status and may resend elsewhere.
        let id = socket.register_message(msg, on_sent).map_err(|(status, _msg)| status)?;

        // Flow-control admission: drain now or park in the group's queue
        // until the shaper deposits budget. Field-level borrows: the
        // group and the socket maps are disjoint.
        let group = &mut self.flow_groups[scope.index()];
        let socket_ref = match peer {
            Address::Node(idx) => &self.server_sockets.get(&idx).expect("registered above").socket,
            Address::Client(cid) => self.client_sockets.get(&cid).expect("registered above"),
        };
        let envelope = socket_ref.pending_envelope(id).expect("registered above");
        let admitted = if group.drain(envelope) {
            true
        } else {
            group.push(peer, envelope);
            false
        };
        if admitted {
            let socket = self.socket_mut(peer).expect("socket just used");
            socket.release_message(id)?;
            self.flush_socket_output(peer);
        } else {
            self.run_requested = true;
        }
        Ok(())
    }

    /// Whether a send at this traffic class would currently be admitted.
    /// When it would not, the callback registers for a bandwidth grant and
    /// CBREGISTERED comes back synchronously.
    pub fn can_send_to(
        &mut self,
        peer: Address,
        tc: TrafficClass,
        on_bw_avail: BwAvailableCallback,
    ) -> Result<bool, Status> {
        let scope = self.scope_of(peer);
        let priority = tc.priority();
        let group = &mut self.flow_groups[scope.index()];
        if group.can_drain(priority) {
            return Ok(true);
        }
        group.push_callback(on_bw_avail, priority);
        self.run_requested = true;
        Err(Status::Cbregistered)
    }

    fn flush_socket_output(&mut self, peer: Address) {
        if let Some(socket) = self.socket_mut(peer) {
            if let Some(bytes) = socket.take_output() {
                self.ops.push(TransportOp::Send { peer, bytes });
            }
        }
    }

    /// Compares the peer's confirmed config version with ours and nudges
    /// stale peers, at most once per config version per socket.
    fn maybe_notify_peer_config(&mut self, peer: Address) {
        let version = self.config.version;
        let cluster_name = self.cluster_name.clone();
        let Some(socket) = self.socket_mut(peer) else { return };
        if !socket.is_handshaken() {
            return;
        }
        if socket.peer_config_version >= version || socket.advisory_sent_version >= version {
            return;
        }
        socket.advisory_sent_version = version;
        let msg = if peer.is_client() {
            Message::ConfigChanged(ConfigChangedMessage { config_version: version, cluster_name })
        } else {
            Message::ConfigAdvisory(ConfigAdvisoryMessage { config_version: version })
        };
        if let Ok(id) = socket.register_message(msg, None) {
            let _ = socket.release_message(id);
        }
    }

    // ---- receive path ----

    /// Feeds received bytes into the owning socket. Handshake and
    /// connection-maintenance messages are consumed here; everything else
    /// is returned for dispatch.
    pub fn on_bytes_received(
        &mut self,
        peer: Address,
        data: &[u8],
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        let Some(socket) = self.socket_mut(peer) else { return Vec::new() };
        let parsed = match socket.receive_bytes(data) {
            Ok(parsed) => parsed,
            Err(status) => {
                self.close_socket(peer, status, now);
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for msg in parsed {
            match msg {
                Message::Hello(hello) => self.on_hello(peer, hello, now),
                Message::Ack(ack) => self.on_ack(peer, ack, now),
                Message::Shutdown(shutdown) => {
                    tracing::info!(
                        target: "network",
                        %peer,
                        instance = shutdown.server_instance_id,
                        "peer is shutting down"
                    );
                    if let Some(socket) = self.socket_mut(peer) {
                        socket.peer_shutting_down = true;
                    }
                    self.close_socket(peer, Status::Shutdown, now);
                }
                Message::ConfigAdvisory(advisory) => {
                    if let Some(socket) = self.socket_mut(peer) {
                        socket.peer_config_version =
                            socket.peer_config_version.max(advisory.config_version);
                    }
                    out.push(ReceivedMessage { from: peer, msg: Message::ConfigAdvisory(advisory) });
                }
                other => out.push(ReceivedMessage { from: peer, msg: other }),
            }
        }
        out
    }

    fn on_hello(&mut self, peer: Address, hello: HelloMessage, now: Instant) {
        let my_max = self.settings.max_protocol;
        let my_node = self.my_node;
        let cluster_name = self.cluster_name.clone();

        let status = if hello.proto_min > my_max || hello.proto_max < MIN_PROTOCOL_SUPPORTED {
            Status::Protonosupport
        } else if hello.flags & hello_flags::CLUSTER_NAME != 0
            && hello.cluster_name != cluster_name
        {
            Status::InvalidCluster
        } else if hello.flags & hello_flags::DESTINATION_NODE != 0
            && hello.destination_node.map(|n| n.index) != Some(my_node.index)
        {
            Status::DestinationMismatch
        } else {
            Status::Ok
        };
        let proto = my_max.min(hello.proto_max);

        let Address::Client(cid) = peer else {
            // HELLO on a socket we initiated is a protocol violation.
            self.close_socket(peer, Status::Proto, now);
            return;
        };
        let Some(socket) = self.client_sockets.get_mut(&cid) else { return };
        if hello.flags & hello_flags::SOURCE_NODE != 0 {
            socket.peer_node = hello.source_node;
        }
        let ack = Message::Ack(AckMessage {
            options: 0,
            rqid: hello.rqid,
            client_id: cid,
            proto,
            status,
        });
        if let Ok(id) = socket.register_message(ack, None) {
            let _ = socket.release_message(id);
        }
        if status == Status::Ok {
            socket.complete_handshake(proto, ClientId::INVALID);
            metrics::HANDSHAKES_COMPLETED.inc();
            tracing::debug!(target: "network", %peer, proto, "handshake completed (passive)");
            self.flush_socket_output(peer);
        } else {
            tracing::warn!(target: "network", %peer, %status, "rejecting handshake");
            self.flush_socket_output(peer);
            self.close_socket(peer, status, now);
        }
    }

    fn on_ack(&mut self, peer: Address, ack: AckMessage, now: Instant) {
        let Address::Node(idx) = peer else {
            self.close_socket(peer, Status::Proto, now);
            return;
        };
        if ack.status != Status::Ok {
            tracing::warn!(target: "network", %peer, status = %ack.status, "handshake rejected by peer");
            self.close_socket(peer, ack.status, now);
            return;
        }
        if let Some(slot) = self.server_sockets.get_mut(&idx) {
            slot.socket.complete_handshake(ack.proto, ack.client_id);
            metrics::HANDSHAKES_COMPLETED.inc();
            tracing::debug!(target: "network", %peer, proto = ack.proto, "handshake completed (active)");
        }
        if let Some(throttle) = self.throttles.get_mut(&idx) {
            throttle.on_success();
        }
        self.flush_socket_output(peer);
    }

    /// The transport flushed `n` bytes of this socket's stream.
    pub fn on_bytes_written(&mut self, peer: Address, n: usize) {
        if let Some(socket) = self.socket_mut(peer) {
            socket.on_bytes_written(n);
        }
    }

    /// Whether the peer's socket exists but has not finished its
    /// handshake; drives the handshake timeout.
    pub fn is_handshake_pending(&mut self, peer: Address) -> bool {
        self.socket_mut(peer).map(|s| !s.is_handshaken()).unwrap_or(false)
    }

    // ---- flow groups ----

    pub fn configure_shaping(&mut self, enabled: impl Fn(NodeLocationScope) -> bool) {
        for group in &mut self.flow_groups {
            let scope = group.scope();
            group.set_enabled(enabled(scope));
        }
    }

    /// Deposits one traffic shaper update. Returns true when a
    /// run_flow_groups pass should be scheduled.
    pub fn apply_flow_groups_update(&mut self, update: &FlowGroupsUpdate) -> bool {
        let mut run = false;
        for (i, entry) in update.entries.iter().enumerate() {
            if let Some(group) = self.flow_groups.get_mut(i) {
                run |= group.apply_update(entry);
            }
        }
        self.run_requested |= run;
        run
    }

    pub fn take_run_requested(&mut self) -> bool {
        std::mem::take(&mut self.run_requested)
    }

    /// Drains deferred traffic while budget lasts. Scope order is
    /// shuffled so every group gets a chance even when one hogs the
    /// deadline. Returns true when the deadline was exceeded and the
    /// caller should yield to the event loop and reschedule.
    pub fn run_flow_groups(&mut self, deadline: Instant) -> bool {
        let start = Instant::now();
        let mut order: Vec<usize> = (0..self.flow_groups.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        let mut exceeded = false;
        for idx in order {
            let (actions, hit_deadline) = self.flow_groups[idx].run(deadline);
            for action in actions {
                match action {
                    FlowAction::Release { peer, envelope_id } => {
                        if let Some(socket) = self.socket_mut(peer) {
                            let _ = socket.release_message(envelope_id);
                        }
                        self.flush_socket_output(peer);
                    }
                    FlowAction::Notify(cb) => (cb.callback)(Ok(())),
                }
            }
            if hit_deadline {
                exceeded = true;
                break;
            }
        }
        metrics::FLOW_GROUPS_RUN_TIME.observe(start.elapsed().as_secs_f64());
        if exceeded {
            metrics::FLOW_GROUPS_DEADLINE_EXCEEDED.inc();
            self.run_requested = true;
        }
        exceeded
    }

    // ---- config updates ----

    /// Applies a new server config: sockets of nodes that were removed,
    /// changed address or bumped generation close with NOTINCONFIG.
    pub fn note_config_updated(&mut self, new_config: Arc<ServerConfig>, now: Instant) {
        let mut to_close: Vec<NodeIndex> = Vec::new();
        for (idx, slot) in &self.server_sockets {
            match new_config.node(*idx) {
                None => to_close.push(*idx),
                Some(node_cfg) => {
                    let generation_changed = slot
                        .socket
                        .peer_node
                        .map(|n| n.generation != node_cfg.node_id.generation)
                        .unwrap_or(false);
                    let address_changed = self
                        .config
                        .node(*idx)
                        .map(|old| old.address != node_cfg.address)
                        .unwrap_or(false);
                    if generation_changed || address_changed {
                        to_close.push(*idx);
                    }
                }
            }
        }
        self.config = new_config;
        for idx in to_close {
            self.close_socket(Address::Node(idx), Status::Notinconfig, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logd_config::{NodeConfig, ServerConfig};
    use logd_primitives::Epoch;
    use std::collections::BTreeMap;

    fn test_config(version: u64) -> Arc<ServerConfig> {
        let mut nodes = BTreeMap::new();
        for idx in 0..3u16 {
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
        Arc::new(ServerConfig {
            cluster_name: "test".to_owned(),
            version,
            nodes,
            metadata_nodes: vec![0, 1],
            sequencers_provision_epoch_store: true,
        })
    }

    fn test_sender(node: u16) -> Sender {
        Sender::new(
            NodeId::new(node, 1),
            1000 + node as u64,
            Arc::new(Settings::test()),
            test_config(1),
        )
    }

    fn trim_msg(rqid: u64) -> Message {
        Message::Trim(crate::messages::TrimMessage {
            rqid,
            log: logd_primitives::LogId(1),
            trim_point: logd_primitives::Lsn::from_parts(Epoch(1), logd_primitives::Esn(1)),
            shard: 0,
        })
    }

    /// Drives the ops of one sender into the other until both are idle,
    /// simulating the transport. Returns messages delivered to each side.
    fn pump(
        a: &mut Sender,
        b: &mut Sender,
        a_client_at_b: &mut Option<ClientId>,
    ) -> (Vec<ReceivedMessage>, Vec<ReceivedMessage>) {
        let now = Instant::now();
        let mut at_a = Vec::new();
        let mut at_b = Vec::new();
        loop {
            let mut progressed = false;
            for op in a.take_transport_ops() {
                progressed = true;
                match op {
                    TransportOp::Connect { node, .. } => {
                        assert_eq!(node, 1);
                        let cid = b.add_client(SocketType::Data);
                        *a_client_at_b = Some(cid);
                        a.on_connected(node);
                    }
                    TransportOp::Send { peer, bytes } => {
                        a.on_bytes_written(peer, bytes.len());
                        let target = a_client_at_b.expect("connected");
                        at_b.extend(b.on_bytes_received(Address::Client(target), &bytes, now));
                    }
                    TransportOp::Close { .. } => {}
                    TransportOp::ConnectAfter { .. } => {}
                }
            }
            for op in b.take_transport_ops() {
                progressed = true;
                match op {
                    TransportOp::Send { peer, bytes } => {
                        b.on_bytes_written(peer, bytes.len());
                        at_a.extend(a.on_bytes_received(Address::Node(1), &bytes, now));
                    }
                    TransportOp::Close { .. } => {}
                    other => panic!("unexpected op from passive side: {:?}", other),
                }
            }
            if !progressed {
                break;
            }
        }
        (at_a, at_b)
    }

    #[test]
    fn end_to_end_handshake_and_message() {
        let mut a = test_sender(0);
        let mut b = test_sender(1);
        let mut cid = None;

        let now = Instant::now();
        a.send_message(trim_msg(77), Address::Node(1), None, now).unwrap();
        let (_, at_b) = pump(&mut a, &mut b, &mut cid);

        // The handshake completed and the message arrived.
        assert_eq!(at_b.len(), 1);
        assert_matches::assert_matches!(
            &at_b[0].msg,
            Message::Trim(m) if m.rqid == 77
        );
        let slot = a.server_sockets.get(&1).unwrap();
        assert!(slot.socket.is_handshaken());
        assert!(slot.socket.our_name_at_peer().is_valid());
    }

    #[test]
    fn unknown_node_is_notinconfig() {
        let mut a = test_sender(0);
        let err = a.send_message(trim_msg(1), Address::Node(9), None, Instant::now());
        assert_eq!(err.err(), Some(Status::Notinconfig));
    }

    #[test]
    fn config_advisory_sent_once_per_version() {
        let mut a = test_sender(0);
        let mut b = test_sender(1);
        let mut cid = None;
        let now = Instant::now();

        a.send_message(trim_msg(1), Address::Node(1), None, now).unwrap();
        pump(&mut a, &mut b, &mut cid);

        // Bump a's config; the next two sends should produce exactly one
        // advisory.
        a.note_config_updated(test_config(2), now);
        a.send_message(trim_msg(2), Address::Node(1), None, now).unwrap();
        a.send_message(trim_msg(3), Address::Node(1), None, now).unwrap();
        let (_, at_b) = pump(&mut a, &mut b, &mut cid);
        let advisories =
            at_b.iter().filter(|m| matches!(m.msg, Message::ConfigAdvisory(_))).count();
        assert_eq!(advisories, 1);
    }

    #[test]
    fn generation_bump_closes_socket_with_notinconfig() {
        let mut a = test_sender(0);
        let mut b = test_sender(1);
        let mut cid = None;
        let now = Instant::now();
        let closed = Arc::new(std::sync::Mutex::new(None));

        a.send_message(trim_msg(1), Address::Node(1), None, now).unwrap();
        pump(&mut a, &mut b, &mut cid);
        {
            let closed = closed.clone();
            let slot = a.server_sockets.get_mut(&1).unwrap();
            slot.socket.push_on_close_callback(Box::new(move |st| {
                *closed.lock().unwrap() = Some(st);
            }));
        }

        let mut bumped = (*test_config(3)).clone();
        bumped.nodes.get_mut(&1).unwrap().node_id = NodeId::new(1, 2);
        a.note_config_updated(Arc::new(bumped), now);

        assert!(a.server_sockets.get(&1).is_none());
        assert_eq!(*closed.lock().unwrap(), Some(Status::Notinconfig));
    }

    #[test]
    fn worker_byte_bound_rejects_with_nobufs() {
        let mut settings = Settings::test();
        settings.outbufs_mb_max_per_thread = 0; // everything over budget
        let mut a = Sender::new(NodeId::new(0, 1), 1, Arc::new(settings), test_config(1));
        let now = Instant::now();
        // First send slips through (the bound is checked before adding).
        a.send_message(trim_msg(1), Address::Node(1), None, now).unwrap();
        let err = a.send_message(trim_msg(2), Address::Node(1), None, now);
        assert_eq!(err.err(), Some(Status::Nobufs));
    }

    #[test]
    fn connect_failures_retry_then_give_up() {
        let mut a = test_sender(0);
        let now = Instant::now();
        a.send_message(trim_msg(1), Address::Node(1), None, now).unwrap();
        let _ = a.take_transport_ops();

        let retries = a.settings.connection_retries;
        let mut delays = Vec::new();
        for _ in 0..retries {
            a.on_connect_failed(1, now);
            let ops = a.take_transport_ops();
            match &ops[..] {
                [TransportOp::ConnectAfter { delay, .. }] => delays.push(*delay),
                other => panic!("expected retry, got {:?}", other),
            }
        }
        // Multiplicative backoff.
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        // Out of budget: socket closes.
        a.on_connect_failed(1, now);
        assert!(a.server_sockets.get(&1).is_none());
        // And the throttle refuses an immediate reconnect.
        let err = a.send_message(trim_msg(2), Address::Node(1), None, now);
        assert_eq!(err.err(), Some(Status::Connfailed));
    }
}
