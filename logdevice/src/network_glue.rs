//! Ties the sans-io Senders to the tokio transport. Every connection is
//! owned by exactly one worker: transport events are posted as requests
//! to that worker, socket state only ever changes on its thread, and
//! outgoing bytes collected from the Sender flow back to the transport.

use logd_config::Settings;
use logd_network::messages::{Address, Message};
use logd_network::tcp::{ConnectionHandle, ConnectionToken, Transport, TransportEvent};
use logd_network::{FlowGroupsUpdate, Sender, SocketType, TransportOp};
use logd_primitives::{NodeId, NodeIndex, Status};
use logd_processor::{request_with_affinity, Processor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Where inbound non-handshake messages go.
pub trait MessageDispatcher: Send + Sync {
    fn on_message(&self, worker: usize, from: Address, msg: Message, reply: &ReplySender);
}

/// Cheap handle for replying to a peer: posts a send request to the
/// worker owning the peer's socket.
#[derive(Clone)]
pub struct ReplySender {
    worker: usize,
    glue: Arc<NetworkGlue>,
}

impl ReplySender {
    pub fn send(&self, to: Address, msg: Message) {
        self.glue.send_from_worker(self.worker, to, msg);
    }

    pub fn worker(&self) -> usize {
        self.worker
    }
}

struct Route {
    worker: usize,
    peer: Address,
}

struct GlueState {
    routes: HashMap<ConnectionToken, Route>,
    handles: HashMap<ConnectionToken, ConnectionHandle>,
    peer_tokens: HashMap<(usize, Address), ConnectionToken>,
    /// Workers with an outstanding outbound connect to a node, in issue
    /// order; Connected/ConnectFailed events pop them.
    connecting: HashMap<NodeIndex, Vec<usize>>,
}

pub struct NetworkGlue {
    processor: Arc<Processor>,
    settings: Arc<Settings>,
    senders: Vec<Arc<Mutex<Sender>>>,
    transport: OnceLock<Transport>,
    dispatcher: OnceLock<Arc<dyn MessageDispatcher>>,
    state: Mutex<GlueState>,
    next_accept_worker: AtomicUsize,
}

impl NetworkGlue {
    pub fn new(
        processor: Arc<Processor>,
        settings: Arc<Settings>,
        my_node: NodeId,
        server_instance_id: u64,
        config: Arc<logd_config::ServerConfig>,
    ) -> std::io::Result<Arc<NetworkGlue>> {
        let senders = (0..processor.worker_count())
            .map(|_| {
                Arc::new(Mutex::new(Sender::new(
                    my_node,
                    server_instance_id,
                    settings.clone(),
                    config.clone(),
                )))
            })
            .collect();
        let glue = Arc::new(NetworkGlue {
            processor,
            settings,
            senders,
            transport: OnceLock::new(),
            dispatcher: OnceLock::new(),
            state: Mutex::new(GlueState {
                routes: HashMap::new(),
                handles: HashMap::new(),
                peer_tokens: HashMap::new(),
                connecting: HashMap::new(),
            }),
            next_accept_worker: AtomicUsize::new(0),
        });
        let sink_glue = Arc::downgrade(&glue);
        let transport = Transport::new(Arc::new(move |event| {
            if let Some(glue) = sink_glue.upgrade() {
                glue.on_transport_event(event);
            }
        }))?;
        glue.transport.set(transport).ok().expect("transport installed once");
        Ok(glue)
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn MessageDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn listen(&self, addr: std::net::SocketAddr) -> std::io::Result<std::net::SocketAddr> {
        self.transport.get().expect("transport exists").listen(addr)
    }

    pub fn reply_sender(self: &Arc<Self>, worker: usize) -> ReplySender {
        ReplySender { worker, glue: self.clone() }
    }

    /// Sends a message from a specific worker's Sender; lazily connects.
    pub fn send_from_worker(self: &Arc<Self>, worker: usize, to: Address, msg: Message) {
        let glue = self.clone();
        let _ = self.processor.post_to(
            worker,
            request_with_affinity(worker, move |_| {
                let sender = glue.senders[worker].clone();
                let mut sender = sender.lock();
                if let Err(status) = sender.send_message(msg, to, None, Instant::now()) {
                    if status != Status::Cbregistered {
                        tracing::debug!(target: "network", %to, %status, "send failed");
                    }
                }
                glue.flush_ops(worker, &mut sender);
            }),
        );
    }

    /// Runs `f` against the worker's Sender on that worker's thread and
    /// flushes the resulting transport ops.
    pub fn with_sender(self: &Arc<Self>, worker: usize, f: impl FnOnce(&mut Sender) + Send + 'static) {
        let glue = self.clone();
        let _ = self.processor.post_to(
            worker,
            request_with_affinity(worker, move |_| {
                let sender = glue.senders[worker].clone();
                let mut sender = sender.lock();
                f(&mut sender);
                glue.flush_ops(worker, &mut sender);
            }),
        );
    }

    /// Applies a traffic shaper deposit on every worker and runs flow
    /// groups where queued traffic became drainable.
    pub fn apply_shaping_update(self: &Arc<Self>, update: FlowGroupsUpdate) {
        for worker in 0..self.senders.len() {
            let update = update.clone();
            let yield_interval = self.settings.flow_groups_run_yield_interval;
            self.with_sender(worker, move |sender| {
                sender.apply_flow_groups_update(&update);
                if sender.take_run_requested() {
                    let deadline = Instant::now() + yield_interval;
                    sender.run_flow_groups(deadline);
                }
            });
        }
    }

    /// Drains the Sender's accumulated transport ops into the transport.
    /// Runs on the worker thread owning the Sender.
    pub fn flush_ops(self: &Arc<Self>, worker: usize, sender: &mut Sender) {
        for op in sender.take_transport_ops() {
            match op {
                TransportOp::Connect { node, addr } => {
                    self.state.lock().connecting.entry(node).or_default().push(worker);
                    self.transport.get().expect("transport exists").connect(
                        node,
                        addr,
                        self.settings.connect_timeout,
                    );
                }
                TransportOp::ConnectAfter { node, addr, delay } => {
                    self.state.lock().connecting.entry(node).or_default().push(worker);
                    self.transport.get().expect("transport exists").connect_after(
                        node,
                        addr,
                        delay,
                        self.settings.connect_timeout,
                    );
                }
                TransportOp::Send { peer, bytes } => {
                    let state = self.state.lock();
                    if let Some(token) = state.peer_tokens.get(&(worker, peer)) {
                        if let Some(handle) = state.handles.get(token) {
                            handle.send(bytes);
                        }
                    }
                }
                TransportOp::Close { peer } => {
                    let mut state = self.state.lock();
                    if let Some(token) = state.peer_tokens.remove(&(worker, peer)) {
                        state.routes.remove(&token);
                        // Dropping the handle closes the write half.
                        state.handles.remove(&token);
                    }
                }
            }
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { conn, peer_addr } => {
                let worker =
                    self.next_accept_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
                let glue = self.clone();
                let token = conn.token;
                {
                    let mut state = self.state.lock();
                    state.handles.insert(token, conn);
                }
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let mut sender = sender.lock();
                        let cid = sender.add_client(SocketType::Data);
                        let peer = Address::Client(cid);
                        {
                            let mut state = glue.state.lock();
                            state.routes.insert(token, Route { worker, peer });
                            state.peer_tokens.insert((worker, peer), token);
                        }
                        tracing::debug!(target: "network", %peer, from = %peer_addr, "accepted connection");
                        glue.flush_ops(worker, &mut sender);
                        drop(sender);
                        glue.arm_handshake_timeout(worker, peer);
                    }),
                );
            }
            TransportEvent::Connected { node, conn } => {
                let worker = {
                    let mut state = self.state.lock();
                    let Some(worker) =
                        state.connecting.get_mut(&node).and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                    else {
                        return;
                    };
                    let token = conn.token;
                    state.handles.insert(token, conn);
                    let peer = Address::Node(node);
                    state.routes.insert(token, Route { worker, peer });
                    state.peer_tokens.insert((worker, peer), token);
                    worker
                };
                let glue = self.clone();
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let mut sender = sender.lock();
                        sender.on_connected(node);
                        glue.flush_ops(worker, &mut sender);
                    }),
                );
                self.arm_handshake_timeout(worker, Address::Node(node));
            }
            TransportEvent::ConnectFailed { node } => {
                let worker = {
                    let mut state = self.state.lock();
                    match state.connecting.get_mut(&node).and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                    {
                        Some(worker) => worker,
                        None => return,
                    }
                };
                let glue = self.clone();
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let mut sender = sender.lock();
                        sender.on_connect_failed(node, Instant::now());
                        glue.flush_ops(worker, &mut sender);
                    }),
                );
            }
            TransportEvent::Received { token, data } => {
                let route = {
                    let state = self.state.lock();
                    state.routes.get(&token).map(|r| (r.worker, r.peer))
                };
                let Some((worker, peer)) = route else { return };
                let glue = self.clone();
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let received = {
                            let mut sender = sender.lock();
                            let received = sender.on_bytes_received(peer, &data, Instant::now());
                            glue.flush_ops(worker, &mut sender);
                            received
                        };
                        if received.is_empty() {
                            return;
                        }
                        let Some(dispatcher) = glue.dispatcher.get() else { return };
                        let reply = ReplySender { worker, glue: glue.clone() };
                        for message in received {
                            dispatcher.on_message(worker, message.from, message.msg, &reply);
                        }
                    }),
                );
            }
            TransportEvent::Written { token, n } => {
                let route = {
                    let state = self.state.lock();
                    state.routes.get(&token).map(|r| (r.worker, r.peer))
                };
                let Some((worker, peer)) = route else { return };
                let glue = self.clone();
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let mut sender = sender.lock();
                        sender.on_bytes_written(peer, n);
                    }),
                );
            }
            TransportEvent::Closed { token } => {
                let route = {
                    let mut state = self.state.lock();
                    state.handles.remove(&token);
                    state.routes.remove(&token).map(|r| {
                        state.peer_tokens.remove(&(r.worker, r.peer));
                        (r.worker, r.peer)
                    })
                };
                let Some((worker, peer)) = route else { return };
                let glue = self.clone();
                let _ = self.processor.post_to(
                    worker,
                    request_with_affinity(worker, move |_| {
                        let sender = glue.senders[worker].clone();
                        let mut sender = sender.lock();
                        sender.close_socket(peer, Status::PeerClosed, Instant::now());
                        glue.flush_ops(worker, &mut sender);
                    }),
                );
            }
        }
    }

    /// Closes the socket with TIMEDOUT if the HELLO/ACK exchange has not
    /// finished within the configured budget.
    fn arm_handshake_timeout(self: &Arc<Self>, worker: usize, peer: Address) {
        let glue = self.clone();
        let timeout = self.settings.handshake_timeout;
        self.processor.post_delayed(
            timeout,
            request_with_affinity(worker, move |_| {
                let sender = glue.senders[worker].clone();
                let mut sender = sender.lock();
                if sender.is_handshake_pending(peer) {
                    tracing::warn!(target: "network", %peer, "handshake timed out");
                    sender.close_socket(peer, Status::Timedout, Instant::now());
                }
                glue.flush_ops(worker, &mut sender);
            }),
        );
    }

    /// Config update: every worker walks its socket table.
    pub fn note_config_updated(self: &Arc<Self>, config: Arc<logd_config::ServerConfig>) {
        for worker in 0..self.senders.len() {
            let config = config.clone();
            self.with_sender(worker, move |sender| {
                sender.note_config_updated(config, Instant::now());
            });
        }
    }

    /// Shutdown: announce, close clients first, then server peers.
    pub fn shutdown_sockets(self: &Arc<Self>) {
        for worker in 0..self.senders.len() {
            self.with_sender(worker, |sender| {
                sender.send_shutdown_to_all();
                let now = Instant::now();
                sender.close_all_clients(Status::Shutdown, now);
                sender.close_all_servers(Status::Shutdown, now);
            });
        }
    }
}
