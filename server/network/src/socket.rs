//! Sans-io socket state machine. A Socket owns the three outgoing queues
//! (pending, serialize, send), the handshake state and the incoming frame
//! parser; the Sender owning it moves bytes between `take_output` /
//! `receive_bytes` and the transport glue.

use crate::compatibility::ProtocolVersion;
use crate::envelope::{Envelope, EnvelopeId, OnSent};
use crate::frame::{self, ProtocolHeader, CHECKSUM_LEN, HEADER_BASE_LEN, MAX_LEN};
use crate::messages::{Address, Message, MessageType};
use bytes::{Buf, Bytes, BytesMut};
use logd_primitives::{ClientId, NodeId, Status};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SocketType {
    Data,
    /// Gossip connections carry only failure-detector traffic and are
    /// kept out of data-path flow accounting.
    Gossip,
}

/// Everything a socket hands back on close. The owner invokes the
/// completions (each exactly once, with the close reason) and the close
/// callbacks after removing the socket from its tables.
pub struct CloseArtifacts {
    pub reason: Status,
    pub envelopes: Vec<Envelope>,
    pub on_close: Vec<Box<dyn FnOnce(Status) + Send>>,
}

enum RecvState {
    /// Waiting for `len | type`.
    Header,
    /// Waiting for the checksum word of this frame.
    Checksum { len: u32, msg_type: MessageType },
    /// Waiting for `body_len` body bytes.
    Body { msg_type: MessageType, body_len: usize, cksum: u64 },
}

pub struct Socket {
    peer: Address,
    /// Expected identity of a server peer; generation changes close the
    /// socket with NOTINCONFIG.
    pub peer_node: Option<NodeId>,
    sock_type: SocketType,

    connected: bool,
    handshaken: bool,
    close_reason: Option<Status>,
    proto: ProtocolVersion,
    checksumming_enabled: bool,
    our_name_at_peer: ClientId,
    pub peer_shutting_down: bool,

    /// Config version this peer has confirmed having, and the version we
    /// last advised it about, to avoid repeat advisories.
    pub peer_config_version: u64,
    pub advisory_sent_version: u64,

    next_envelope_id: EnvelopeId,
    pendingq: BTreeMap<EnvelopeId, Envelope>,
    serializeq: VecDeque<Envelope>,
    sendq: VecDeque<Envelope>,

    output: BytesMut,
    next_pos: u64,
    drained_pos: u64,
    bytes_pending: usize,
    outbuf_limit: usize,

    input: BytesMut,
    recv_state: RecvState,

    on_close: Vec<Box<dyn FnOnce(Status) + Send>>,
}

impl Socket {
    /// Server-initiated socket; starts connecting, sends HELLO once
    /// connected.
    pub fn new_server(
        peer_node: NodeId,
        sock_type: SocketType,
        max_protocol: ProtocolVersion,
        checksumming_enabled: bool,
        outbuf_limit: usize,
    ) -> Socket {
        Socket::new(
            Address::Node(peer_node.index),
            Some(peer_node),
            sock_type,
            max_protocol,
            checksumming_enabled,
            outbuf_limit,
            false,
        )
    }

    /// Accepted socket; already connected, expects HELLO first.
    pub fn new_client(
        client_id: ClientId,
        sock_type: SocketType,
        max_protocol: ProtocolVersion,
        checksumming_enabled: bool,
        outbuf_limit: usize,
    ) -> Socket {
        Socket::new(
            Address::Client(client_id),
            None,
            sock_type,
            max_protocol,
            checksumming_enabled,
            outbuf_limit,
            true,
        )
    }

    fn new(
        peer: Address,
        peer_node: Option<NodeId>,
        sock_type: SocketType,
        max_protocol: ProtocolVersion,
        checksumming_enabled: bool,
        outbuf_limit: usize,
        connected: bool,
    ) -> Socket {
        Socket {
            peer,
            peer_node,
            sock_type,
            connected,
            handshaken: false,
            close_reason: None,
            proto: max_protocol,
            checksumming_enabled,
            our_name_at_peer: ClientId::INVALID,
            peer_shutting_down: false,
            peer_config_version: 0,
            advisory_sent_version: 0,
            next_envelope_id: 1,
            pendingq: BTreeMap::new(),
            serializeq: VecDeque::new(),
            sendq: VecDeque::new(),
            output: BytesMut::new(),
            next_pos: 0,
            drained_pos: 0,
            bytes_pending: 0,
            outbuf_limit,
            input: BytesMut::new(),
            recv_state: RecvState::Header,
            on_close: Vec::new(),
        }
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn sock_type(&self) -> SocketType {
        self.sock_type
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn proto(&self) -> ProtocolVersion {
        self.proto
    }

    pub fn our_name_at_peer(&self) -> ClientId {
        self.our_name_at_peer
    }

    pub fn bytes_pending(&self) -> usize {
        self.bytes_pending
    }

    pub fn push_on_close_callback(&mut self, cb: Box<dyn FnOnce(Status) + Send>) {
        self.on_close.push(cb);
    }

    /// Registers a message for sending, reserving buffer space. The
    /// message stays in the pending queue until flow control releases it.
    /// Handshake messages are exempt from size limits; connections must
    /// remain establishable when buffers are full. On failure the
    /// message comes back to the caller (PROTONOSUPPORT in particular is
    /// often handled by re-routing it).
    pub fn register_message(
        &mut self,
        msg: Message,
        on_sent: Option<OnSent>,
    ) -> Result<EnvelopeId, (Status, Message)> {
        if self.close_reason.is_some() {
            return Err((Status::Notconn, msg));
        }
        if self.handshaken && msg.min_proto() > self.proto {
            return Err((Status::Protonosupport, msg));
        }
        if self.peer.is_client() && !self.handshaken && !msg.is_handshake() {
            // Nothing but an ACK may be sent to a client before its HELLO
            // is answered.
            return Err((Status::Unreachable, msg));
        }

        let body_len = match msg.serialize(self.proto) {
            Ok(body) => body.len(),
            Err(status) => return Err((status, msg)),
        };
        let cost = body_len + ProtocolHeader::bytes_needed(msg.message_type(), self.proto);
        if !msg.is_handshake() && self.bytes_pending + cost > self.outbuf_limit {
            return Err((Status::Nobufs, msg));
        }

        let id = self.next_envelope_id;
        self.next_envelope_id += 1;
        let priority = msg.traffic_class().priority();
        self.pendingq.insert(
            id,
            Envelope {
                id,
                msg,
                cost,
                priority,
                on_sent,
                enqueue_time: Instant::now(),
                drain_pos: 0,
            },
        );
        self.bytes_pending += cost;
        Ok(id)
    }

    /// An envelope sitting in the pending queue, for flow-control
    /// accounting.
    pub fn pending_envelope(&self, id: EnvelopeId) -> Option<&Envelope> {
        self.pendingq.get(&id)
    }

    /// Moves a pending envelope into the send pipeline. Flow control has
    /// admitted it.
    pub fn release_message(&mut self, id: EnvelopeId) -> Result<(), Status> {
        let Some(envelope) = self.pendingq.remove(&id) else {
            return Err(Status::Notfound);
        };
        self.send_envelope(envelope);
        Ok(())
    }

    /// Takes a pending envelope back out, returning the message to the
    /// caller (used when the caller opts to handle bandwidth waits
    /// itself).
    pub fn discard_envelope(&mut self, id: EnvelopeId) -> Option<Message> {
        let envelope = self.pendingq.remove(&id)?;
        self.bytes_pending -= envelope.cost;
        Some(envelope.msg)
    }

    fn send_envelope(&mut self, envelope: Envelope) {
        if self.handshaken || (self.connected && envelope.msg.is_handshake()) {
            self.serialize_envelope(envelope);
        } else {
            self.serializeq.push_back(envelope);
        }
    }

    fn serialize_envelope(&mut self, mut envelope: Envelope) {
        let msg_type = envelope.msg.message_type();
        let body = match envelope.msg.serialize(self.proto) {
            Ok(body) => body,
            Err(status) => {
                self.bytes_pending -= envelope.cost;
                envelope.complete(status);
                return;
            }
        };
        if body.len() > MAX_LEN {
            self.bytes_pending -= envelope.cost;
            envelope.complete(Status::Toobig);
            return;
        }
        let header_bytes = ProtocolHeader::bytes_needed(msg_type, self.proto);
        let cksum = if ProtocolHeader::needs_checksum(msg_type, self.proto)
            && self.checksumming_enabled
        {
            frame::compute_checksum(&body)
        } else {
            0
        };
        let header =
            ProtocolHeader { len: (header_bytes + body.len()) as u32, msg_type, cksum };
        header.encode(self.proto, &mut self.output);
        self.output.extend_from_slice(&body);

        // The reserved cost was computed with a possibly different proto;
        // keep accounting exact.
        let actual = header_bytes + body.len();
        self.bytes_pending = self.bytes_pending - envelope.cost + actual;
        envelope.cost = actual;
        self.next_pos += actual as u64;
        envelope.drain_pos = self.next_pos;
        self.sendq.push_back(envelope);
    }

    /// The transport established the TCP connection (server sockets
    /// only). The owner follows up with its HELLO.
    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    /// Handshake done: fix the negotiated protocol and flush everything
    /// queued behind it, in order.
    pub fn complete_handshake(&mut self, proto: ProtocolVersion, our_name: ClientId) {
        self.proto = proto;
        self.our_name_at_peer = our_name;
        self.handshaken = true;
        let queued: Vec<Envelope> = self.serializeq.drain(..).collect();
        for envelope in queued {
            if envelope.msg.min_proto() > self.proto {
                self.bytes_pending -= envelope.cost;
                envelope.complete(Status::Protonosupport);
                continue;
            }
            self.serialize_envelope(envelope);
        }
    }

    /// Serialized bytes ready for the OS, if any.
    pub fn take_output(&mut self) -> Option<Bytes> {
        if self.output.is_empty() {
            return None;
        }
        Some(self.output.split().freeze())
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// The transport wrote `n` bytes of our output stream. Completes
    /// every message fully contained in the drained prefix, in serialize
    /// order.
    pub fn on_bytes_written(&mut self, n: usize) {
        self.drained_pos += n as u64;
        while let Some(front) = self.sendq.front() {
            if front.drain_pos > self.drained_pos {
                break;
            }
            let envelope = self.sendq.pop_front().unwrap();
            self.bytes_pending -= envelope.cost;
            envelope.complete(Status::Ok);
        }
    }

    /// Feeds received bytes through the frame parser. Returns complete
    /// messages; protocol violations surface as an error and the caller
    /// closes the socket with it.
    pub fn receive_bytes(&mut self, data: &[u8]) -> Result<Vec<Message>, Status> {
        if self.close_reason.is_some() {
            return Ok(Vec::new());
        }
        self.input.extend_from_slice(data);
        let mut messages = Vec::new();
        loop {
            match self.recv_state {
                RecvState::Header => {
                    if self.input.len() < HEADER_BASE_LEN {
                        break;
                    }
                    let mut header = self.input.split_to(HEADER_BASE_LEN).freeze();
                    let (len, msg_type) = ProtocolHeader::decode_base(&mut header)?;
                    if !self.handshaken && !msg_type.is_handshake() {
                        tracing::error!(
                            target: "network",
                            peer = %self.peer,
                            msg = msg_type.name(),
                            "message before handshake"
                        );
                        return Err(Status::Proto);
                    }
                    if self.handshaken && msg_type.is_handshake() {
                        tracing::error!(target: "network", peer = %self.peer, "duplicate handshake");
                        return Err(Status::Proto);
                    }
                    let body_len = ProtocolHeader::validate_len(len, msg_type, self.proto)?;
                    if ProtocolHeader::needs_checksum(msg_type, self.proto) {
                        self.recv_state = RecvState::Checksum { len, msg_type };
                    } else {
                        self.recv_state = RecvState::Body { msg_type, body_len, cksum: 0 };
                    }
                }
                RecvState::Checksum { len, msg_type } => {
                    if self.input.len() < CHECKSUM_LEN {
                        break;
                    }
                    let cksum = self.input.split_to(CHECKSUM_LEN).freeze().get_u64_le();
                    let body_len = ProtocolHeader::validate_len(len, msg_type, self.proto)?;
                    self.recv_state = RecvState::Body { msg_type, body_len, cksum };
                }
                RecvState::Body { msg_type, body_len, cksum } => {
                    if self.input.len() < body_len {
                        break;
                    }
                    let body = self.input.split_to(body_len).freeze();
                    self.recv_state = RecvState::Header;

                    if cksum != 0 && self.checksumming_enabled {
                        let computed = frame::compute_checksum(&body);
                        if computed != cksum {
                            tracing::error!(
                                target: "network",
                                peer = %self.peer,
                                msg = msg_type.name(),
                                received = cksum,
                                computed,
                                "checksum mismatch"
                            );
                            crate::metrics::CHECKSUM_MISMATCH.inc();
                            // Clients do not understand CHECKSUM_MISMATCH.
                            return Err(Status::ChecksumMismatch.to_wire());
                        }
                    }
                    let msg = Message::deserialize(msg_type, body, self.proto)?;
                    messages.push(msg);
                }
            }
        }
        Ok(messages)
    }

    /// Tears the socket down. Completes every queued envelope with the
    /// reason (send order first, then serialize order, then registration
    /// order) and hands back the close callbacks; each fires exactly
    /// once.
    pub fn close(&mut self, reason: Status) -> CloseArtifacts {
        debug_assert!(self.close_reason.is_none(), "socket closed twice");
        self.close_reason = Some(reason);
        let mut envelopes: Vec<Envelope> = Vec::new();
        envelopes.extend(self.sendq.drain(..));
        envelopes.extend(self.serializeq.drain(..));
        let pending = std::mem::take(&mut self.pendingq);
        envelopes.extend(pending.into_values());
        for envelope in &envelopes {
            self.bytes_pending = self.bytes_pending.saturating_sub(envelope.cost);
        }
        self.output.clear();
        self.input.clear();
        CloseArtifacts { reason, envelopes, on_close: std::mem::take(&mut self.on_close) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::MAX_PROTOCOL_SUPPORTED;
    use crate::messages::{ConfigAdvisoryMessage, HelloMessage, TrimmedMessage};
    use std::sync::{Arc, Mutex};

    fn test_server_socket() -> Socket {
        Socket::new_server(NodeId::new(1, 1), SocketType::Data, MAX_PROTOCOL_SUPPORTED, true, 1 << 20)
    }

    fn advisory(version: u64) -> Message {
        Message::ConfigAdvisory(ConfigAdvisoryMessage { config_version: version })
    }

    fn hello() -> Message {
        Message::Hello(HelloMessage {
            proto_min: 2,
            proto_max: MAX_PROTOCOL_SUPPORTED,
            flags: 0,
            rqid: 1,
            source_node: None,
            destination_node: None,
            cluster_name: String::new(),
        })
    }

    #[test]
    fn messages_wait_for_handshake_and_flush_in_order() {
        let mut sock = test_server_socket();
        sock.on_connected();

        // Data messages queue behind the handshake...
        let id1 = sock.register_message(advisory(1), None).unwrap();
        let id2 = sock.register_message(advisory(2), None).unwrap();
        sock.release_message(id1).unwrap();
        sock.release_message(id2).unwrap();
        assert!(sock.take_output().is_none());

        // ...while HELLO goes straight out.
        let hid = sock.register_message(hello(), None).unwrap();
        sock.release_message(hid).unwrap();
        assert!(sock.take_output().is_some());

        sock.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(7));
        assert_eq!(sock.our_name_at_peer(), ClientId(7));

        // Both queued messages came out, in order.
        let bytes = sock.take_output().unwrap();
        let mut peer = Socket::new_client(
            ClientId(1),
            SocketType::Data,
            MAX_PROTOCOL_SUPPORTED,
            true,
            1 << 20,
        );
        peer.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId::INVALID);
        let msgs = peer.receive_bytes(&bytes).unwrap();
        match (&msgs[0], &msgs[1]) {
            (Message::ConfigAdvisory(a), Message::ConfigAdvisory(b)) => {
                assert_eq!(a.config_version, 1);
                assert_eq!(b.config_version, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn on_sent_fires_in_order_when_bytes_drain() {
        let mut sock = test_server_socket();
        sock.on_connected();
        sock.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(1));

        let order = Arc::new(Mutex::new(Vec::new()));
        for version in 1..=3u64 {
            let order = order.clone();
            let id = sock
                .register_message(
                    advisory(version),
                    Some(Box::new(move |st| {
                        assert_eq!(st, Status::Ok);
                        order.lock().unwrap().push(version);
                    })),
                )
                .unwrap();
            sock.release_message(id).unwrap();
        }
        let out = sock.take_output().unwrap();
        // Drain in two chunks; completions fire as their bytes go out.
        sock.on_bytes_written(out.len() - 1);
        assert_eq!(order.lock().unwrap().len(), 2);
        sock.on_bytes_written(1);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn per_socket_buffer_limit_is_nobufs() {
        let mut sock = Socket::new_server(NodeId::new(1, 1), SocketType::Data, MAX_PROTOCOL_SUPPORTED, true, 40);
        sock.on_connected();
        sock.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(1));
        sock.register_message(advisory(1), None).unwrap();
        let (status, returned) = sock.register_message(advisory(2), None).err().unwrap();
        assert_eq!(status, Status::Nobufs);
        // The rejected message comes back to the caller.
        assert_eq!(returned, advisory(2));
        // Handshake messages bypass the limit.
        assert!(sock.register_message(hello(), None).is_ok());
    }

    #[test]
    fn close_completes_everything_with_reason() {
        let mut sock = test_server_socket();
        sock.on_connected();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let statuses = statuses.clone();
            let id = sock
                .register_message(
                    advisory(1),
                    Some(Box::new(move |st| statuses.lock().unwrap().push(st))),
                )
                .unwrap();
            sock.release_message(id).unwrap();
        }
        let closed = Arc::new(Mutex::new(None));
        let c = closed.clone();
        sock.push_on_close_callback(Box::new(move |st| *c.lock().unwrap() = Some(st)));

        let artifacts = sock.close(Status::PeerClosed);
        for envelope in artifacts.envelopes {
            envelope.complete(artifacts.reason);
        }
        for cb in artifacts.on_close {
            cb(artifacts.reason);
        }
        assert_eq!(*statuses.lock().unwrap(), vec![Status::PeerClosed, Status::PeerClosed]);
        assert_eq!(*closed.lock().unwrap(), Some(Status::PeerClosed));
        assert_eq!(sock.bytes_pending(), 0);
    }

    #[test]
    fn frames_round_trip_between_sockets() {
        let mut a = test_server_socket();
        a.on_connected();
        a.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(1));
        let mut b = Socket::new_client(ClientId(9), SocketType::Data, MAX_PROTOCOL_SUPPORTED, true, 1 << 20);
        b.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId::INVALID);

        let id = a
            .register_message(
                Message::Trimmed(TrimmedMessage { rqid: 5, status: Status::Ok, shard: 1 }),
                None,
            )
            .unwrap();
        a.release_message(id).unwrap();
        let bytes = a.take_output().unwrap();

        // Feed byte by byte to exercise the incremental parser.
        let mut all = Vec::new();
        for chunk in bytes.chunks(1) {
            all.extend(b.receive_bytes(chunk).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_matches::assert_matches!(&all[0], Message::Trimmed(m) if m.rqid == 5);
    }

    #[test]
    fn corrupted_body_fails_with_badmsg() {
        let mut a = test_server_socket();
        a.on_connected();
        a.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(1));
        let id = a.register_message(advisory(1), None).unwrap();
        a.release_message(id).unwrap();
        let mut bytes = a.take_output().unwrap().to_vec();
        // Flip a bit in the last body byte.
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let mut b = Socket::new_client(ClientId(9), SocketType::Data, MAX_PROTOCOL_SUPPORTED, true, 1 << 20);
        b.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId::INVALID);
        // Checksum mismatch is converted to BADMSG at the wire boundary.
        assert_eq!(b.receive_bytes(&bytes).err(), Some(Status::Badmsg));
    }

    #[test]
    fn data_before_handshake_is_a_protocol_error() {
        let mut a = test_server_socket();
        a.on_connected();
        a.complete_handshake(MAX_PROTOCOL_SUPPORTED, ClientId(1));
        let id = a.register_message(advisory(1), None).unwrap();
        a.release_message(id).unwrap();
        let bytes = a.take_output().unwrap();

        // Receiver has not handshaken.
        let mut b = Socket::new_client(ClientId(9), SocketType::Data, MAX_PROTOCOL_SUPPORTED, true, 1 << 20);
        assert_eq!(b.receive_bytes(&bytes).err(), Some(Status::Proto));
    }
}
