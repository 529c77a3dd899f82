//! The message set. Messages are a tagged sum type; the four dispatch
//! axes (serialize, deserialize, on-received, on-sent) are all keyed by
//! [`MessageType`]. Deserialization is a table lookup followed by the
//! per-type body reader.

pub mod append;
pub mod gossip;
pub mod handshake;
pub mod recovery;
pub mod store;
pub mod trim;

pub use append::{AppendMessage, AppendedMessage};
pub use gossip::{Boycott, GossipMessage};
pub use handshake::{
    AckMessage, ConfigAdvisoryMessage, ConfigChangedMessage, HelloMessage, ShutdownMessage,
};
pub use recovery::{
    CleanMessage, CleanedMessage, EpochRecoveryEntry, GetEpochRecoveryMetadataMessage,
    GetEpochRecoveryMetadataReplyMessage, SealMessage, SealedMessage, TailRecord,
};
pub use store::{store_flags, StoreHeader, StoreMessage, StoredMessage};
pub use trim::{TrimMessage, TrimmedMessage};

use crate::compatibility::{ProtocolVersion, MIN_PROTOCOL_SUPPORTED};
use crate::protocol::{ProtocolReader, ProtocolWriter};
use bytes::Bytes;
use logd_primitives::{ClientId, NodeIndex, Status, TrafficClass};

/// Peer address as seen by a worker's Sender: servers are addressed by
/// their node index, accepted clients by the per-worker ClientId.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Address {
    Node(NodeIndex),
    Client(ClientId),
}

impl Address {
    pub fn is_client(&self) -> bool {
        matches!(self, Address::Client(_))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Node(idx) => write!(f, "N{}", idx),
            Address::Client(cid) => write!(f, "{}", cid),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, strum::IntoStaticStr, strum::EnumIter)]
#[repr(u8)]
pub enum MessageType {
    Hello = b'H',
    Ack = b'A',
    ConfigAdvisory = b'v',
    ConfigChanged = b'C',
    Append = b'a',
    Appended = b'p',
    Store = b'S',
    Stored = b's',
    Seal = b'L',
    Sealed = b'Z',
    Clean = b'c',
    Cleaned = b'n',
    Trim = b't',
    Trimmed = b'T',
    Shutdown = b'D',
    GetEpochRecoveryMetadata = b'E',
    GetEpochRecoveryMetadataReply = b'e',
    Gossip = b'G',
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            b'H' => Hello,
            b'A' => Ack,
            b'v' => ConfigAdvisory,
            b'C' => ConfigChanged,
            b'a' => Append,
            b'p' => Appended,
            b'S' => Store,
            b's' => Stored,
            b'L' => Seal,
            b'Z' => Sealed,
            b'c' => Clean,
            b'n' => Cleaned,
            b't' => Trim,
            b'T' => Trimmed,
            b'D' => Shutdown,
            b'E' => GetEpochRecoveryMetadata,
            b'e' => GetEpochRecoveryMetadataReply,
            b'G' => Gossip,
            _ => return None,
        })
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, MessageType::Hello | MessageType::Ack)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Hello(HelloMessage),
    Ack(AckMessage),
    ConfigAdvisory(ConfigAdvisoryMessage),
    ConfigChanged(ConfigChangedMessage),
    Append(AppendMessage),
    Appended(AppendedMessage),
    Store(StoreMessage),
    Stored(StoredMessage),
    Seal(SealMessage),
    Sealed(SealedMessage),
    Clean(CleanMessage),
    Cleaned(CleanedMessage),
    Trim(TrimMessage),
    Trimmed(TrimmedMessage),
    Shutdown(ShutdownMessage),
    GetEpochRecoveryMetadata(GetEpochRecoveryMetadataMessage),
    GetEpochRecoveryMetadataReply(GetEpochRecoveryMetadataReplyMessage),
    Gossip(GossipMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ack(_) => MessageType::Ack,
            Message::ConfigAdvisory(_) => MessageType::ConfigAdvisory,
            Message::ConfigChanged(_) => MessageType::ConfigChanged,
            Message::Append(_) => MessageType::Append,
            Message::Appended(_) => MessageType::Appended,
            Message::Store(_) => MessageType::Store,
            Message::Stored(_) => MessageType::Stored,
            Message::Seal(_) => MessageType::Seal,
            Message::Sealed(_) => MessageType::Sealed,
            Message::Clean(_) => MessageType::Clean,
            Message::Cleaned(_) => MessageType::Cleaned,
            Message::Trim(_) => MessageType::Trim,
            Message::Trimmed(_) => MessageType::Trimmed,
            Message::Shutdown(_) => MessageType::Shutdown,
            Message::GetEpochRecoveryMetadata(_) => MessageType::GetEpochRecoveryMetadata,
            Message::GetEpochRecoveryMetadataReply(_) => MessageType::GetEpochRecoveryMetadataReply,
            Message::Gossip(_) => MessageType::Gossip,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.message_type().is_handshake()
    }

    /// Oldest protocol version able to carry this message. Sending to a
    /// peer below the floor fails with PROTONOSUPPORT and the message is
    /// returned to the caller.
    pub fn min_proto(&self) -> ProtocolVersion {
        MIN_PROTOCOL_SUPPORTED
    }

    pub fn traffic_class(&self) -> TrafficClass {
        match self {
            Message::Hello(_) | Message::Ack(_) | Message::Shutdown(_) => TrafficClass::Handshake,
            Message::ConfigAdvisory(_) | Message::ConfigChanged(_) => TrafficClass::Info,
            Message::Append(_) | Message::Appended(_) => TrafficClass::Append,
            Message::Store(m) if m.header.flags & store_flags::REBUILDING != 0 => {
                TrafficClass::Rebuild
            }
            Message::Store(m) if m.header.flags & store_flags::RECOVERY != 0 => {
                TrafficClass::Recovery
            }
            Message::Store(_) | Message::Stored(_) => TrafficClass::Append,
            Message::Seal(_)
            | Message::Sealed(_)
            | Message::Clean(_)
            | Message::Cleaned(_)
            | Message::GetEpochRecoveryMetadata(_)
            | Message::GetEpochRecoveryMetadataReply(_) => TrafficClass::Recovery,
            Message::Trim(_) | Message::Trimmed(_) => TrafficClass::Trim,
            Message::Gossip(_) => TrafficClass::FailureDetector,
        }
    }

    pub fn serialize(&self, proto: ProtocolVersion) -> Result<Bytes, Status> {
        let mut w = ProtocolWriter::new(proto);
        match self {
            Message::Hello(m) => m.serialize(&mut w),
            Message::Ack(m) => m.serialize(&mut w),
            Message::ConfigAdvisory(m) => m.serialize(&mut w),
            Message::ConfigChanged(m) => m.serialize(&mut w),
            Message::Append(m) => m.serialize(&mut w),
            Message::Appended(m) => m.serialize(&mut w),
            Message::Store(m) => m.serialize(&mut w),
            Message::Stored(m) => m.serialize(&mut w),
            Message::Seal(m) => m.serialize(&mut w),
            Message::Sealed(m) => m.serialize(&mut w),
            Message::Clean(m) => m.serialize(&mut w),
            Message::Cleaned(m) => m.serialize(&mut w),
            Message::Trim(m) => m.serialize(&mut w),
            Message::Trimmed(m) => m.serialize(&mut w),
            Message::Shutdown(m) => m.serialize(&mut w),
            Message::GetEpochRecoveryMetadata(m) => m.serialize(&mut w),
            Message::GetEpochRecoveryMetadataReply(m) => m.serialize(&mut w),
            Message::Gossip(m) => m.serialize(&mut w),
        }
        Ok(w.finish())
    }

    pub fn deserialize(
        msg_type: MessageType,
        body: Bytes,
        proto: ProtocolVersion,
    ) -> Result<Message, Status> {
        let mut r = ProtocolReader::new(body, proto);
        let msg = match msg_type {
            MessageType::Hello => Message::Hello(HelloMessage::deserialize(&mut r)?),
            MessageType::Ack => Message::Ack(AckMessage::deserialize(&mut r)?),
            MessageType::ConfigAdvisory => {
                Message::ConfigAdvisory(ConfigAdvisoryMessage::deserialize(&mut r)?)
            }
            MessageType::ConfigChanged => {
                Message::ConfigChanged(ConfigChangedMessage::deserialize(&mut r)?)
            }
            MessageType::Append => Message::Append(AppendMessage::deserialize(&mut r)?),
            MessageType::Appended => Message::Appended(AppendedMessage::deserialize(&mut r)?),
            MessageType::Store => Message::Store(StoreMessage::deserialize(&mut r)?),
            MessageType::Stored => Message::Stored(StoredMessage::deserialize(&mut r)?),
            MessageType::Seal => Message::Seal(SealMessage::deserialize(&mut r)?),
            MessageType::Sealed => Message::Sealed(SealedMessage::deserialize(&mut r)?),
            MessageType::Clean => Message::Clean(CleanMessage::deserialize(&mut r)?),
            MessageType::Cleaned => Message::Cleaned(CleanedMessage::deserialize(&mut r)?),
            MessageType::Trim => Message::Trim(TrimMessage::deserialize(&mut r)?),
            MessageType::Trimmed => Message::Trimmed(TrimmedMessage::deserialize(&mut r)?),
            MessageType::Shutdown => Message::Shutdown(ShutdownMessage::deserialize(&mut r)?),
            MessageType::GetEpochRecoveryMetadata => Message::GetEpochRecoveryMetadata(
                GetEpochRecoveryMetadataMessage::deserialize(&mut r)?,
            ),
            MessageType::GetEpochRecoveryMetadataReply => Message::GetEpochRecoveryMetadataReply(
                GetEpochRecoveryMetadataReplyMessage::deserialize(&mut r)?,
            ),
            MessageType::Gossip => Message::Gossip(GossipMessage::deserialize(&mut r)?),
        };
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::{
        MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED, OFFSET_MAP_IN_SEALED,
        TAIL_RECORD_IN_SEALED,
    };
    use logd_primitives::{Epoch, Esn, LogId, Lsn, NodeId, RecordTimestamp, ShardId};

    fn check_round_trip(msg: &Message, proto: ProtocolVersion) {
        let body = msg.serialize(proto).unwrap();
        let back = Message::deserialize(msg.message_type(), body, proto)
            .unwrap_or_else(|e| panic!("{:?} failed to deserialize at proto {}: {}", msg.message_type(), proto, e));
        assert_eq!(&back, msg, "round trip mismatch at proto {}", proto);
    }

    fn check_all_protos(msg: Message) {
        for proto in MIN_PROTOCOL_SUPPORTED..=MAX_PROTOCOL_SUPPORTED {
            check_round_trip(&msg, proto);
        }
    }

    #[test]
    fn hello_round_trip() {
        check_all_protos(Message::Hello(HelloMessage {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: MAX_PROTOCOL_SUPPORTED,
            flags: handshake::hello_flags::SOURCE_NODE | handshake::hello_flags::CLUSTER_NAME,
            rqid: 17,
            source_node: Some(NodeId::new(3, 2)),
            destination_node: None,
            cluster_name: "logdevice.test".to_owned(),
        }));
    }

    #[test]
    fn ack_round_trip() {
        check_all_protos(Message::Ack(AckMessage {
            options: 0,
            rqid: 17,
            client_id: ClientId(42),
            proto: 3,
            status: Status::Ok,
        }));
    }

    #[test]
    fn config_messages_round_trip() {
        check_all_protos(Message::ConfigAdvisory(ConfigAdvisoryMessage { config_version: 9 }));
        check_all_protos(Message::ConfigChanged(ConfigChangedMessage {
            config_version: 10,
            cluster_name: "logdevice.test".to_owned(),
        }));
    }

    #[test]
    fn append_round_trip() {
        check_all_protos(Message::Append(AppendMessage {
            rqid: 5,
            log: LogId(7),
            seen_epoch: Epoch(2),
            timeout_ms: 5000,
            flags: 0,
            payload: Bytes::from_static(b"hello log"),
        }));
        check_all_protos(Message::Appended(AppendedMessage {
            rqid: 5,
            status: Status::Ok,
            lsn: Lsn::from_parts(Epoch(2), Esn(10)),
            timestamp: RecordTimestamp(123456),
            redirect: 0,
        }));
    }

    #[test]
    fn store_round_trip() {
        let header = store::StoreHeader {
            log: LogId(7),
            epoch: Epoch(3),
            esn: Esn(100),
            timestamp: RecordTimestamp(42),
            last_known_good: Esn(99),
            wave: 2,
            flags: store_flags::CUSTOM_KEY | store_flags::OFFSET_WITHIN_EPOCH,
            nsync: 1,
            copyset_offset: 0,
            copyset: vec![ShardId::new(1, 0), ShardId::new(2, 1), ShardId::new(3, 0)],
            offset_within_epoch: 777,
            custom_key: "key".to_owned(),
        };
        check_all_protos(Message::Store(StoreMessage {
            header,
            payload: Bytes::from_static(b"record payload"),
        }));
        check_all_protos(Message::Stored(StoredMessage {
            log: LogId(7),
            epoch: Epoch(3),
            esn: Esn(100),
            wave: 2,
            status: Status::Preempted,
            redirect: 4,
            flags: 0,
            shard: 1,
        }));
    }

    #[test]
    fn store_without_optional_fields_round_trip() {
        let header = store::StoreHeader {
            log: LogId(7),
            epoch: Epoch(3),
            esn: Esn(100),
            timestamp: RecordTimestamp(42),
            last_known_good: Esn(0),
            wave: 1,
            flags: store_flags::AMEND,
            nsync: 0,
            copyset_offset: 1,
            copyset: vec![ShardId::new(1, 0)],
            offset_within_epoch: 0,
            custom_key: String::new(),
        };
        check_all_protos(Message::Store(StoreMessage { header, payload: Bytes::new() }));
    }

    #[test]
    fn recovery_messages_round_trip() {
        check_all_protos(Message::Seal(SealMessage {
            log: LogId(7),
            seal_epoch: Epoch(9),
            sequencer_epoch: Epoch(10),
            last_clean_epoch: Epoch(5),
            sealed_by: NodeId::new(2, 1),
            shard: 0,
        }));
        check_all_protos(Message::Clean(CleanMessage {
            log: LogId(7),
            epoch: Epoch(9),
            recovery_id: 8,
            shard: 0,
        }));
        check_all_protos(Message::Cleaned(CleanedMessage {
            log: LogId(7),
            epoch: Epoch(9),
            recovery_id: 8,
            shard: 0,
            status: Status::Ok,
        }));
        check_all_protos(Message::GetEpochRecoveryMetadata(GetEpochRecoveryMetadataMessage {
            log: LogId(7),
            shard: 1,
            purge_to: Epoch(9),
            start: Epoch(4),
            end: Epoch(9),
            id: 77,
        }));
        check_all_protos(Message::GetEpochRecoveryMetadataReply(
            GetEpochRecoveryMetadataReplyMessage {
                id: 77,
                log: LogId(7),
                shard: 1,
                status: Status::Ok,
                entries: vec![EpochRecoveryEntry {
                    epoch: Epoch(4),
                    status: Status::Ok,
                    last_known_good: Esn(10),
                    last_record: Esn(12),
                    epoch_size: 4096,
                }],
            },
        ));
    }

    #[test]
    fn sealed_gated_fields() {
        let sealed = SealedMessage {
            log: LogId(7),
            seal_epoch: Epoch(9),
            shard: 0,
            status: Status::Ok,
            lng_list: vec![Esn(5), Esn(6)],
            last_lsn: Lsn::from_parts(Epoch(9), Esn(6)),
            epoch_offset_map: vec![(Epoch(8), 1024), (Epoch(9), 2048)],
            tail_records: vec![TailRecord {
                lsn: Lsn::from_parts(Epoch(9), Esn(6)),
                timestamp: RecordTimestamp(5555),
            }],
        };
        // At full protocol everything survives.
        check_round_trip(&Message::Sealed(sealed.clone()), MAX_PROTOCOL_SUPPORTED);

        // Below the tail-record gate the gated fields are dropped: the
        // round trip yields the message with defaults.
        let body = Message::Sealed(sealed.clone()).serialize(TAIL_RECORD_IN_SEALED - 1).unwrap();
        let back =
            Message::deserialize(MessageType::Sealed, body, TAIL_RECORD_IN_SEALED - 1).unwrap();
        match back {
            Message::Sealed(m) => {
                assert_eq!(m.lng_list, sealed.lng_list);
                assert!(m.tail_records.is_empty());
                assert!(m.epoch_offset_map.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        // Between the two gates only the offset map is dropped.
        let body = Message::Sealed(sealed.clone()).serialize(OFFSET_MAP_IN_SEALED - 1).unwrap();
        let back =
            Message::deserialize(MessageType::Sealed, body, OFFSET_MAP_IN_SEALED - 1).unwrap();
        match back {
            Message::Sealed(m) => {
                assert_eq!(m.tail_records, sealed.tail_records);
                assert!(m.epoch_offset_map.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn trim_round_trip() {
        check_all_protos(Message::Trim(TrimMessage {
            rqid: 3,
            log: LogId(9),
            trim_point: Lsn::from_parts(Epoch(1), Esn(7)),
            shard: 2,
        }));
        check_all_protos(Message::Trimmed(TrimmedMessage {
            rqid: 3,
            status: Status::Ok,
            shard: 2,
        }));
    }

    #[test]
    fn shutdown_round_trip() {
        check_all_protos(Message::Shutdown(ShutdownMessage {
            status: Status::Shutdown,
            server_instance_id: 112233,
        }));
    }

    #[test]
    fn gossip_round_trip() {
        check_all_protos(Message::Gossip(GossipMessage {
            node: NodeId::new(1, 1),
            instance_id: 999,
            sent_time_ms: 123456789,
            flags: gossip::gossip_flags::HAS_FAILOVER_LIST,
            gossip_list: vec![0, 3, 7],
            instance_ids: vec![999, 100, 50],
            failover_list: vec![0, 0, 50],
            boycott_list: vec![Boycott { node: 2, until_ms: 55_000 }],
            msg_id: 6,
        }));
        // Without the failover flag the list stays empty on the wire.
        check_all_protos(Message::Gossip(GossipMessage {
            node: NodeId::new(1, 1),
            instance_id: 999,
            sent_time_ms: 123456789,
            flags: 0,
            gossip_list: vec![0, 3, 7],
            instance_ids: vec![999, 100, 50],
            failover_list: vec![],
            boycott_list: vec![],
            msg_id: 7,
        }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(MessageType::from_u8(0), None);
        assert_eq!(MessageType::from_u8(b'X'), None);
    }

    #[test]
    fn trailing_garbage_is_badmsg() {
        let mut body = Message::ConfigAdvisory(ConfigAdvisoryMessage { config_version: 1 })
            .serialize(MAX_PROTOCOL_SUPPORTED)
            .unwrap()
            .to_vec();
        body.push(0xff);
        let result = Message::deserialize(
            MessageType::ConfigAdvisory,
            Bytes::from(body),
            MAX_PROTOCOL_SUPPORTED,
        );
        assert_eq!(result.err(), Some(Status::Badmsg));
    }
}
