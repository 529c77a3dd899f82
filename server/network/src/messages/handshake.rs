use crate::protocol::{ProtocolReader, ProtocolWriter};
use logd_primitives::{ClientId, NodeId, Status};

pub mod hello_flags {
    /// Sender is a server node and includes its NodeId.
    pub const SOURCE_NODE: u16 = 1 << 0;
    /// Sender names the node it believes it is connecting to, letting the
    /// receiver reject misrouted connections with DESTINATION_MISMATCH.
    pub const DESTINATION_NODE: u16 = 1 << 1;
    /// Cluster name is included and must match.
    pub const CLUSTER_NAME: u16 = 1 << 2;
}

/// First message on every connection, sent by the initiating side.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HelloMessage {
    pub proto_min: u16,
    pub proto_max: u16,
    pub flags: u16,
    pub rqid: u64,
    pub source_node: Option<NodeId>,
    pub destination_node: Option<NodeId>,
    pub cluster_name: String,
}

impl HelloMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u16(self.proto_min);
        w.write_u16(self.proto_max);
        w.write_u16(self.flags);
        w.write_u64(self.rqid);
        if self.flags & hello_flags::SOURCE_NODE != 0 {
            w.write_node_id(self.source_node.unwrap_or(NodeId::new(0, 0)));
        }
        if self.flags & hello_flags::DESTINATION_NODE != 0 {
            w.write_node_id(self.destination_node.unwrap_or(NodeId::new(0, 0)));
        }
        if self.flags & hello_flags::CLUSTER_NAME != 0 {
            w.write_str(&self.cluster_name);
        }
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<HelloMessage, Status> {
        let proto_min = r.read_u16()?;
        let proto_max = r.read_u16()?;
        let flags = r.read_u16()?;
        let rqid = r.read_u64()?;
        let source_node =
            if flags & hello_flags::SOURCE_NODE != 0 { Some(r.read_node_id()?) } else { None };
        let destination_node =
            if flags & hello_flags::DESTINATION_NODE != 0 { Some(r.read_node_id()?) } else { None };
        let cluster_name =
            if flags & hello_flags::CLUSTER_NAME != 0 { r.read_str()? } else { String::new() };
        Ok(HelloMessage {
            proto_min,
            proto_max,
            flags,
            rqid,
            source_node,
            destination_node,
            cluster_name,
        })
    }
}

/// Handshake reply. Carries the negotiated protocol version and the
/// ClientId under which the server will know this connection.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AckMessage {
    pub options: u8,
    pub rqid: u64,
    pub client_id: ClientId,
    pub proto: u16,
    pub status: Status,
}

impl AckMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u8(self.options);
        w.write_u64(self.rqid);
        w.write_u32(self.client_id.0);
        w.write_u16(self.proto);
        w.write_status(self.status);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<AckMessage, Status> {
        Ok(AckMessage {
            options: r.read_u8()?,
            rqid: r.read_u64()?,
            client_id: ClientId(r.read_u32()?),
            proto: r.read_u16()?,
            status: r.read_status()?,
        })
    }
}

/// Sent to a server peer believed to hold a stale config.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfigAdvisoryMessage {
    pub config_version: u64,
}

impl ConfigAdvisoryMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.config_version);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<ConfigAdvisoryMessage, Status> {
        Ok(ConfigAdvisoryMessage { config_version: r.read_u64()? })
    }
}

/// Sent to a client peer believed to hold a stale config; clients refetch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfigChangedMessage {
    pub config_version: u64,
    pub cluster_name: String,
}

impl ConfigChangedMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.config_version);
        w.write_str(&self.cluster_name);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<ConfigChangedMessage, Status> {
        Ok(ConfigChangedMessage { config_version: r.read_u64()?, cluster_name: r.read_str()? })
    }
}

/// Peer-initiated close. The instance id lets the receiver distinguish a
/// graceful restart from a crash when the peer comes back.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ShutdownMessage {
    pub status: Status,
    pub server_instance_id: u64,
}

impl ShutdownMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_status(self.status);
        w.write_u64(self.server_instance_id);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<ShutdownMessage, Status> {
        Ok(ShutdownMessage { status: r.read_status()?, server_instance_id: r.read_u64()? })
    }
}
