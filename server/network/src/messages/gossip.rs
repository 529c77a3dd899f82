use crate::protocol::{ProtocolReader, ProtocolWriter};
use logd_primitives::{NodeId, NodeIndex, Status};

pub mod gossip_flags {
    /// The failover list is included.
    pub const HAS_FAILOVER_LIST: u8 = 1 << 0;
    /// Sender just started and wants to be noticed quickly.
    pub const NODE_BRINGUP: u8 = 1 << 1;
    /// Sender finished its suspect period and is fully alive.
    pub const SUSPECT_STATE_FINISHED: u8 = 1 << 2;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Boycott {
    pub node: NodeIndex,
    pub until_ms: u64,
}

/// Failure-detector state exchange. `gossip_list[i]` counts how many
/// gossip intervals passed since the sender last heard from node i;
/// `instance_ids[i]` is the startup time of the newest instance of node i
/// the sender knows about.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GossipMessage {
    pub node: NodeId,
    pub instance_id: u64,
    /// Wall-clock send time, for skew rejection.
    pub sent_time_ms: u64,
    pub flags: u8,
    pub gossip_list: Vec<u32>,
    pub instance_ids: Vec<u64>,
    /// Present on the wire only with HAS_FAILOVER_LIST.
    pub failover_list: Vec<u64>,
    pub boycott_list: Vec<Boycott>,
    pub msg_id: u64,
}

impl GossipMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_node_id(self.node);
        w.write_u64(self.instance_id);
        w.write_u64(self.sent_time_ms);
        w.write_u8(self.flags);
        w.write_vec(&self.gossip_list, |w, v| w.write_u32(*v));
        w.write_vec(&self.instance_ids, |w, v| w.write_u64(*v));
        if self.flags & gossip_flags::HAS_FAILOVER_LIST != 0 {
            w.write_vec(&self.failover_list, |w, v| w.write_u64(*v));
        }
        w.write_vec(&self.boycott_list, |w, b| {
            w.write_u16(b.node);
            w.write_u64(b.until_ms);
        });
        w.write_u64(self.msg_id);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<GossipMessage, Status> {
        let node = r.read_node_id()?;
        let instance_id = r.read_u64()?;
        let sent_time_ms = r.read_u64()?;
        let flags = r.read_u8()?;
        let gossip_list = r.read_vec(|r| r.read_u32())?;
        let instance_ids = r.read_vec(|r| r.read_u64())?;
        let failover_list = if flags & gossip_flags::HAS_FAILOVER_LIST != 0 {
            r.read_vec(|r| r.read_u64())?
        } else {
            Vec::new()
        };
        let boycott_list =
            r.read_vec(|r| Ok(Boycott { node: r.read_u16()?, until_ms: r.read_u64()? }))?;
        let msg_id = r.read_u64()?;
        Ok(GossipMessage {
            node,
            instance_id,
            sent_time_ms,
            flags,
            gossip_list,
            instance_ids,
            failover_list,
            boycott_list,
            msg_id,
        })
    }
}
