use crate::protocol::{ProtocolReader, ProtocolWriter};
use logd_primitives::{LogId, Lsn, ShardIndex, Status};

/// Advances the trim point of a log on one shard. The server never lowers
/// the stored trim point; a request below it succeeds as a no-op.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TrimMessage {
    pub rqid: u64,
    pub log: LogId,
    pub trim_point: Lsn,
    pub shard: ShardIndex,
}

impl TrimMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.rqid);
        w.write_log_id(self.log);
        w.write_lsn(self.trim_point);
        w.write_u8(self.shard);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<TrimMessage, Status> {
        Ok(TrimMessage {
            rqid: r.read_u64()?,
            log: r.read_log_id()?,
            trim_point: r.read_lsn()?,
            shard: r.read_u8()?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TrimmedMessage {
    pub rqid: u64,
    pub status: Status,
    pub shard: ShardIndex,
}

impl TrimmedMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.rqid);
        w.write_status(self.status);
        w.write_u8(self.shard);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<TrimmedMessage, Status> {
        Ok(TrimmedMessage {
            rqid: r.read_u64()?,
            status: r.read_status()?,
            shard: r.read_u8()?,
        })
    }
}
