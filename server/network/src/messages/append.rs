use crate::protocol::{ProtocolReader, ProtocolWriter};
use bytes::Bytes;
use logd_primitives::{Epoch, LogId, Lsn, NodeIndex, RecordTimestamp, Status};

/// Client-facing append. `seen_epoch` lets the sequencer detect clients
/// that already observed a newer epoch elsewhere.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AppendMessage {
    pub rqid: u64,
    pub log: LogId,
    pub seen_epoch: Epoch,
    pub timeout_ms: u32,
    pub flags: u32,
    pub payload: Bytes,
}

impl AppendMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.rqid);
        w.write_log_id(self.log);
        w.write_epoch(self.seen_epoch);
        w.write_u32(self.timeout_ms);
        w.write_u32(self.flags);
        w.write_bytes(&self.payload);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<AppendMessage, Status> {
        Ok(AppendMessage {
            rqid: r.read_u64()?,
            log: r.read_log_id()?,
            seen_epoch: r.read_epoch()?,
            timeout_ms: r.read_u32()?,
            flags: r.read_u32()?,
            payload: r.read_bytes()?,
        })
    }
}

/// Reply to an append: the final status once enough STOREs completed or
/// timed out. `redirect` names the node the client should try instead
/// when the status is PREEMPTED or NOTINCONFIG.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AppendedMessage {
    pub rqid: u64,
    pub status: Status,
    pub lsn: Lsn,
    pub timestamp: RecordTimestamp,
    pub redirect: NodeIndex,
}

impl AppendedMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.rqid);
        w.write_status(self.status);
        w.write_lsn(self.lsn);
        w.write_u64(self.timestamp.0);
        w.write_u16(self.redirect);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<AppendedMessage, Status> {
        Ok(AppendedMessage {
            rqid: r.read_u64()?,
            status: r.read_status()?,
            lsn: r.read_lsn()?,
            timestamp: RecordTimestamp(r.read_u64()?),
            redirect: r.read_u16()?,
        })
    }
}
