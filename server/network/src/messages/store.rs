use crate::protocol::{ProtocolReader, ProtocolWriter};
use bytes::Bytes;
use logd_primitives::{Epoch, Esn, LogId, NodeIndex, RecordTimestamp, ShardId, ShardIndex, Status};

pub mod store_flags {
    /// Sent by rebuilding rather than an appender.
    pub const REBUILDING: u32 = 1 << 0;
    /// Sent by epoch recovery.
    pub const RECOVERY: u32 = 1 << 1;
    /// Amend copyset/flags of an existing record; no payload.
    pub const AMEND: u32 = 1 << 2;
    /// The record was drained off this shard by a relocation.
    pub const DRAINED: u32 = 1 << 3;
    /// The header carries the byte offset of this record within its epoch.
    pub const OFFSET_WITHIN_EPOCH: u32 = 1 << 4;
    /// The header carries a user-provided key.
    pub const CUSTOM_KEY: u32 = 1 << 5;
    /// End-to-end tracing is on for this record.
    pub const E2E_TRACING_ON: u32 = 1 << 6;
    /// Replica should mark the record as written by rebuilding.
    pub const WRITTEN_BY_REBUILDING: u32 = 1 << 7;
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoreHeader {
    pub log: LogId,
    pub epoch: Epoch,
    pub esn: Esn,
    pub timestamp: RecordTimestamp,
    /// Highest ESN in this epoch known fully replicated by the sequencer.
    pub last_known_good: Esn,
    pub wave: u32,
    pub flags: u32,
    /// How many copyset members must sync to disk before acknowledging.
    pub nsync: u8,
    /// Index of this recipient within the copyset chain.
    pub copyset_offset: u8,
    pub copyset: Vec<ShardId>,
    /// Only meaningful with OFFSET_WITHIN_EPOCH.
    pub offset_within_epoch: u64,
    /// Only meaningful with CUSTOM_KEY.
    pub custom_key: String,
}

impl StoreHeader {
    pub fn rid(&self) -> (LogId, Epoch, Esn) {
        (self.log, self.epoch, self.esn)
    }
}

/// Record placement request, sequencer (or donor) to storage shard.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoreMessage {
    pub header: StoreHeader,
    /// Empty for AMEND.
    pub payload: Bytes,
}

impl StoreMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        let h = &self.header;
        w.write_log_id(h.log);
        w.write_epoch(h.epoch);
        w.write_esn(h.esn);
        w.write_u64(h.timestamp.0);
        w.write_esn(h.last_known_good);
        w.write_u32(h.wave);
        w.write_u32(h.flags);
        w.write_u8(h.nsync);
        w.write_u8(h.copyset_offset);
        w.write_copyset(&h.copyset);
        if h.flags & store_flags::OFFSET_WITHIN_EPOCH != 0 {
            w.write_u64(h.offset_within_epoch);
        }
        if h.flags & store_flags::CUSTOM_KEY != 0 {
            w.write_str(&h.custom_key);
        }
        w.write_bytes(&self.payload);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<StoreMessage, Status> {
        let log = r.read_log_id()?;
        let epoch = r.read_epoch()?;
        let esn = r.read_esn()?;
        let timestamp = RecordTimestamp(r.read_u64()?);
        let last_known_good = r.read_esn()?;
        let wave = r.read_u32()?;
        let flags = r.read_u32()?;
        let nsync = r.read_u8()?;
        let copyset_offset = r.read_u8()?;
        let copyset = r.read_copyset()?;
        let offset_within_epoch =
            if flags & store_flags::OFFSET_WITHIN_EPOCH != 0 { r.read_u64()? } else { 0 };
        let custom_key =
            if flags & store_flags::CUSTOM_KEY != 0 { r.read_str()? } else { String::new() };
        let payload = r.read_bytes()?;
        Ok(StoreMessage {
            header: StoreHeader {
                log,
                epoch,
                esn,
                timestamp,
                last_known_good,
                wave,
                flags,
                nsync,
                copyset_offset,
                copyset,
                offset_within_epoch,
                custom_key,
            },
            payload,
        })
    }
}

/// Reply to a STORE. On PREEMPTED, `redirect` carries the preempting
/// sequencer's node so the sender can give up the epoch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoredMessage {
    pub log: LogId,
    pub epoch: Epoch,
    pub esn: Esn,
    pub wave: u32,
    pub status: Status,
    pub redirect: NodeIndex,
    pub flags: u32,
    pub shard: ShardIndex,
}

impl StoredMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_epoch(self.epoch);
        w.write_esn(self.esn);
        w.write_u32(self.wave);
        w.write_status(self.status);
        w.write_u16(self.redirect);
        w.write_u32(self.flags);
        w.write_u8(self.shard);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<StoredMessage, Status> {
        Ok(StoredMessage {
            log: r.read_log_id()?,
            epoch: r.read_epoch()?,
            esn: r.read_esn()?,
            wave: r.read_u32()?,
            status: r.read_status()?,
            redirect: r.read_u16()?,
            flags: r.read_u32()?,
            shard: r.read_u8()?,
        })
    }
}
