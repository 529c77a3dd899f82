use crate::compatibility::{OFFSET_MAP_IN_SEALED, TAIL_RECORD_IN_SEALED};
use crate::protocol::{ProtocolReader, ProtocolWriter};
use logd_primitives::{Epoch, Esn, LogId, Lsn, NodeId, RecordTimestamp, ShardIndex, Status};

/// Seals a log on a shard up to `seal_epoch`: the shard promises to take
/// no more regular STOREs for epochs at or below it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SealMessage {
    pub log: LogId,
    pub seal_epoch: Epoch,
    /// Epoch of the sequencer driving recovery.
    pub sequencer_epoch: Epoch,
    pub last_clean_epoch: Epoch,
    pub sealed_by: NodeId,
    pub shard: ShardIndex,
}

impl SealMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_epoch(self.seal_epoch);
        w.write_epoch(self.sequencer_epoch);
        w.write_epoch(self.last_clean_epoch);
        w.write_node_id(self.sealed_by);
        w.write_u8(self.shard);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<SealMessage, Status> {
        Ok(SealMessage {
            log: r.read_log_id()?,
            seal_epoch: r.read_epoch()?,
            sequencer_epoch: r.read_epoch()?,
            last_clean_epoch: r.read_epoch()?,
            sealed_by: r.read_node_id()?,
            shard: r.read_u8()?,
        })
    }
}

/// Tail record summary carried in SEALED replies.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TailRecord {
    pub lsn: Lsn,
    pub timestamp: RecordTimestamp,
}

/// Reply to SEAL. Carries per-epoch last-known-good ESNs for the sealed
/// range `(last_clean_epoch, seal_epoch]`, the last LSN seen, and (for
/// protocols that support it) the per-epoch offset map and tail records.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SealedMessage {
    pub log: LogId,
    pub seal_epoch: Epoch,
    pub shard: ShardIndex,
    pub status: Status,
    pub lng_list: Vec<Esn>,
    pub last_lsn: Lsn,
    /// Gated on TAIL_RECORD_IN_SEALED.
    pub tail_records: Vec<TailRecord>,
    /// Gated on OFFSET_MAP_IN_SEALED.
    pub epoch_offset_map: Vec<(Epoch, u64)>,
}

impl SealedMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_epoch(self.seal_epoch);
        w.write_u8(self.shard);
        w.write_status(self.status);
        w.write_vec(&self.lng_list, |w, esn| w.write_esn(*esn));
        w.write_lsn(self.last_lsn);
        // Gated fields last, newest gate last of all.
        if w.gate(TAIL_RECORD_IN_SEALED) {
            w.write_vec(&self.tail_records, |w, t| {
                w.write_lsn(t.lsn);
                w.write_u64(t.timestamp.0);
            });
        }
        if w.gate(OFFSET_MAP_IN_SEALED) {
            w.write_vec(&self.epoch_offset_map, |w, (epoch, offset)| {
                w.write_epoch(*epoch);
                w.write_u64(*offset);
            });
        }
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<SealedMessage, Status> {
        let log = r.read_log_id()?;
        let seal_epoch = r.read_epoch()?;
        let shard = r.read_u8()?;
        let status = r.read_status()?;
        let lng_list = r.read_vec(|r| r.read_esn())?;
        let last_lsn = r.read_lsn()?;
        let tail_records = r.read_gated(TAIL_RECORD_IN_SEALED, Vec::new(), |r| {
            r.read_vec(|r| {
                Ok(TailRecord { lsn: r.read_lsn()?, timestamp: RecordTimestamp(r.read_u64()?) })
            })
        })?;
        let epoch_offset_map = r.read_gated(OFFSET_MAP_IN_SEALED, Vec::new(), |r| {
            r.read_vec(|r| Ok((r.read_epoch()?, r.read_u64()?)))
        })?;
        Ok(SealedMessage {
            log,
            seal_epoch,
            shard,
            status,
            lng_list,
            last_lsn,
            tail_records,
            epoch_offset_map,
        })
    }
}

/// Finalizes a recovered epoch on a shard.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CleanMessage {
    pub log: LogId,
    pub epoch: Epoch,
    /// Correlates CLEANED replies with one recovery attempt.
    pub recovery_id: u64,
    pub shard: ShardIndex,
}

impl CleanMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_epoch(self.epoch);
        w.write_u64(self.recovery_id);
        w.write_u8(self.shard);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<CleanMessage, Status> {
        Ok(CleanMessage {
            log: r.read_log_id()?,
            epoch: r.read_epoch()?,
            recovery_id: r.read_u64()?,
            shard: r.read_u8()?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CleanedMessage {
    pub log: LogId,
    pub epoch: Epoch,
    pub recovery_id: u64,
    pub shard: ShardIndex,
    pub status: Status,
}

impl CleanedMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_epoch(self.epoch);
        w.write_u64(self.recovery_id);
        w.write_u8(self.shard);
        w.write_status(self.status);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<CleanedMessage, Status> {
        Ok(CleanedMessage {
            log: r.read_log_id()?,
            epoch: r.read_epoch()?,
            recovery_id: r.read_u64()?,
            shard: r.read_u8()?,
            status: r.read_status()?,
        })
    }
}

/// Range query for per-epoch recovery metadata, used while purging. The
/// id correlates the reply.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GetEpochRecoveryMetadataMessage {
    pub log: LogId,
    pub shard: ShardIndex,
    pub purge_to: Epoch,
    pub start: Epoch,
    pub end: Epoch,
    pub id: u64,
}

impl GetEpochRecoveryMetadataMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_log_id(self.log);
        w.write_u8(self.shard);
        w.write_epoch(self.purge_to);
        w.write_epoch(self.start);
        w.write_epoch(self.end);
        w.write_u64(self.id);
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<GetEpochRecoveryMetadataMessage, Status> {
        Ok(GetEpochRecoveryMetadataMessage {
            log: r.read_log_id()?,
            shard: r.read_u8()?,
            purge_to: r.read_epoch()?,
            start: r.read_epoch()?,
            end: r.read_epoch()?,
            id: r.read_u64()?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EpochRecoveryEntry {
    pub epoch: Epoch,
    pub status: Status,
    pub last_known_good: Esn,
    pub last_record: Esn,
    pub epoch_size: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GetEpochRecoveryMetadataReplyMessage {
    pub id: u64,
    pub log: LogId,
    pub shard: ShardIndex,
    pub status: Status,
    pub entries: Vec<EpochRecoveryEntry>,
}

impl GetEpochRecoveryMetadataReplyMessage {
    pub fn serialize(&self, w: &mut ProtocolWriter) {
        w.write_u64(self.id);
        w.write_log_id(self.log);
        w.write_u8(self.shard);
        w.write_status(self.status);
        w.write_vec(&self.entries, |w, e| {
            w.write_epoch(e.epoch);
            w.write_status(e.status);
            w.write_esn(e.last_known_good);
            w.write_esn(e.last_record);
            w.write_u64(e.epoch_size);
        });
    }

    pub fn deserialize(r: &mut ProtocolReader) -> Result<GetEpochRecoveryMetadataReplyMessage, Status> {
        Ok(GetEpochRecoveryMetadataReplyMessage {
            id: r.read_u64()?,
            log: r.read_log_id()?,
            shard: r.read_u8()?,
            status: r.read_status()?,
            entries: r.read_vec(|r| {
                Ok(EpochRecoveryEntry {
                    epoch: r.read_epoch()?,
                    status: r.read_status()?,
                    last_known_good: r.read_esn()?,
                    last_record: r.read_esn()?,
                    epoch_size: r.read_u64()?,
                })
            })?,
        })
    }
}
