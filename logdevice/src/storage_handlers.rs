//! Server-side handlers of storage-bound messages. Each handler runs on
//! the worker owning the connection, validates, and queues a storage task
//! on the target shard; the task completes back through a reply message
//! to the peer.

use crate::network_glue::ReplySender;
use logd_network::messages::{
    Address, CleanMessage, CleanedMessage, EpochRecoveryEntry,
    GetEpochRecoveryMetadataMessage, GetEpochRecoveryMetadataReplyMessage, Message, SealMessage,
    SealedMessage, StoreMessage, StoredMessage, TrimMessage, TrimmedMessage,
};
use logd_network::messages::store_flags;
use logd_primitives::{Epoch, Esn, Lsn, ShardIndex, Status};
use logd_storage::{
    Durability, StorageTask, StorageTaskContext, StorageThreadPool, TaskPriority, ThreadType,
};
use logd_store::{
    record_flags, LastCleanMetadata, RecordWrite, SealMetadata, TrimMetadata, WriteOptions,
};
use std::sync::Arc;

fn shard_pool<'a>(
    pools: &'a [Arc<StorageThreadPool>],
    shard: ShardIndex,
) -> Option<&'a Arc<StorageThreadPool>> {
    pools.get(shard as usize)
}

// ---- TRIM ----

/// Writes the trim point and replies TRIMMED. A stored trim point already
/// at or past the requested one reports success: trim points never move
/// backwards.
struct WriteTrimMetadataTask {
    msg: TrimMessage,
    reply_to: Address,
    reply: ReplySender,
}

impl StorageTask for WriteTrimMetadataTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Metadata
    }

    fn durability(&self) -> Durability {
        Durability::SyncWrite
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        match ctx.store.update_log_metadata(
            self.msg.log,
            &TrimMetadata(self.msg.trim_point),
            &WriteOptions::default(),
        ) {
            Ok(()) => Status::Ok,
            Err(Status::Uptodate) => Status::Ok,
            Err(status) => {
                tracing::error!(
                    target: "storage",
                    log = %self.msg.log,
                    %status,
                    "failed to write trim metadata"
                );
                Status::Failed
            }
        }
    }

    fn on_done(self: Box<Self>, status: Status) {
        self.reply.send(
            self.reply_to,
            Message::Trimmed(TrimmedMessage {
                rqid: self.msg.rqid,
                status,
                shard: self.msg.shard,
            }),
        );
    }

    fn on_dropped(self: Box<Self>) {
        self.reply.send(
            self.reply_to,
            Message::Trimmed(TrimmedMessage {
                rqid: self.msg.rqid,
                status: Status::Failed,
                shard: self.msg.shard,
            }),
        );
    }

    fn name(&self) -> &'static str {
        "WriteTrimMetadataTask"
    }
}

pub fn trim_on_received(
    msg: TrimMessage,
    from: Address,
    pools: &[Arc<StorageThreadPool>],
    reply: &ReplySender,
) {
    if !from.is_client() {
        tracing::error!(target: "storage", %from, "TRIM from a non-client peer");
        return;
    }
    let send_reply = |status: Status| {
        reply.send(
            from,
            Message::Trimmed(TrimmedMessage { rqid: msg.rqid, status, shard: msg.shard }),
        );
    };
    // Shard index outside this node's shape is rejected before any store
    // access.
    let Some(pool) = shard_pool(pools, msg.shard) else {
        tracing::error!(
            target: "storage",
            %from,
            shard = msg.shard,
            shards = pools.len(),
            "TRIM for an invalid shard"
        );
        send_reply(Status::InvalidParam);
        return;
    };
    if !msg.log.is_valid() || !msg.trim_point.is_valid() {
        tracing::error!(
            target: "storage",
            %from,
            log = %msg.log,
            trim_point = %msg.trim_point,
            "invalid TRIM message"
        );
        send_reply(Status::InvalidParam);
        return;
    }
    let task =
        WriteTrimMetadataTask { msg: msg.clone(), reply_to: from, reply: reply.clone() };
    if let Err((status, _)) = pool.try_put_task(Box::new(task)) {
        send_reply(status);
    }
}

// ---- STORE ----

/// Persists one record copy and replies STORED. Seals are enforced here:
/// a regular STORE for an epoch at or below the seal is refused so the
/// old sequencer learns it was preempted.
struct WriteRecordStorageTask {
    msg: StoreMessage,
    reply_to: Address,
    reply: ReplySender,
    my_shard: ShardIndex,
}

impl WriteRecordStorageTask {
    fn stored_reply(&self, status: Status, redirect: u16) -> Message {
        Message::Stored(StoredMessage {
            log: self.msg.header.log,
            epoch: self.msg.header.epoch,
            esn: self.msg.header.esn,
            wave: self.msg.header.wave,
            status,
            redirect,
            flags: 0,
            shard: self.my_shard,
        })
    }
}

impl StorageTask for WriteRecordStorageTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::FastStallable
    }

    fn priority(&self) -> TaskPriority {
        if self.msg.header.flags & (store_flags::REBUILDING | store_flags::RECOVERY) != 0 {
            TaskPriority::Mid
        } else {
            TaskPriority::High
        }
    }

    fn durability(&self) -> Durability {
        if self.msg.header.nsync > 0 { Durability::SyncWrite } else { Durability::AsyncWrite }
    }

    fn is_write_task(&self) -> bool {
        true
    }

    fn payload_size(&self) -> usize {
        self.msg.payload.len()
    }

    fn is_droppable(&self) -> bool {
        // Dropping a STORE just costs the sequencer a wave.
        true
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        let header = &self.msg.header;
        // Recovery and rebuilding STOREs may write into sealed epochs;
        // regular appends must not.
        if header.flags & (store_flags::RECOVERY | store_flags::REBUILDING) == 0 {
            match ctx.store.get_log_metadata::<SealMetadata>(header.log) {
                Ok(Some(seal)) if header.epoch <= seal.epoch => {
                    tracing::debug!(
                        target: "storage",
                        log = %header.log,
                        epoch = %header.epoch,
                        seal = %seal.epoch,
                        "rejecting STORE into a sealed epoch"
                    );
                    return Status::Preempted;
                }
                Ok(_) => {}
                Err(status) => return status,
            }
        }
        let mut flags = 0u32;
        if header.flags & store_flags::WRITTEN_BY_REBUILDING != 0 {
            flags |= record_flags::WRITTEN_BY_REBUILDING;
        }
        if header.flags & store_flags::AMEND != 0 {
            flags |= record_flags::AMEND;
        }
        if header.flags & store_flags::DRAINED != 0 {
            flags |= record_flags::DRAINED;
        }
        let write = RecordWrite {
            log: header.log,
            lsn: Lsn::from_parts(header.epoch, header.esn),
            timestamp: header.timestamp,
            flags,
            wave: header.wave,
            copyset: &header.copyset,
            payload: &self.msg.payload,
        };
        match ctx.store.write_record(&write, &WriteOptions::default()) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    fn on_done(self: Box<Self>, status: Status) {
        let reply = self.stored_reply(status, 0);
        self.reply.send(self.reply_to, reply);
    }

    fn on_dropped(self: Box<Self>) {
        let reply = self.stored_reply(Status::Nobufs, 0);
        self.reply.send(self.reply_to, reply);
    }

    fn name(&self) -> &'static str {
        "WriteRecordStorageTask"
    }
}

pub fn store_on_received(
    msg: StoreMessage,
    from: Address,
    my_shard_count: ShardIndex,
    pools: &[Arc<StorageThreadPool>],
    reply: &ReplySender,
) {
    // The copyset entry at copyset_offset names the shard this copy goes
    // to.
    let target_shard = msg
        .header
        .copyset
        .get(msg.header.copyset_offset as usize)
        .map(|s| s.shard)
        .unwrap_or(0);
    if target_shard >= my_shard_count {
        tracing::error!(
            target: "storage",
            %from,
            shard = target_shard,
            "STORE for an invalid shard"
        );
        reply.send(
            from,
            Message::Stored(StoredMessage {
                log: msg.header.log,
                epoch: msg.header.epoch,
                esn: msg.header.esn,
                wave: msg.header.wave,
                status: Status::InvalidParam,
                redirect: 0,
                flags: 0,
                shard: target_shard,
            }),
        );
        return;
    }
    let pool = &pools[target_shard as usize];
    let task = WriteRecordStorageTask {
        msg,
        reply_to: from,
        reply: reply.clone(),
        my_shard: target_shard,
    };
    if let Err((status, task)) = pool.try_put_task(Box::new(task)) {
        task.on_done(status);
    }
}

// ---- SEAL / CLEAN (recovery) ----

struct SealStorageTask {
    msg: SealMessage,
    reply_to: Address,
    reply: ReplySender,
    lng_list: Vec<Esn>,
    last_lsn: Lsn,
}

impl StorageTask for SealStorageTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Metadata
    }

    fn durability(&self) -> Durability {
        Durability::SyncWrite
    }

    fn is_droppable(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        match ctx.store.update_log_metadata(
            self.msg.log,
            &SealMetadata { epoch: self.msg.seal_epoch, sealed_by: self.msg.sealed_by.index },
            &WriteOptions::default(),
        ) {
            // A seal already at or past ours: the epoch range is sealed,
            // which is what the recovering sequencer needs.
            Ok(()) | Err(Status::Uptodate) => {}
            Err(status) => return status,
        }
        // Summarize the sealed range (last_clean, seal]: per-epoch LNG
        // from recovery metadata where known, plus the highest LSN this
        // shard has for the log.
        for epoch in self.msg.last_clean_epoch.0 + 1..=self.msg.seal_epoch.0 {
            let lng = match ctx.store.get_per_epoch_metadata(self.msg.log, Epoch(epoch)) {
                Ok(Some(meta)) => meta.last_known_good,
                Ok(None) => Esn::INVALID,
                Err(status) => return status,
            };
            self.lng_list.push(lng);
        }
        self.last_lsn = ctx.store.max_lsn_upper_bound(self.msg.log);
        Status::Ok
    }

    fn on_done(mut self: Box<Self>, status: Status) {
        let lng_list = std::mem::take(&mut self.lng_list);
        self.reply.send(
            self.reply_to,
            Message::Sealed(SealedMessage {
                log: self.msg.log,
                seal_epoch: self.msg.seal_epoch,
                shard: self.msg.shard,
                status,
                lng_list,
                last_lsn: self.last_lsn,
                tail_records: Vec::new(),
                epoch_offset_map: Vec::new(),
            }),
        );
    }

    fn on_dropped(self: Box<Self>) {
        unreachable!("seal task is not droppable");
    }

    fn name(&self) -> &'static str {
        "SealStorageTask"
    }
}

pub fn seal_on_received(
    msg: SealMessage,
    from: Address,
    pools: &[Arc<StorageThreadPool>],
    reply: &ReplySender,
) {
    let Some(pool) = shard_pool(pools, msg.shard) else {
        tracing::error!(target: "storage", %from, shard = msg.shard, "SEAL for an invalid shard");
        return;
    };
    let task = SealStorageTask {
        msg,
        reply_to: from,
        reply: reply.clone(),
        lng_list: Vec::new(),
        last_lsn: Lsn::INVALID,
    };
    if let Err((status, _)) = pool.try_put_task(Box::new(task)) {
        tracing::warn!(target: "storage", %status, "could not enqueue SEAL");
    }
}

struct CleanStorageTask {
    msg: CleanMessage,
    reply_to: Address,
    reply: ReplySender,
}

impl StorageTask for CleanStorageTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Metadata
    }

    fn durability(&self) -> Durability {
        Durability::SyncWrite
    }

    fn is_droppable(&self) -> bool {
        false
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        match ctx.store.update_log_metadata(
            self.msg.log,
            &LastCleanMetadata(self.msg.epoch),
            &WriteOptions::default(),
        ) {
            Ok(()) | Err(Status::Uptodate) => Status::Ok,
            Err(status) => status,
        }
    }

    fn on_done(self: Box<Self>, status: Status) {
        self.reply.send(
            self.reply_to,
            Message::Cleaned(CleanedMessage {
                log: self.msg.log,
                epoch: self.msg.epoch,
                recovery_id: self.msg.recovery_id,
                shard: self.msg.shard,
                status,
            }),
        );
    }

    fn on_dropped(self: Box<Self>) {
        unreachable!("clean task is not droppable");
    }

    fn name(&self) -> &'static str {
        "CleanStorageTask"
    }
}

pub fn clean_on_received(
    msg: CleanMessage,
    from: Address,
    pools: &[Arc<StorageThreadPool>],
    reply: &ReplySender,
) {
    let Some(pool) = shard_pool(pools, msg.shard) else {
        tracing::error!(target: "storage", %from, shard = msg.shard, "CLEAN for an invalid shard");
        return;
    };
    let task = CleanStorageTask { msg, reply_to: from, reply: reply.clone() };
    if let Err((status, _)) = pool.try_put_task(Box::new(task)) {
        tracing::warn!(target: "storage", %status, "could not enqueue CLEAN");
    }
}

// ---- GET_EPOCH_RECOVERY_METADATA ----

struct GetEpochRecoveryMetadataTask {
    msg: GetEpochRecoveryMetadataMessage,
    reply_to: Address,
    reply: ReplySender,
    entries: Vec<EpochRecoveryEntry>,
}

impl StorageTask for GetEpochRecoveryMetadataTask {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Metadata
    }

    fn execute(&mut self, ctx: &mut StorageTaskContext<'_>) -> Status {
        for epoch in self.msg.start.0..=self.msg.end.0 {
            let epoch = Epoch(epoch);
            match ctx.store.get_per_epoch_metadata(self.msg.log, epoch) {
                Ok(Some(meta)) => self.entries.push(EpochRecoveryEntry {
                    epoch,
                    status: Status::Ok,
                    last_known_good: meta.last_known_good,
                    last_record: meta.last_record,
                    epoch_size: meta.epoch_size,
                }),
                Ok(None) => self.entries.push(EpochRecoveryEntry {
                    epoch,
                    status: Status::Notfound,
                    last_known_good: Esn::INVALID,
                    last_record: Esn::INVALID,
                    epoch_size: 0,
                }),
                Err(status) => return status,
            }
        }
        Status::Ok
    }

    fn on_done(mut self: Box<Self>, status: Status) {
        let entries = std::mem::take(&mut self.entries);
        self.reply.send(
            self.reply_to,
            Message::GetEpochRecoveryMetadataReply(GetEpochRecoveryMetadataReplyMessage {
                id: self.msg.id,
                log: self.msg.log,
                shard: self.msg.shard,
                status,
                entries,
            }),
        );
    }

    fn on_dropped(self: Box<Self>) {
        self.reply.send(
            self.reply_to,
            Message::GetEpochRecoveryMetadataReply(GetEpochRecoveryMetadataReplyMessage {
                id: self.msg.id,
                log: self.msg.log,
                shard: self.msg.shard,
                status: Status::Again,
                entries: Vec::new(),
            }),
        );
    }

    fn name(&self) -> &'static str {
        "GetEpochRecoveryMetadataTask"
    }
}

pub fn get_epoch_recovery_metadata_on_received(
    msg: GetEpochRecoveryMetadataMessage,
    from: Address,
    pools: &[Arc<StorageThreadPool>],
    reply: &ReplySender,
) {
    let Some(pool) = shard_pool(pools, msg.shard) else {
        tracing::error!(
            target: "storage",
            %from,
            shard = msg.shard,
            "GET_EPOCH_RECOVERY_METADATA for an invalid shard"
        );
        return;
    };
    if msg.start > msg.end {
        reply.send(
            from,
            Message::GetEpochRecoveryMetadataReply(GetEpochRecoveryMetadataReplyMessage {
                id: msg.id,
                log: msg.log,
                shard: msg.shard,
                status: Status::InvalidParam,
                entries: Vec::new(),
            }),
        );
        return;
    }
    let task =
        GetEpochRecoveryMetadataTask { msg, reply_to: from, reply: reply.clone(), entries: Vec::new() };
    if let Err((status, _)) = pool.try_put_task(Box::new(task)) {
        tracing::warn!(target: "storage", %status, "could not enqueue recovery metadata read");
    }
}
