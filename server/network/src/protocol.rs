//! Versioned body serialization. A [`ProtocolWriter`] knows the protocol
//! negotiated for the connection; fields introduced in newer versions are
//! written last and guarded with [`ProtocolWriter::gate`], and the reader
//! mirrors them with [`ProtocolReader::read_gated`], defaulting when the
//! peer's stream ends early.

use crate::compatibility::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use logd_primitives::{Epoch, Esn, LogId, Lsn, NodeId, ShardId, Status};

/// Strings and byte blobs are length-prefixed with u32; this caps them.
const MAX_BLOB_LEN: usize = crate::frame::MAX_LEN;

pub struct ProtocolWriter {
    buf: BytesMut,
    proto: ProtocolVersion,
}

impl ProtocolWriter {
    pub fn new(proto: ProtocolVersion) -> ProtocolWriter {
        ProtocolWriter { buf: BytesMut::new(), proto }
    }

    pub fn proto(&self) -> ProtocolVersion {
        self.proto
    }

    /// True when the negotiated protocol includes `version`. Callers wrap
    /// newer trailing fields in this.
    pub fn gate(&self, version: ProtocolVersion) -> bool {
        self.proto >= version
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_log_id(&mut self, v: LogId) {
        self.write_u64(v.0);
    }

    pub fn write_epoch(&mut self, v: Epoch) {
        self.write_u32(v.0);
    }

    pub fn write_esn(&mut self, v: Esn) {
        self.write_u32(v.0);
    }

    pub fn write_lsn(&mut self, v: Lsn) {
        self.write_u64(v.0);
    }

    pub fn write_node_id(&mut self, v: NodeId) {
        self.write_u16(v.index);
        self.write_u16(v.generation);
    }

    pub fn write_shard_id(&mut self, v: ShardId) {
        self.write_u16(v.node);
        self.write_u8(v.shard);
    }

    pub fn write_status(&mut self, v: Status) {
        self.write_u8(v.to_wire() as u8);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    pub fn write_copyset(&mut self, copyset: &[ShardId]) {
        self.write_u8(copyset.len() as u8);
        for shard in copyset {
            self.write_shard_id(*shard);
        }
    }

    pub fn write_vec<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            f(self, item);
        }
    }
}

pub struct ProtocolReader {
    buf: Bytes,
    proto: ProtocolVersion,
}

impl ProtocolReader {
    pub fn new(body: Bytes, proto: ProtocolVersion) -> ProtocolReader {
        ProtocolReader { buf: body, proto }
    }

    pub fn proto(&self) -> ProtocolVersion {
        self.proto
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// A reader finishing with trailing bytes indicates a peer speaking a
    /// newer dialect than negotiated; the deserializers treat that as a
    /// malformed message.
    pub fn finish(self) -> Result<(), Status> {
        if self.buf.has_remaining() {
            return Err(Status::Badmsg);
        }
        Ok(())
    }

    fn need(&self, n: usize) -> Result<(), Status> {
        if self.buf.remaining() < n {
            return Err(Status::Badmsg);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, Status> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, Status> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, Status> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, Status> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_log_id(&mut self) -> Result<LogId, Status> {
        Ok(LogId(self.read_u64()?))
    }

    pub fn read_epoch(&mut self) -> Result<Epoch, Status> {
        Ok(Epoch(self.read_u32()?))
    }

    pub fn read_esn(&mut self) -> Result<Esn, Status> {
        Ok(Esn(self.read_u32()?))
    }

    pub fn read_lsn(&mut self) -> Result<Lsn, Status> {
        Ok(Lsn(self.read_u64()?))
    }

    pub fn read_node_id(&mut self) -> Result<NodeId, Status> {
        Ok(NodeId { index: self.read_u16()?, generation: self.read_u16()? })
    }

    pub fn read_shard_id(&mut self) -> Result<ShardId, Status> {
        Ok(ShardId { node: self.read_u16()?, shard: self.read_u8()? })
    }

    pub fn read_status(&mut self) -> Result<Status, Status> {
        Status::from_wire(self.read_u8()?).ok_or(Status::Badmsg)
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, Status> {
        let len = self.read_u32()? as usize;
        if len > MAX_BLOB_LEN {
            return Err(Status::Toobig);
        }
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_str(&mut self) -> Result<String, Status> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Status::Badmsg)
    }

    pub fn read_copyset(&mut self) -> Result<Vec<ShardId>, Status> {
        let len = self.read_u8()? as usize;
        let mut copyset = Vec::with_capacity(len);
        for _ in 0..len {
            copyset.push(self.read_shard_id()?);
        }
        Ok(copyset)
    }

    pub fn read_vec<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, Status>,
    ) -> Result<Vec<T>, Status> {
        let len = self.read_u32()? as usize;
        if len > MAX_BLOB_LEN {
            return Err(Status::Toobig);
        }
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Reads a field introduced at `version`: absent below the gate or
    /// when an older peer's stream ended early, in which case the default
    /// is used.
    pub fn read_gated<T>(
        &mut self,
        version: ProtocolVersion,
        default: T,
        f: impl FnOnce(&mut Self) -> Result<T, Status>,
    ) -> Result<T, Status> {
        if self.proto < version || !self.buf.has_remaining() {
            return Ok(default);
        }
        f(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::MAX_PROTOCOL_SUPPORTED;

    #[test]
    fn primitives_round_trip() {
        let mut w = ProtocolWriter::new(MAX_PROTOCOL_SUPPORTED);
        w.write_u16(7);
        w.write_lsn(Lsn::from_parts(Epoch(3), Esn(9)));
        w.write_str("cluster");
        w.write_copyset(&[ShardId::new(1, 0), ShardId::new(2, 1)]);
        let mut r = ProtocolReader::new(w.finish(), MAX_PROTOCOL_SUPPORTED);
        assert_eq!(r.read_u16().unwrap(), 7);
        assert_eq!(r.read_lsn().unwrap(), Lsn::from_parts(Epoch(3), Esn(9)));
        assert_eq!(r.read_str().unwrap(), "cluster");
        assert_eq!(r.read_copyset().unwrap(), vec![ShardId::new(1, 0), ShardId::new(2, 1)]);
        r.finish().unwrap();
    }

    #[test]
    fn gated_field_defaults_for_old_streams() {
        // Writer at an old protocol omits the gated trailing field.
        let w = ProtocolWriter::new(2);
        let mut r = ProtocolReader::new(w.finish(), 2);
        let v = r.read_gated(3, 42u32, |r| r.read_u32()).unwrap();
        assert_eq!(v, 42);

        // Writer at the new protocol includes it.
        let mut w = ProtocolWriter::new(3);
        if w.gate(3) {
            w.write_u32(7);
        }
        let mut r = ProtocolReader::new(w.finish(), 3);
        assert_eq!(r.read_gated(3, 42u32, |r| r.read_u32()).unwrap(), 7);
    }

    #[test]
    fn underruns_are_badmsg() {
        let mut w = ProtocolWriter::new(MAX_PROTOCOL_SUPPORTED);
        w.write_u8(1);
        let mut r = ProtocolReader::new(w.finish(), MAX_PROTOCOL_SUPPORTED);
        assert_eq!(r.read_u64(), Err(Status::Badmsg));
    }
}
