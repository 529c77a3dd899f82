//! Wire framing: every message is preceded by a ProtocolHeader of
//! `len:u32 LE | type:u8 | cksum:u64 LE`, where the checksum word is only
//! present for message types and protocol versions that opt in. `len`
//! covers the header itself plus the body.

use crate::compatibility::{ProtocolVersion, CHECKSUM_SUPPORT};
use crate::messages::MessageType;
use bytes::{Buf, BufMut};
use logd_primitives::Status;

/// Maximum serialized body length. Anything longer is rejected before any
/// allocation happens.
pub const MAX_LEN: usize = 16 * 1024 * 1024;

/// Header bytes without the checksum word.
pub const HEADER_BASE_LEN: usize = 4 + 1;
pub const CHECKSUM_LEN: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ProtocolHeader {
    /// Total frame length: header bytes plus body bytes.
    pub len: u32,
    pub msg_type: MessageType,
    /// Checksum of the body; zero means "not verified".
    pub cksum: u64,
}

impl ProtocolHeader {
    /// Whether frames of this type at this protocol version carry the
    /// checksum word. Handshake messages never do: they are exchanged
    /// before the version is negotiated.
    pub fn needs_checksum(msg_type: MessageType, proto: ProtocolVersion) -> bool {
        !msg_type.is_handshake() && proto >= CHECKSUM_SUPPORT
    }

    pub fn bytes_needed(msg_type: MessageType, proto: ProtocolVersion) -> usize {
        if Self::needs_checksum(msg_type, proto) {
            HEADER_BASE_LEN + CHECKSUM_LEN
        } else {
            HEADER_BASE_LEN
        }
    }

    pub fn encode(&self, proto: ProtocolVersion, out: &mut impl BufMut) {
        out.put_u32_le(self.len);
        out.put_u8(self.msg_type as u8);
        if Self::needs_checksum(self.msg_type, proto) {
            out.put_u64_le(self.cksum);
        }
    }

    /// Decodes the fixed part. The caller must have checked that at least
    /// HEADER_BASE_LEN bytes are available; the checksum word, when
    /// present, is read separately once the type is known.
    pub fn decode_base(buf: &mut impl Buf) -> Result<(u32, MessageType), Status> {
        let len = buf.get_u32_le();
        let raw_type = buf.get_u8();
        let msg_type = MessageType::from_u8(raw_type).ok_or(Status::Badmsg)?;
        Ok((len, msg_type))
    }

    /// Validates a received length against the header shape and MAX_LEN.
    pub fn validate_len(len: u32, msg_type: MessageType, proto: ProtocolVersion) -> Result<usize, Status> {
        let header_bytes = Self::bytes_needed(msg_type, proto);
        let len = len as usize;
        if len < header_bytes || len > MAX_LEN + header_bytes {
            return Err(Status::Badmsg);
        }
        Ok(len - header_bytes)
    }
}

/// Body checksum: CRC32C widened to the 64-bit header slot.
pub fn compute_checksum(body: &[u8]) -> u64 {
    crc32c::crc32c(body) as u64
}
