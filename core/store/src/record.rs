//! On-disk record value format:
//! `timestamp u64 | flags u32 | wave u32 | copyset_len u8 |
//!  (node u16, shard u8) * copyset_len | payload`.
//! Integers are big-endian like the keys.

use logd_primitives::{RecordTimestamp, ShardId, Status, WaveNumber};
use smallvec::SmallVec;

pub mod record_flags {
    /// Record was stored by rebuilding rather than by an append.
    pub const WRITTEN_BY_REBUILDING: u32 = 1 << 0;
    /// Amend of copyset/flags only; payload of an earlier wave is retained.
    pub const AMEND: u32 = 1 << 1;
    /// Record was relocated away by a drain; donors skip it.
    pub const DRAINED: u32 = 1 << 2;
    /// Hole plugged by recovery instead of a payload.
    pub const HOLE: u32 = 1 << 3;
}

const RECORD_HEADER_LEN: usize = 8 + 4 + 4 + 1;
pub const COPYSET_MAX: usize = 127;

pub fn encode_record(
    timestamp: RecordTimestamp,
    flags: u32,
    wave: WaveNumber,
    copyset: &[ShardId],
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(copyset.len() <= COPYSET_MAX);
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + copyset.len() * 3 + payload.len());
    out.extend_from_slice(&timestamp.0.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&wave.to_be_bytes());
    out.push(copyset.len() as u8);
    for shard in copyset {
        out.extend_from_slice(&shard.node.to_be_bytes());
        out.push(shard.shard);
    }
    out.extend_from_slice(payload);
    out
}

/// Zero-copy view of a stored record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRecord<'a> {
    pub timestamp: RecordTimestamp,
    pub flags: u32,
    pub wave: WaveNumber,
    pub copyset: SmallVec<[ShardId; 6]>,
    pub payload: &'a [u8],
}

impl<'a> ParsedRecord<'a> {
    pub fn parse(value: &'a [u8]) -> Result<ParsedRecord<'a>, Status> {
        if value.len() < RECORD_HEADER_LEN {
            return Err(Status::MalformedRecord);
        }
        let timestamp = RecordTimestamp(u64::from_be_bytes(value[..8].try_into().unwrap()));
        let flags = u32::from_be_bytes(value[8..12].try_into().unwrap());
        let wave = u32::from_be_bytes(value[12..16].try_into().unwrap());
        let copyset_len = value[16] as usize;
        let copyset_end = RECORD_HEADER_LEN + copyset_len * 3;
        if copyset_len > COPYSET_MAX || value.len() < copyset_end {
            return Err(Status::MalformedRecord);
        }
        let mut copyset = SmallVec::new();
        for i in 0..copyset_len {
            let off = RECORD_HEADER_LEN + i * 3;
            let node = u16::from_be_bytes(value[off..off + 2].try_into().unwrap());
            copyset.push(ShardId::new(node, value[off + 2]));
        }
        Ok(ParsedRecord { timestamp, flags, wave, copyset, payload: &value[copyset_end..] })
    }

    pub fn written_by_rebuilding(&self) -> bool {
        self.flags & record_flags::WRITTEN_BY_REBUILDING != 0
    }

    pub fn is_drained(&self) -> bool {
        self.flags & record_flags::DRAINED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn round_trip() {
        let copyset = [ShardId::new(1, 0), ShardId::new(5, 3)];
        let encoded = encode_record(
            RecordTimestamp(12345),
            record_flags::WRITTEN_BY_REBUILDING,
            2,
            &copyset,
            b"payload bytes",
        );
        let parsed = ParsedRecord::parse(&encoded).unwrap();
        assert_eq!(parsed.timestamp, RecordTimestamp(12345));
        assert_eq!(parsed.wave, 2);
        assert!(parsed.written_by_rebuilding());
        assert_eq!(&parsed.copyset[..], &copyset[..]);
        assert_eq!(parsed.payload, b"payload bytes");
    }

    #[test]
    fn truncated_values_are_malformed() {
        let encoded = encode_record(RecordTimestamp(1), 0, 1, &[ShardId::new(0, 0)], b"x");
        assert_matches!(ParsedRecord::parse(&encoded[..10]), Err(Status::MalformedRecord));
        // Copyset length pointing past the end of the value.
        let mut bad = encoded.clone();
        bad[16] = 120;
        assert_matches!(ParsedRecord::parse(&bad), Err(Status::MalformedRecord));
    }
}
