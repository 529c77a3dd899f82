//! Protocol version history. When adding a version, append it before
//! `PROTOCOL_VERSION_UPPER_BOUND` and gate new fields on it in the message
//! serializers; fields introduced by newer versions are always written
//! last so old readers simply stop early.

pub type ProtocolVersion = u16;

/// Versions at or below this are not spoken at all.
pub const PROTOCOL_VERSION_LOWER_BOUND: ProtocolVersion = 1;

/// Support for checksumming of any non-handshake message in the framing
/// layer.
pub const CHECKSUM_SUPPORT: ProtocolVersion = 3;

/// SEALED carries tail records for the sealed epoch range.
pub const TAIL_RECORD_IN_SEALED: ProtocolVersion = 4;

/// SEALED carries the per-epoch offset map instead of a single byte
/// offset.
pub const OFFSET_MAP_IN_SEALED: ProtocolVersion = 5;

const PROTOCOL_VERSION_UPPER_BOUND: ProtocolVersion = 6;

pub const MIN_PROTOCOL_SUPPORTED: ProtocolVersion = PROTOCOL_VERSION_LOWER_BOUND + 1;
pub const MAX_PROTOCOL_SUPPORTED: ProtocolVersion = PROTOCOL_VERSION_UPPER_BOUND - 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_history_is_consistent() {
        assert_eq!(MIN_PROTOCOL_SUPPORTED, 2);
        assert_eq!(CHECKSUM_SUPPORT, 3);
        assert_eq!(TAIL_RECORD_IN_SEALED, 4);
        assert_eq!(OFFSET_MAP_IN_SEALED, 5);
        assert_eq!(MAX_PROTOCOL_SUPPORTED, 5);
        assert!(MIN_PROTOCOL_SUPPORTED <= MAX_PROTOCOL_SUPPORTED);
    }
}
