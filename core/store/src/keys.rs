//! Binary key layouts of the metadata and data column families. All
//! integers are big-endian so that byte order equals numeric order.

use logd_primitives::{Epoch, LogId, Lsn, PartitionId};

pub const DATA_KEY_LEN: usize = 16;

/// `log_id | lsn` in a partition or the unpartitioned column family.
pub fn data_key(log: LogId, lsn: Lsn) -> [u8; DATA_KEY_LEN] {
    let mut key = [0u8; DATA_KEY_LEN];
    key[..8].copy_from_slice(&log.0.to_be_bytes());
    key[8..].copy_from_slice(&lsn.0.to_be_bytes());
    key
}

pub fn parse_data_key(key: &[u8]) -> Option<(LogId, Lsn)> {
    if key.len() != DATA_KEY_LEN {
        return None;
    }
    let log = u64::from_be_bytes(key[..8].try_into().unwrap());
    let lsn = u64::from_be_bytes(key[8..].try_into().unwrap());
    Some((LogId(log), Lsn(lsn)))
}

const DIRECTORY_PREFIX: u8 = b'd';
const STORE_META_PREFIX: u8 = b's';
const LOG_META_PREFIX: u8 = b'l';
const PER_EPOCH_PREFIX: u8 = b'e';
const PARTITION_META_PREFIX: u8 = b'p';

pub const DIRECTORY_KEY_LEN: usize = 1 + 8 + 8 + 8;

/// `'d' | log_id | min_lsn | partition_id`. The min_lsn lives in the key so
/// that a single SeekForPrev lands on the partition containing a target
/// LSN. Lowering min_lsn therefore rewrites the key.
pub fn directory_key(log: LogId, min_lsn: Lsn, partition: PartitionId) -> [u8; DIRECTORY_KEY_LEN] {
    let mut key = [0u8; DIRECTORY_KEY_LEN];
    key[0] = DIRECTORY_PREFIX;
    key[1..9].copy_from_slice(&log.0.to_be_bytes());
    key[9..17].copy_from_slice(&min_lsn.0.to_be_bytes());
    key[17..25].copy_from_slice(&partition.to_be_bytes());
    key
}

pub struct DirectoryKey {
    pub log: LogId,
    pub min_lsn: Lsn,
    pub partition: PartitionId,
}

pub fn parse_directory_key(key: &[u8]) -> Option<DirectoryKey> {
    if key.len() != DIRECTORY_KEY_LEN || key[0] != DIRECTORY_PREFIX {
        return None;
    }
    Some(DirectoryKey {
        log: LogId(u64::from_be_bytes(key[1..9].try_into().unwrap())),
        min_lsn: Lsn(u64::from_be_bytes(key[9..17].try_into().unwrap())),
        partition: u64::from_be_bytes(key[17..25].try_into().unwrap()),
    })
}

pub fn directory_value(max_lsn: Lsn) -> [u8; 8] {
    max_lsn.0.to_be_bytes()
}

pub fn parse_directory_value(value: &[u8]) -> Option<Lsn> {
    Some(Lsn(u64::from_be_bytes(value.try_into().ok()?)))
}

pub fn store_meta_key(kind: u8) -> [u8; 2] {
    [STORE_META_PREFIX, kind]
}

pub fn log_meta_key(kind: u8, log: LogId) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[0] = LOG_META_PREFIX;
    key[1] = kind;
    key[2..].copy_from_slice(&log.0.to_be_bytes());
    key
}

pub fn per_epoch_key(log: LogId, epoch: Epoch) -> [u8; 13] {
    let mut key = [0u8; 13];
    key[0] = PER_EPOCH_PREFIX;
    key[1..9].copy_from_slice(&log.0.to_be_bytes());
    key[9..].copy_from_slice(&epoch.0.to_be_bytes());
    key
}

pub fn partition_meta_key(partition: PartitionId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = PARTITION_META_PREFIX;
    key[1..].copy_from_slice(&partition.to_be_bytes());
    key
}

pub fn parse_partition_meta_key(key: &[u8]) -> Option<PartitionId> {
    if key.len() != 9 || key[0] != PARTITION_META_PREFIX {
        return None;
    }
    Some(u64::from_be_bytes(key[1..].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logd_primitives::Esn;

    #[test]
    fn data_keys_sort_by_log_then_lsn() {
        let a = data_key(LogId(1), Lsn::from_parts(Epoch(2), Esn(100)));
        let b = data_key(LogId(1), Lsn::from_parts(Epoch(3), Esn(1)));
        let c = data_key(LogId(2), Lsn::from_parts(Epoch(1), Esn(1)));
        assert!(a < b && b < c);
    }

    #[test]
    fn directory_keys_sort_by_log_then_min_lsn() {
        let a = directory_key(LogId(1), Lsn(100), 7);
        let b = directory_key(LogId(1), Lsn(200), 3);
        let c = directory_key(LogId(2), Lsn(1), 1);
        assert!(a < b && b < c);
        let parsed = parse_directory_key(&b).unwrap();
        assert_eq!(parsed.log, LogId(1));
        assert_eq!(parsed.min_lsn, Lsn(200));
        assert_eq!(parsed.partition, 3);
    }

    #[test]
    fn key_prefixes_are_disjoint() {
        // Directory, log-meta, per-epoch and partition-meta keys must never
        // collide in the shared metadata column family.
        let prefixes =
            [DIRECTORY_PREFIX, STORE_META_PREFIX, LOG_META_PREFIX, PER_EPOCH_PREFIX, PARTITION_META_PREFIX];
        for (i, a) in prefixes.iter().enumerate() {
            for b in &prefixes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
