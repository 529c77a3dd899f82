use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Index of a node in the cluster configuration.
pub type NodeIndex = u16;

/// Index of a shard (local log store instance) within a storage node.
pub type ShardIndex = u8;

/// Wave number of a STORE. The first wave is 1; waves sent by rebuilding
/// start over from 1 with the REBUILDING flag set.
pub type WaveNumber = u32;

/// Identifier of a LogsDB partition. Ids are assigned monotonically and
/// never reused, even after the partition is dropped.
pub type PartitionId = u64;

pub const PARTITION_INVALID: PartitionId = 0;

/// Id of an append-only log. The most significant bit distinguishes the
/// metadata log (which stores EpochMetaData records for its data log) from
/// the data log itself.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct LogId(pub u64);

impl LogId {
    pub const INVALID: LogId = LogId(0);
    const METADATA_BIT: u64 = 1 << 63;

    /// Largest valid data log id.
    pub const MAX: LogId = LogId(Self::METADATA_BIT - 1);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn is_metadata_log(self) -> bool {
        self.0 & Self::METADATA_BIT != 0
    }

    /// The metadata log companion of this data log.
    pub fn metadata_log(self) -> LogId {
        LogId(self.0 | Self::METADATA_BIT)
    }

    /// The data log this log belongs to. Identity for data logs.
    pub fn data_log(self) -> LogId {
        LogId(self.0 & !Self::METADATA_BIT)
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metadata_log() {
            write!(f, "M{}", self.data_log().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Epoch number of a log. Epochs are issued per log by the epoch store and
/// grow monotonically, including across sequencer failovers and restarts.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const INVALID: Epoch = Epoch(0);
    pub const MIN: Epoch = Epoch(1);
    /// Largest epoch a sequencer may activate with. Reaching it makes the
    /// log permanently unwritable (TOOBIG).
    pub const MAX: Epoch = Epoch(u32::MAX - 1);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a record within an epoch.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Esn(pub u32);

impl Esn {
    pub const INVALID: Esn = Esn(0);
    pub const MIN: Esn = Esn(1);
    pub const MAX: Esn = Esn(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn next(self) -> Esn {
        Esn(self.0 + 1)
    }
}

impl fmt::Debug for Esn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Log sequence number: `(epoch << 32) | esn`. Totally ordered; the order
/// is the order of records within a log.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
    /// Smallest valid record LSN.
    pub const OLDEST: Lsn = Lsn::from_parts(Epoch::MIN, Esn::MIN);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub const fn from_parts(epoch: Epoch, esn: Esn) -> Lsn {
        Lsn(((epoch.0 as u64) << 32) | esn.0 as u64)
    }

    pub const fn epoch(self) -> Epoch {
        Epoch((self.0 >> 32) as u32)
    }

    pub const fn esn(self) -> Esn {
        Esn(self.0 as u32)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The next LSN, saturating at MAX.
    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}n{}", self.epoch().0, self.esn().0)
    }
}

/// One shard of one storage node.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: ShardIndex,
}

impl ShardId {
    pub const fn new(node: NodeIndex, shard: ShardIndex) -> ShardId {
        ShardId { node, shard }
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:S{}", self.node, self.shard)
    }
}

/// Identity of a node together with its config generation. A bumped
/// generation means the node was replaced (same slot, new instance); sockets
/// to the old generation must be closed.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct NodeId {
    pub index: NodeIndex,
    pub generation: u16,
}

impl NodeId {
    pub const fn new(index: NodeIndex, generation: u16) -> NodeId {
        NodeId { index, generation }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:G{}", self.index, self.generation)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.index)
    }
}

/// Server-side per-worker handle for an accepted client connection. Ids are
/// assigned by the owning worker's Sender and are never reused for the
/// lifetime of the worker.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const INVALID: ClientId = ClientId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Wall-clock milliseconds captured at process start. Used by peers to tell
/// a restarted process from the one they were talking to before.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize,
)]
pub struct ServerInstanceId(pub u64);

/// Id correlating a request with its reply on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const INVALID: RequestId = RequestId(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_packing() {
        let lsn = Lsn::from_parts(Epoch(7), Esn(42));
        assert_eq!(lsn.epoch(), Epoch(7));
        assert_eq!(lsn.esn(), Esn(42));
        assert_eq!(lsn.0, (7u64 << 32) | 42);
        assert_eq!(lsn.to_string(), "e7n42");
    }

    #[test]
    fn lsn_order_is_epoch_then_esn() {
        assert!(Lsn::from_parts(Epoch(1), Esn(u32::MAX)) < Lsn::from_parts(Epoch(2), Esn(1)));
        assert!(Lsn::from_parts(Epoch(2), Esn(1)) < Lsn::from_parts(Epoch(2), Esn(2)));
        assert!(Lsn::INVALID < Lsn::OLDEST);
    }

    #[test]
    fn metadata_log_ids() {
        let log = LogId(1);
        let meta = log.metadata_log();
        assert!(!log.is_metadata_log());
        assert!(meta.is_metadata_log());
        assert_eq!(meta.data_log(), log);
        assert_eq!(meta.metadata_log(), meta);
        assert_eq!(meta.to_string(), "M1");
    }
}
