pub mod epoch_metadata;
pub mod priority;
pub mod status;
pub mod time;
pub mod types;

pub use epoch_metadata::{EpochMetaData, NodeLocationScope, ReplicationProperty};
pub use priority::{Priority, TrafficClass};
pub use status::Status;
pub use time::{intervals_intersect_range, RecordTimeInterval, RecordTimestamp};
pub use types::{
    ClientId, Epoch, Esn, LogId, Lsn, NodeId, NodeIndex, PartitionId, RequestId,
    ServerInstanceId, ShardId, ShardIndex, WaveNumber,
};
