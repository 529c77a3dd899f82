//! Rebuilding: re-replication of records that lived on failed or drained
//! shards. Driven by the event-log replicated state machine, which every
//! node folds into the same rebuilding set; donors stream their copies of
//! affected records to the surviving copyset members.

pub mod coordinator;
pub mod event_log;
mod metrics;
pub mod planner;
pub mod read_task;
pub mod shard_rebuilding;
pub mod types;

pub use coordinator::RebuildingCoordinator;
pub use event_log::{
    EventLogRebuildingSet, EventLogRecord, EventLogStateMachine, EventLogWriter,
};
pub use planner::{HistoricalMetadataSource, RebuildingPlan, RebuildingPlanner};
pub use read_task::{ChunkData, ReadContext, RebuildingReadFilter, RebuildingReadStorageTask};
pub use shard_rebuilding::{ChunkRereplicator, ShardRebuilding};
pub use types::{AuthoritativeStatus, DataClass, RebuildingMode, RebuildingNodeInfo, RebuildingSet};
