use crate::db::LogsDb;
use crate::settings::LogsDbSettings;
use logd_primitives::{RecordTimestamp, ShardIndex, Status};
use std::path::Path;
use std::sync::Arc;

/// All LogsDB shards of one storage node, opened side by side under
/// `<base>/shard<idx>`.
pub struct ShardedLogsDb {
    shards: Vec<Arc<LogsDb>>,
}

impl ShardedLogsDb {
    pub fn open(
        base: &Path,
        num_shards: ShardIndex,
        settings: &LogsDbSettings,
        now: RecordTimestamp,
    ) -> Result<ShardedLogsDb, Status> {
        let mut shards = Vec::with_capacity(num_shards as usize);
        for idx in 0..num_shards {
            let path = base.join(format!("shard{}", idx));
            shards.push(Arc::new(LogsDb::open(&path, idx, settings.clone(), now)?));
        }
        Ok(ShardedLogsDb { shards })
    }

    pub fn from_shards(shards: Vec<Arc<LogsDb>>) -> ShardedLogsDb {
        ShardedLogsDb { shards }
    }

    pub fn num_shards(&self) -> ShardIndex {
        self.shards.len() as ShardIndex
    }

    pub fn by_index(&self, idx: ShardIndex) -> Option<&Arc<LogsDb>> {
        self.shards.get(idx as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardIndex, &Arc<LogsDb>)> {
        self.shards.iter().enumerate().map(|(i, s)| (i as ShardIndex, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_requested_number_of_shards() {
        let dir = tempfile::tempdir().unwrap();
        let sharded =
            ShardedLogsDb::open(dir.path(), 3, &LogsDbSettings::test(), RecordTimestamp(1000))
                .unwrap();
        assert_eq!(sharded.num_shards(), 3);
        assert!(sharded.by_index(2).is_some());
        assert!(sharded.by_index(3).is_none());
        for (idx, shard) in sharded.iter() {
            assert_eq!(shard.shard_idx(), idx);
        }
    }
}
