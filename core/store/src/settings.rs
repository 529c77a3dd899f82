use std::time::Duration;

/// Tuning knobs of a LogsDB shard. Loaded once at open; the maintenance
/// loop rereads them on every pass.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogsDbSettings {
    /// Target time span covered by one partition. The latest partition is
    /// retired once its age exceeds this.
    #[serde(with = "logd_config::serde_duration")]
    pub partition_duration: Duration,
    /// Retire the latest partition once its data size exceeds this.
    pub partition_size_limit: u64,
    /// Retire the latest partition once it accumulates this many L0 files.
    pub partition_file_limit: u64,
    /// Starting timestamps of new partitions are rounded down to a multiple
    /// of this, so that restarts do not produce pathological short
    /// partitions.
    #[serde(with = "logd_config::serde_duration")]
    pub partition_timestamp_granularity: Duration,

    /// Partial compactions pick partitions with at least this many small
    /// files.
    pub partial_compaction_file_num_threshold: u64,
    /// A file is "small" for partial compaction purposes below this size.
    pub partial_compaction_file_size_threshold: u64,

    /// Fraction of disk space that must stay free; below it the store
    /// reports LOW_ON_SPC, at half of it NOSPC.
    pub free_disk_space_threshold_low: f64,
}

impl Default for LogsDbSettings {
    fn default() -> LogsDbSettings {
        LogsDbSettings {
            partition_duration: Duration::from_secs(15 * 60),
            partition_size_limit: 6 * 1024 * 1024 * 1024,
            partition_file_limit: 200,
            partition_timestamp_granularity: Duration::from_secs(5),
            partial_compaction_file_num_threshold: 10,
            partial_compaction_file_size_threshold: 2 * 1024 * 1024,
            free_disk_space_threshold_low: 0.2,
        }
    }
}

impl LogsDbSettings {
    pub fn test() -> LogsDbSettings {
        LogsDbSettings {
            partition_duration: Duration::from_secs(60),
            partition_size_limit: 16 * 1024 * 1024,
            partition_file_limit: 16,
            partition_timestamp_granularity: Duration::ZERO,
            ..LogsDbSettings::default()
        }
    }
}
