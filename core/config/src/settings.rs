use std::time::Duration;

/// Process-wide runtime settings. Every field can be overridden from the
/// config file; defaults are production values.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of general worker threads.
    pub num_workers: usize,
    /// Capacity of each per-shard storage task queue, per worker.
    pub per_worker_storage_task_queue_size: usize,
    /// Maximum number of storage tasks a worker may have in flight per shard.
    pub max_inflight_storage_tasks: usize,

    /// Maximum number of record writes a storage thread passes to the local
    /// log store in one batch.
    pub write_batch_size: usize,
    /// Byte limit of one write batch.
    pub write_batch_bytes: usize,

    /// Upper bound on serialized bytes queued to all sockets of one worker,
    /// in megabytes. Exceeding it fails sends with NOBUFS.
    pub outbufs_mb_max_per_thread: usize,
    /// Per-socket outbuf limit, in kilobytes.
    pub outbuf_overflow_kb: usize,

    /// Timeout of a single TCP connection attempt.
    #[serde(with = "crate::serde_duration")]
    pub connect_timeout: Duration,
    /// Multiplier applied to connect_timeout after every failed attempt.
    pub connect_timeout_retry_multiplier: f64,
    /// Number of connection attempts before the socket is closed with
    /// CONNFAILED.
    pub connection_retries: usize,
    /// Time budget for the HELLO/ACK exchange after the TCP connection is
    /// established.
    #[serde(with = "crate::serde_duration")]
    pub handshake_timeout: Duration,

    /// Highest protocol version this node will negotiate.
    pub max_protocol: u16,
    /// Whether message bodies are checksummed on connections that support it.
    pub checksumming_enabled: bool,

    /// How long runFlowGroups may run before yielding to the event loop.
    #[serde(with = "crate::serde_duration")]
    pub flow_groups_run_yield_interval: Duration,
    /// Interval of the traffic shaper's meter refills.
    #[serde(with = "crate::serde_duration")]
    pub traffic_shaping_interval: Duration,

    /// Time budget of the metadata-log emptiness check performed before
    /// provisioning a log in the epoch store.
    #[serde(with = "crate::serde_duration")]
    pub check_metadata_log_empty_timeout: Duration,
    /// Test option: activated sequencers skip recovery.
    pub bypass_recovery: bool,
    /// Timeout of one epoch recovery attempt before the seal wave is retried.
    #[serde(with = "crate::serde_duration")]
    pub recovery_timeout: Duration,

    /// Total time the process may spend shutting down before it exits with
    /// a failure status.
    #[serde(with = "crate::serde_duration")]
    pub shutdown_timeout: Duration,
    /// Grace period before outstanding appenders are aborted on shutdown.
    #[serde(with = "crate::serde_duration")]
    pub shutdown_appender_grace: Duration,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            num_workers: 16,
            per_worker_storage_task_queue_size: 512,
            max_inflight_storage_tasks: 256,
            write_batch_size: 32,
            write_batch_bytes: 1024 * 1024,
            outbufs_mb_max_per_thread: 512,
            outbuf_overflow_kb: 32 * 1024,
            connect_timeout: Duration::from_millis(100),
            connect_timeout_retry_multiplier: 3.0,
            connection_retries: 4,
            handshake_timeout: Duration::from_secs(1),
            max_protocol: crate::settings::MAX_PROTOCOL_DEFAULT,
            checksumming_enabled: true,
            flow_groups_run_yield_interval: Duration::from_millis(2),
            traffic_shaping_interval: Duration::from_millis(10),
            check_metadata_log_empty_timeout: Duration::from_secs(30),
            bypass_recovery: false,
            recovery_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(120),
            shutdown_appender_grace: Duration::from_secs(10),
        }
    }
}

/// Default for `Settings::max_protocol`; matches the network crate's
/// MAX_PROTOCOL_SUPPORTED. Deployments clamp it down during rollouts.
pub const MAX_PROTOCOL_DEFAULT: u16 = 5;

impl Settings {
    pub fn test() -> Settings {
        Settings {
            num_workers: 2,
            connect_timeout: Duration::from_millis(10),
            handshake_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            ..Settings::default()
        }
    }
}

#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    /// How often a node gossips.
    #[serde(with = "crate::serde_duration")]
    pub gossip_interval: Duration,
    /// Number of missed gossip intervals after which a node is declared dead.
    pub gossip_failure_threshold: u32,
    /// How long a node stays in the suspect state after coming back.
    #[serde(with = "crate::serde_duration")]
    pub suspect_duration: Duration,
    /// How long to wait for a GET_CLUSTER_STATE reply while bootstrapping
    /// before falling back to everyone-alive.
    #[serde(with = "crate::serde_duration")]
    pub gcs_wait_duration: Duration,
    /// Minimum gossips received before failure detection is trusted.
    pub min_gossips_for_stable_state: u32,
    /// Gossips whose send time deviates from local time by more than this
    /// are dropped.
    #[serde(with = "crate::serde_duration")]
    pub gossip_time_skew_threshold: Duration,
}

impl Default for GossipSettings {
    fn default() -> GossipSettings {
        GossipSettings {
            gossip_interval: Duration::from_millis(100),
            gossip_failure_threshold: 30,
            suspect_duration: Duration::from_secs(10),
            gcs_wait_duration: Duration::from_secs(1),
            min_gossips_for_stable_state: 3,
            gossip_time_skew_threshold: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RebuildingSettings {
    /// Restarts of per-shard rebuilding triggered by event-log deltas are
    /// collapsed within this grace period.
    #[serde(with = "crate::serde_duration")]
    pub rebuilding_restarts_grace_period: Duration,
    /// Width of the global timestamp window donors are allowed to read
    /// ahead of the slowest donor. `None` disables windowing.
    #[serde(default, with = "crate::serde_duration::option")]
    pub global_window: Option<Duration>,
    /// Byte budget of one rebuilding read batch.
    pub max_batch_bytes: usize,
    /// Time budget of one rebuilding read batch.
    #[serde(with = "crate::serde_duration")]
    pub max_batch_time: Duration,
    /// Malformed records tolerated per shard before rebuilding stalls with
    /// a permanent error.
    pub max_malformed_records_to_tolerate: usize,
    /// Whether dirty time ranges found after an unclean shutdown are
    /// published for mini-rebuilding.
    pub rebuild_dirty_shards: bool,
    /// Whether SHARD_NEEDS_REBUILD may carry a conditional version.
    pub allow_conditional_rebuilding_restarts: bool,
}

impl Default for RebuildingSettings {
    fn default() -> RebuildingSettings {
        RebuildingSettings {
            rebuilding_restarts_grace_period: Duration::from_secs(20),
            global_window: None,
            max_batch_bytes: 10 * 1024 * 1024,
            max_batch_time: Duration::from_millis(1000),
            max_malformed_records_to_tolerate: 1000,
            rebuild_dirty_shards: true,
            allow_conditional_rebuilding_restarts: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, back);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"num_workers": 4}"#).unwrap();
        assert_eq!(settings.num_workers, 4);
        assert_eq!(settings.write_batch_size, Settings::default().write_batch_size);
    }
}
