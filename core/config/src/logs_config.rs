use logd_primitives::{LogId, ReplicationProperty};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct LogAttributes {
    pub replication: ReplicationProperty,
    /// Target number of shards in each epoch's nodeset.
    pub nodeset_size: usize,
    /// Sequencer sliding-window size: appends in flight per epoch.
    pub max_writes_in_flight: usize,
    /// Records older than this are eligible for trimming by retention.
    /// `None` means keep forever.
    #[serde(default, with = "crate::serde_duration::option")]
    pub backlog: Option<Duration>,
}

impl LogAttributes {
    pub fn test_default() -> LogAttributes {
        LogAttributes {
            replication: ReplicationProperty::simple(2),
            nodeset_size: 3,
            max_writes_in_flight: 256,
            backlog: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

/// The set of logs this cluster hosts. Metadata logs are implicit: every
/// data log has one and it inherits the data log's attributes with the
/// metadata nodeset.
#[derive(Clone, PartialEq, Eq, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LogsConfig {
    logs: BTreeMap<u64, LogAttributes>,
}

impl LogsConfig {
    pub fn new(logs: BTreeMap<u64, LogAttributes>) -> LogsConfig {
        LogsConfig { logs }
    }

    pub fn get(&self, log: LogId) -> Option<&LogAttributes> {
        self.logs.get(&log.data_log().0)
    }

    pub fn contains(&self, log: LogId) -> bool {
        self.get(log).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogId, &LogAttributes)> {
        self.logs.iter().map(|(id, attrs)| (LogId(*id), attrs))
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_log_resolves_to_data_log_attributes() {
        let cfg = LogsConfig::new([(1, LogAttributes::test_default())].into_iter().collect());
        assert!(cfg.contains(LogId(1)));
        assert!(cfg.contains(LogId(1).metadata_log()));
        assert!(!cfg.contains(LogId(2)));
    }
}
