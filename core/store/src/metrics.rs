use logd_o11y::metrics::{
    try_create_int_counter, IntCounter,
};
use std::sync::LazyLock;

pub(crate) static RECORDS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_logsdb_records_written", "Records written to LogsDB").unwrap()
});

pub(crate) static PARTITIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_logsdb_partitions_created", "LogsDB partitions created").unwrap()
});

pub(crate) static PARTITIONS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_logsdb_partitions_dropped", "LogsDB partitions dropped by retention")
        .unwrap()
});

pub(crate) static FAIL_SAFE_ENTERED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_logsdb_fail_safe_entered",
        "Times a LogsDB shard entered fail-safe mode after a rocksdb error",
    )
    .unwrap()
});
