use logd_o11y::metrics::{try_create_int_counter, IntCounter};
use std::sync::LazyLock;

pub(crate) static GOSSIPS_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_gossip_sent", "Gossip messages sent").unwrap()
});

pub(crate) static GOSSIPS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_gossip_received", "Gossip messages received").unwrap()
});

pub(crate) static GOSSIPS_REJECTED_SKEW: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_gossip_rejected_skew",
        "Gossips dropped because the sender's clock was too far off",
    )
    .unwrap()
});

pub(crate) static GOSSIPS_REJECTED_INSTANCE_ID: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_gossip_rejected_instance_id",
        "Gossips dropped because they carried a stale instance id",
    )
    .unwrap()
});

pub(crate) static NODE_ISOLATION_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_gossip_node_isolation_detected",
        "Times this node concluded it is isolated from the cluster",
    )
    .unwrap()
});
