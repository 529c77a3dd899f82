use logd_o11y::metrics::{
    try_create_histogram, try_create_int_counter, try_create_int_counter_vec, Histogram,
    IntCounter, IntCounterVec,
};
use std::sync::LazyLock;

pub(crate) static CONNECTIONS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_net_connections_accepted", "Accepted client connections").unwrap()
});

pub(crate) static HANDSHAKES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_net_handshakes_completed", "Completed HELLO/ACK handshakes")
        .unwrap()
});

pub(crate) static SOCKETS_CLOSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    try_create_int_counter_vec("logd_net_sockets_closed", "Sockets closed, by reason", &["reason"])
        .unwrap()
});

pub(crate) static SEND_NOBUFS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_net_send_nobufs",
        "Sends rejected because the worker's outgoing byte bound was hit",
    )
    .unwrap()
});

pub(crate) static CHECKSUM_MISMATCH: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_net_protocol_checksum_mismatch", "Frames failing checksum verification")
        .unwrap()
});

pub(crate) static FLOW_GROUPS_RUN_TIME: LazyLock<Histogram> = LazyLock::new(|| {
    try_create_histogram("logd_net_flow_groups_run_seconds", "Duration of run_flow_groups passes")
        .unwrap()
});

pub(crate) static FLOW_GROUPS_DEADLINE_EXCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_net_flow_groups_deadline_exceeded",
        "run_flow_groups passes that yielded to the event loop and rescheduled",
    )
    .unwrap()
});
