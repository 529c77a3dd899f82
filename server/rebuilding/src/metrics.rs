use logd_o11y::metrics::{try_create_int_counter, try_create_int_gauge, IntCounter, IntGauge};
use std::sync::LazyLock;

pub(crate) static RECORDS_READ: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_rebuilding_records_read", "Records read by rebuilding batches")
        .unwrap()
});

pub(crate) static MALFORMED_RECORDS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_rebuilding_malformed_records", "Malformed records seen by rebuilding")
        .unwrap()
});

pub(crate) static CHUNKS_REPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_rebuilding_chunks_replicated", "Chunks re-replicated by this donor")
        .unwrap()
});

pub(crate) static SET_CONTAINS_MYSELF: LazyLock<IntGauge> = LazyLock::new(|| {
    try_create_int_gauge(
        "logd_rebuilding_set_contains_myself",
        "Shards of this node currently in the rebuilding set",
    )
    .unwrap()
});

pub(crate) static GLOBAL_WINDOW_SLIDES: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_rebuilding_global_window_slides", "Global window slides").unwrap()
});
