use logd_o11y::metrics::{try_create_int_counter, IntCounter};
use std::sync::LazyLock;

pub(crate) static QUEUE_CANT_FIND_ONCE: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_storage_queue_cant_find_once",
        "Prioritized-queue reads that needed one reverse scan to find an item",
    )
    .unwrap()
});

pub(crate) static QUEUE_CANT_FIND_REPEATEDLY: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_storage_queue_cant_find_repeatedly",
        "Prioritized-queue reads that looped more than once to find an item",
    )
    .unwrap()
});

pub(crate) static TASKS_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_storage_tasks_executed", "Storage tasks executed").unwrap()
});

pub(crate) static TASKS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_storage_tasks_dropped", "Storage tasks dropped under overload")
        .unwrap()
});
