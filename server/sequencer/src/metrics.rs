use logd_o11y::metrics::{try_create_int_counter, IntCounter};
use std::sync::LazyLock;

pub(crate) static ACTIVATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_sequencer_activations", "Completed sequencer activations").unwrap()
});

pub(crate) static ACTIVATION_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_sequencer_activation_failures", "Failed sequencer activations")
        .unwrap()
});

pub(crate) static INCOMPATIBLE_METADATA: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_sequencer_activations_incompatible_metadata",
        "Activations that proceeded despite metadata not matching the local config",
    )
    .unwrap()
});

pub(crate) static PREEMPTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_sequencer_preemptions", "Sequencer preemptions observed").unwrap()
});

pub(crate) static RECOVERY_SCHEDULED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("logd_sequencer_recovery_scheduled", "Log recoveries scheduled").unwrap()
});

pub(crate) static GRACEFUL_DEFERRED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_sequencer_graceful_reactivation_deferred",
        "Graceful reactivations deferred until the previous epoch drained",
    )
    .unwrap()
});

pub(crate) static METADATA_INCONSISTENCY: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_sequencer_activation_failed_metadata_inconsistency",
        "Activations that found the epoch store empty but the metadata log not",
    )
    .unwrap()
});

pub(crate) static METADATA_CHECK_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "logd_sequencer_metadata_log_check_timeouts",
        "Metadata-log emptiness checks that timed out",
    )
    .unwrap()
});
