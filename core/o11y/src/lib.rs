pub mod metrics;
pub mod testonly;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter: info for everything, debug for our own targets can be
/// requested with RUST_LOG.
pub const DEFAULT_RUST_LOG: &str = "info";

/// Installs the global tracing subscriber for the server binary.
pub fn init_subscriber(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { DEFAULT_RUST_LOG })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
