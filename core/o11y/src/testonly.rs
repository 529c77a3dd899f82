use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a test subscriber printing to the captured test output. Safe to
/// call from every test; only the first call takes effect.
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
