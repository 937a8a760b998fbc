//! Library code never installs a global subscriber — it only emits through `tracing`'s macros.
//! [`init_tracing`] is offered for binaries and tests that want a default one
//! (`tracing_subscriber::fmt::init()` once at the top of a test).

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing_subscriber::fmt` subscriber honouring `RUST_LOG`, once per process.
/// Safe to call from multiple tests; later calls are no-ops.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
