// Tracing setup for binaries and test harnesses embedding the cache.
// The library only emits events; it never installs a subscriber by itself.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a fmt subscriber filtered at `level` for this crate's events.
///
/// `RUST_LOG` takes precedence when set. Returns `false` if a global
/// subscriber was already installed (e.g. by the host application or an
/// earlier test).
pub fn init_tracing(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,tiercache={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// Same as [`init_tracing`], writing through the test harness's captured output.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tiercache=debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
