/// Structured logging infrastructure
///
/// All library code logs through `tracing`; this module only wires up the
/// subscriber for binaries and tests. Level filtering is environment-based
/// (`RUST_LOG`) with a sane default.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging with environment-based filtering.
///
/// Targets stderr, defaults to `info` globally and `debug` for vulcan
/// internals when `RUST_LOG` is unset.
pub fn init_logging() {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("vulcan=debug".parse().unwrap())
        .add_directive("info".parse().unwrap());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Logging system initialized");
}

/// Initialize logging for tests with captured output.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
