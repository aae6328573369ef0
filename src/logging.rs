use tracing_subscriber::{fmt, EnvFilter};

/// Env var switching log output to JSON lines (`ARKWALLET_LOG_JSON=1`).
pub const LOG_JSON_ENV: &str = "ARKWALLET_LOG_JSON";

/// Install the global subscriber. `RUST_LOG` filters, default `info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var(LOG_JSON_ENV)
        .map(|value| value == "1")
        .unwrap_or(false);

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Test-friendly subscriber: captures output through the test harness writer.
pub fn init_test_logging() {
    let _ = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
