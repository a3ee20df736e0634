//! Shared tracing setup for the gridwatch binaries.

use std::env::var;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber at `INFO`, overridable through `RUST_LOG`.
///
/// `RUST_LOG_FORMAT=json` switches to one JSON object per event, which is what
/// the log shippers in front of the service expect.
pub fn init_tracing() {
    initialize_tracing(LevelFilter::INFO);
}

/// Like [`init_tracing`] but quiet by default and safe to call repeatedly.
pub fn init_test_tracing() {
    let env_filter =
        EnvFilter::builder().with_default_directive(LevelFilter::WARN.into()).from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).with_test_writer().try_init();
}

fn initialize_tracing(level: LevelFilter) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT").unwrap_or_default();

    let log_layer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(env_filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().compact().with_target(true).with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}
