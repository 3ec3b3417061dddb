//! Tracing/logging initialisation for agentyard binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is not set
///   (e.g. `"agentyard_daemon=info"`).
/// * `log_json` -- emit one JSON object per event instead of the
///   human-readable format.
///
/// Calling this twice is harmless: the second registration fails and is
/// ignored, which keeps test binaries that initialise logging per test happy.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let result = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Build the default filter directive for a crate at a given level.
pub fn default_filter(crate_name: &str, level: &str) -> String {
    format!("{}={level}", crate_name.replace('-', "_"))
}
