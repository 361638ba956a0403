use std::sync::Once;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

static TEST_TRACING: Once = Once::new();

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install the global tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global subscriber for a service.
///
/// Every event carries the `service` name as a top-level field through the root span
/// returned to the caller; keep the guard alive for the lifetime of the process.
pub fn init_tracing(service: &'static str, format: LogFormat) -> Result<tracing::span::EnteredSpan, TracingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).flatten_event(true))
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()?,
    }

    Ok(tracing::info_span!("service", service).entered())
}

/// Installs a subscriber writing through the test harness, once per test binary.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
