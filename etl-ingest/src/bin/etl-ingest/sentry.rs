use etl_config::Environment;
use etl_config::shared::SentryConfig;
use etl_ingest::error::EtlError;
use secrecy::ExposeSecret;
use sentry::integrations::panic::PanicIntegration;
use sentry::protocol::{Event, Exception};
use sentry::types::Uuid;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;
use tracing::info;

use crate::APP_VERSION_ENV_NAME;
use crate::error::{IngestError, IngestResult};

/// Initializes Sentry when a DSN is configured.
///
/// Events are tagged with `service=etl-ingest` and the `APP_VERSION` of the build, and panics
/// are reported through the panic integration.
pub fn init(config: Option<&SentryConfig>) -> IngestResult<Option<sentry::ClientInitGuard>> {
    let Some(config) = config else {
        info!("sentry is not configured, errors are only logged");
        return Ok(None);
    };

    let environment = Environment::load().map_err(IngestError::config)?;
    let dsn = config
        .dsn
        .expose_secret()
        .parse()
        .map_err(IngestError::config)?;

    let guard = sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        environment: Some(environment.as_str().into()),
        integrations: vec![Arc::new(PanicIntegration::new())],
        attach_stacktrace: true,
        ..Default::default()
    });

    sentry::configure_scope(|scope| {
        scope.set_tag("service", "etl-ingest");
        if let Ok(version) = std::env::var(APP_VERSION_ENV_NAME) {
            scope.set_tag("version", version);
        }
    });
    info!(%environment, "sentry initialized");

    Ok(Some(guard))
}

/// Reports a run-level error.
pub fn capture_error(err: &IngestError) -> Uuid {
    let exceptions = match err.as_etl_error() {
        Some(etl_err) => etl_exceptions(etl_err),
        None => source_chain_exceptions(err),
    };

    sentry::capture_event(build_event(exceptions, err.backtrace(), None))
}

/// Reports the failure of one file, tagged with its key.
pub fn capture_file_error(file_key: &str, err: &EtlError) -> Uuid {
    sentry::capture_event(build_event(
        etl_exceptions(err),
        err.backtrace(),
        Some(file_key),
    ))
}

fn build_event(
    mut exceptions: Vec<Exception>,
    backtrace: Option<&Backtrace>,
    file_key: Option<&str>,
) -> Event<'static> {
    let stacktrace = backtrace
        .filter(|backtrace| backtrace.status() == BacktraceStatus::Captured)
        .and_then(|backtrace| {
            sentry::integrations::backtrace::parse_stacktrace(&backtrace.to_string())
        });
    if let Some(exception) = exceptions.first_mut() {
        exception.stacktrace = stacktrace;
    }

    let mut event = Event {
        exception: exceptions.into(),
        level: sentry::Level::Error,
        ..Default::default()
    };
    if let Some(file_key) = file_key {
        event.tags.insert("file_key".to_string(), file_key.to_string());
    }

    event
}

/// One exception per leaf error, typed by its [`ErrorKind`](etl_ingest::error::ErrorKind).
fn etl_exceptions(err: &EtlError) -> Vec<Exception> {
    match err.errors() {
        Some(errors) => errors.iter().flat_map(etl_exceptions).collect(),
        None => vec![Exception {
            ty: format!("{:?}", err.kind()),
            value: Some(err.to_string()),
            ..Default::default()
        }],
    }
}

/// One exception per error of the source chain, root cause first.
fn source_chain_exceptions(err: &IngestError) -> Vec<Exception> {
    let chain = std::iter::successors(Some(err as &(dyn std::error::Error + 'static)), |err| {
        (*err).source()
    });
    let mut exceptions: Vec<Exception> = chain
        .map(|err| Exception {
            ty: debug_type_name(err),
            value: Some(err.to_string()),
            ..Default::default()
        })
        .collect();
    exceptions.reverse();

    exceptions
}

/// Leading identifier of the `Debug` output, e.g. `Migration` for `Migration(..)`.
fn debug_type_name(err: &dyn std::error::Error) -> String {
    let debug = format!("{err:?}");
    let name = debug
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == ':'))
        .next()
        .unwrap_or_default();

    if name.is_empty() {
        "Error".to_string()
    } else {
        name.to_string()
    }
}
