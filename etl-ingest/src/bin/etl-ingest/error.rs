use etl_ingest::error::EtlError;
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt::{self, Write};
use thiserror::Error;

/// Result type for the ingestion binary.
pub type IngestResult<T> = Result<T, IngestError>;

/// Backtrace captured where a process-level error was created.
///
/// Wrapped so that thiserror does not treat the field as a provided backtrace.
pub struct Captured(Backtrace);

impl Captured {
    fn now() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Error type of the `etl-ingest` binary.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error("configuration error: {0}")]
    Config(#[source] Box<dyn Error + Send + Sync>, Captured),

    #[error("migration error: {0}")]
    Migration(#[source] sqlx::Error, Captured),

    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error, Captured),

    /// Some files of a run failed. Each of them was reported on its own.
    #[error("{0} file(s) failed to ingest")]
    FilesFailed(usize),
}

impl IngestError {
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        IngestError::Config(Box::new(err), Captured::now())
    }

    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Etl(_) => "ingestion error",
            IngestError::Config(..) => "configuration error",
            IngestError::Migration(..) => "migration error",
            IngestError::Io(..) => "i/o error",
            IngestError::FilesFailed(_) => "file errors",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            IngestError::Etl(err) => err.backtrace(),
            IngestError::Config(_, captured)
            | IngestError::Migration(_, captured)
            | IngestError::Io(_, captured) => Some(&captured.0),
            IngestError::FilesFailed(_) => None,
        }
    }

    pub fn as_etl_error(&self) -> Option<&EtlError> {
        match self {
            IngestError::Etl(err) => Some(err),
            _ => None,
        }
    }

    /// Renders the error, its causes and, with `RUST_BACKTRACE` set, its backtrace for stderr.
    pub fn render_report(&self) -> String {
        let mut out = format!("etl-ingest failed\ncategory: {}\nerror: {self}\n", self.category());

        // Aggregated errors already list every member in their display.
        let aggregated = self.as_etl_error().is_some_and(|err| err.errors().is_some());
        if !aggregated {
            let causes = std::iter::successors(self.source(), |err| (*err).source());
            for (index, cause) in causes.enumerate() {
                let _ = writeln!(out, "cause {}: {cause}", index + 1);
            }
        }

        let backtrace_enabled = matches!(
            std::env::var("RUST_BACKTRACE").as_deref(),
            Ok("1") | Ok("full")
        );
        if let Some(backtrace) = self.backtrace().filter(|_| backtrace_enabled) {
            let _ = writeln!(out, "backtrace:\n{}", backtrace.to_string().trim_end());
        }

        out
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Migration(err, Captured::now())
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Io(err, Captured::now())
    }
}
