//! Error types and failure classification for the ingestion pipeline.
//!
//! Every [`EtlError`] carries an [`ErrorKind`], and every kind belongs to exactly one
//! [`FailureClass`]. Retry decisions are made on the class, which is fixed where the store
//! call is made (SQLSTATE codes for Postgres, [`classify_store_message`] for clients that only
//! report free text). Business logic never inspects error messages.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result alias used across the crate.
pub type EtlResult<T> = Result<T, EtlError>;

/// Retry-relevant category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// A concurrent writer won; the same statement may succeed on retry.
    Conflict,
    /// The store or network was temporarily unable to serve the request.
    Transient,
    /// Retrying the unchanged request cannot succeed.
    Permanent,
    /// Input, configuration or schema do not satisfy a requirement.
    Validation,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Conflict | FailureClass::Transient)
    }
}

/// Specific categories of failures raised while ingesting a file.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Input & configuration
    InvalidEvent,
    ConfigError,
    MissingConfiguration,

    // Schema
    SchemaIncompatible,
    StoreObjectMissing,
    DuplicateColumn,

    // Store concurrency
    StoreConflict,
    StoreLockTimeout,

    // Store availability
    StoreConnectionFailed,
    StoreUnavailable,

    // Store statement errors
    StoreQueryFailed,
    StoreSyntaxError,
    PermissionDenied,
    UniqueViolation,

    // Data
    ConversionError,
    InvalidData,
    ValidationError,

    // IO & serialization
    IoError,
    SerializationError,
    DeserializationError,

    // Side channels
    BlobStoreError,
    BlobNotFound,
    NotificationFailed,

    // Workflow
    InvalidState,
    RetriesExhausted,

    Unknown,
}

impl ErrorKind {
    /// Returns the [`FailureClass`] this kind belongs to.
    pub fn class(self) -> FailureClass {
        match self {
            ErrorKind::StoreConflict | ErrorKind::StoreLockTimeout => FailureClass::Conflict,

            ErrorKind::StoreConnectionFailed
            | ErrorKind::StoreUnavailable
            | ErrorKind::IoError
            | ErrorKind::BlobStoreError
            | ErrorKind::NotificationFailed => FailureClass::Transient,

            ErrorKind::InvalidEvent
            | ErrorKind::ConfigError
            | ErrorKind::MissingConfiguration
            | ErrorKind::SchemaIncompatible
            | ErrorKind::DuplicateColumn
            | ErrorKind::UniqueViolation
            | ErrorKind::ConversionError
            | ErrorKind::InvalidData
            | ErrorKind::ValidationError
            | ErrorKind::DeserializationError => FailureClass::Validation,

            ErrorKind::StoreObjectMissing
            | ErrorKind::StoreQueryFailed
            | ErrorKind::StoreSyntaxError
            | ErrorKind::PermissionDenied
            | ErrorKind::SerializationError
            | ErrorKind::BlobNotFound
            | ErrorKind::InvalidState
            | ErrorKind::RetriesExhausted
            | ErrorKind::Unknown => FailureClass::Permanent,
        }
    }

    /// Picks the representative store kind for a class, used when only a class is known.
    pub fn for_store_class(class: FailureClass) -> ErrorKind {
        match class {
            FailureClass::Conflict => ErrorKind::StoreConflict,
            FailureClass::Transient => ErrorKind::StoreUnavailable,
            FailureClass::Permanent => ErrorKind::StoreQueryFailed,
            FailureClass::Validation => ErrorKind::ValidationError,
        }
    }
}

/// Main error type of the ingestion pipeline.
///
/// Either a single failure or an aggregate of several, for example one per file of a
/// reprocess run. An aggregate reports the kind of its first member.
#[derive(Debug, Clone)]
pub struct EtlError {
    repr: Box<Repr>,
}

#[derive(Debug, Clone)]
enum Repr {
    Failure(Failure),
    Aggregate(Vec<EtlError>),
}

#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

impl EtlError {
    #[track_caller]
    fn failure(
        kind: ErrorKind,
        description: &'static str,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        EtlError {
            repr: Box::new(Repr::Failure(Failure {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            })),
        }
    }

    #[track_caller]
    fn wrapping<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        EtlError::failure(kind, description, Some(detail.into()), Some(Arc::new(err)))
    }

    fn first_failure(&self) -> Option<&Failure> {
        match self.repr.as_ref() {
            Repr::Failure(failure) => Some(failure),
            Repr::Aggregate(errors) => errors.iter().find_map(EtlError::first_failure),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.first_failure()
            .map_or(ErrorKind::Unknown, |failure| failure.kind)
    }

    /// Returns the failure class of [`EtlError::kind`].
    pub fn class(&self) -> FailureClass {
        self.kind().class()
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn description(&self) -> &'static str {
        match self.repr.as_ref() {
            Repr::Failure(failure) => failure.description,
            Repr::Aggregate(_) => "multiple errors",
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr.as_ref() {
            Repr::Failure(failure) => failure.detail.as_deref(),
            Repr::Aggregate(errors) => errors.iter().find_map(EtlError::detail),
        }
    }

    /// Returns the aggregated errors, or [`None`] for a single failure.
    pub fn errors(&self) -> Option<&[EtlError]> {
        match self.repr.as_ref() {
            Repr::Failure(_) => None,
            Repr::Aggregate(errors) => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.first_failure()
            .map(|failure| failure.backtrace.as_ref())
    }

    /// Where the (first) failure was raised.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.first_failure().map(|failure| failure.location)
    }

    /// Attaches dynamic context to the static description. Aggregates are returned unchanged.
    pub fn with_detail(mut self, detail: impl Into<Cow<'static, str>>) -> Self {
        if let Repr::Failure(failure) = self.repr.as_mut() {
            failure.detail = Some(detail.into());
        }
        self
    }

    /// Attaches the originating error. Aggregates are returned unchanged.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let Repr::Failure(failure) = self.repr.as_mut() {
            failure.source = Some(Arc::new(source));
        }
        self
    }

    /// Builds an error from a store message that carries no structured code.
    #[track_caller]
    pub fn from_store_message(description: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ErrorKind::for_store_class(classify_store_message(&message));

        EtlError::failure(kind, description, Some(message.into()), None)
    }
}

/// Substrings, lowercase, that identify a failure class in free-text store messages.
const CONFLICT_MARKERS: &[&str] = &[
    "conflict",
    "concurrent",
    "serializ",
    "deadlock",
    "could not obtain lock",
    "lock not available",
    "lock timeout",
    "transaction aborted",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "temporarily",
    "try again",
    "too many",
    "reset by peer",
    "broken pipe",
    "shutting down",
    "502",
    "503",
    "504",
];

const VALIDATION_MARKERS: &[&str] = &[
    "violates",
    "mismatch",
    "cannot be cast",
    "out of range",
    "invalid input",
];

/// Classifies a free-text store error message.
///
/// Only for store clients that do not expose structured error codes. Conflict markers are
/// checked before transient ones so that lock waits are treated as conflicts.
pub fn classify_store_message(message: &str) -> FailureClass {
    let message = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| message.contains(marker));

    if contains_any(CONFLICT_MARKERS) {
        FailureClass::Conflict
    } else if contains_any(TRANSIENT_MARKERS) {
        FailureClass::Transient
    } else if contains_any(VALIDATION_MARKERS) {
        FailureClass::Validation
    } else {
        FailureClass::Permanent
    }
}

/// Maps a Postgres SQLSTATE code to an error kind and description.
pub fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        "40001" => (ErrorKind::StoreConflict, "Store serialization conflict"),
        "40P01" => (ErrorKind::StoreConflict, "Store deadlock detected"),
        "55P03" => (ErrorKind::StoreLockTimeout, "Store lock not available"),
        "23505" => (ErrorKind::UniqueViolation, "Store unique constraint violated"),
        "42501" => (ErrorKind::PermissionDenied, "Store permission denied"),
        "42P01" | "42703" | "3F000" => (ErrorKind::StoreObjectMissing, "Store object not found"),
        "42701" => (ErrorKind::DuplicateColumn, "Store column already exists"),
        "57014" => (ErrorKind::StoreUnavailable, "Store statement canceled"),
        "57P01" | "57P02" | "57P03" => (ErrorKind::StoreUnavailable, "Store shutting down"),
        _ => match code.get(..2) {
            Some("08") => (ErrorKind::StoreConnectionFailed, "Store connection failed"),
            Some("53") => (ErrorKind::StoreUnavailable, "Store resources exhausted"),
            Some("40") => (ErrorKind::StoreConflict, "Store transaction rolled back"),
            Some("23") => (ErrorKind::ValidationError, "Store constraint violated"),
            Some("22") => (ErrorKind::ConversionError, "Store data conversion failed"),
            Some("42") => (ErrorKind::StoreSyntaxError, "Store syntax or access error"),
            _ => (ErrorKind::StoreQueryFailed, "Store query failed"),
        },
    }
}

/// Errors are equal when they fail the same way, regardless of detail or location.
impl PartialEq for EtlError {
    fn eq(&self, other: &EtlError) -> bool {
        match (self.repr.as_ref(), other.repr.as_ref()) {
            (Repr::Failure(a), Repr::Failure(b)) => a.kind == b.kind,
            (Repr::Aggregate(a), Repr::Aggregate(b)) => a == b,
            _ => false,
        }
    }
}

/// Hashes kinds and static descriptions so that repeated failures group together.
impl Hash for EtlError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.repr.as_ref() {
            Repr::Failure(failure) => {
                failure.kind.hash(state);
                failure.description.hash(state);
            }
            Repr::Aggregate(errors) => errors.hash(state),
        }
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr.as_ref() {
            Repr::Failure(failure) => {
                write!(f, "[{:?}] {}", failure.kind, failure.description)?;
                let mut lines = failure.detail.as_deref().unwrap_or_default().lines();
                if let Some(first) = lines.next() {
                    write!(f, ": {first}")?;
                }
                lines.try_for_each(|line| write!(f, "\n  {line}"))
            }
            Repr::Aggregate(errors) => {
                write!(f, "{} errors", errors.len())?;
                for (position, error) in errors.iter().enumerate() {
                    // Continuation lines are indented past the "N. " prefix.
                    let rendered = error.to_string().replace('\n', "\n   ");
                    write!(f, "\n  {}. {rendered}", position + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for EtlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr.as_ref() {
            Repr::Failure(failure) => failure
                .source
                .as_deref()
                .map(|source| source as &(dyn error::Error + 'static)),
            Repr::Aggregate(errors) => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for EtlError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> EtlError {
        EtlError::failure(kind, description, None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> EtlError {
        EtlError::failure(kind, description, Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for EtlError
where
    E: Into<EtlError>,
{
    fn from(errors: Vec<E>) -> EtlError {
        let errors: Vec<EtlError> = errors.into_iter().map(Into::into).collect();

        match <[EtlError; 1]>::try_from(errors) {
            Ok([only]) => only,
            Err(errors) => EtlError {
                repr: Box::new(Repr::Aggregate(errors)),
            },
        }
    }
}

impl From<std::io::Error> for EtlError {
    #[track_caller]
    fn from(err: std::io::Error) -> EtlError {
        let kind = if err.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::BlobNotFound
        } else {
            ErrorKind::IoError
        };
        EtlError::wrapping(kind, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for EtlError {
    #[track_caller]
    fn from(err: serde_json::Error) -> EtlError {
        if err.is_io() {
            EtlError::wrapping(ErrorKind::IoError, "JSON I/O operation failed", err)
        } else {
            EtlError::wrapping(
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
                err,
            )
        }
    }
}

/// Classifies [`sqlx::Error`] by SQLSTATE for database errors and by variant otherwise.
impl From<sqlx::Error> for EtlError {
    #[track_caller]
    fn from(err: sqlx::Error) -> EtlError {
        use sqlx::Error as Sqlx;

        let (kind, description) = match &err {
            Sqlx::Database(db_err) => db_err.code().map_or_else(
                || {
                    let class = classify_store_message(db_err.message());
                    (ErrorKind::for_store_class(class), "Store query failed")
                },
                |code| classify_sqlstate(&code),
            ),
            Sqlx::Io(_) | Sqlx::Tls(_) | Sqlx::PoolTimedOut | Sqlx::PoolClosed | Sqlx::WorkerCrashed => {
                (ErrorKind::StoreConnectionFailed, "Store connection failed")
            }
            Sqlx::Configuration(_) => (ErrorKind::ConfigError, "Store configuration invalid"),
            Sqlx::RowNotFound => (ErrorKind::InvalidState, "Expected row not found"),
            Sqlx::ColumnNotFound(_)
            | Sqlx::ColumnDecode { .. }
            | Sqlx::Decode(_)
            | Sqlx::TypeNotFound { .. } => {
                (ErrorKind::ConversionError, "Store value decoding failed")
            }
            _ => (ErrorKind::StoreQueryFailed, "Store operation failed"),
        };

        EtlError::wrapping(kind, description, err)
    }
}

impl From<sqlx::migrate::MigrateError> for EtlError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> EtlError {
        EtlError::wrapping(ErrorKind::StoreQueryFailed, "Ledger migration failed", err)
    }
}

impl From<reqwest::Error> for EtlError {
    #[track_caller]
    fn from(err: reqwest::Error) -> EtlError {
        EtlError::wrapping(ErrorKind::NotificationFailed, "HTTP request failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl_error;

    #[test]
    fn message_classification_covers_every_class() {
        let cases = [
            ("Transaction conflict detected, please retry", FailureClass::Conflict),
            ("could not serialize access due to concurrent update", FailureClass::Conflict),
            ("deadlock detected", FailureClass::Conflict),
            ("canceling statement due to lock timeout", FailureClass::Conflict),
            ("Connection reset by peer", FailureClass::Transient),
            ("request timed out after 30s", FailureClass::Transient),
            ("Service Unavailable (503)", FailureClass::Transient),
            ("engine is temporarily overloaded, try again", FailureClass::Transient),
            ("too many connections for role", FailureClass::Transient),
            ("null value violates not-null constraint", FailureClass::Validation),
            ("type mismatch between NUMERIC(38, 10) and NUMERIC(20, 2)", FailureClass::Validation),
            ("syntax error at or near \"MERGE\"", FailureClass::Permanent),
            ("permission denied for table orders", FailureClass::Permanent),
            ("", FailureClass::Permanent),
        ];

        for (message, expected) in cases {
            assert_eq!(classify_store_message(message), expected, "{message}");
        }
    }

    #[test]
    fn message_classification_ignores_case() {
        assert_eq!(classify_store_message("CONFLICT"), FailureClass::Conflict);
        assert_eq!(classify_store_message("TIMEOUT"), FailureClass::Transient);
    }

    #[test]
    fn sqlstate_classification() {
        assert_eq!(classify_sqlstate("40001").0, ErrorKind::StoreConflict);
        assert_eq!(classify_sqlstate("40P01").0, ErrorKind::StoreConflict);
        assert_eq!(classify_sqlstate("55P03").0, ErrorKind::StoreLockTimeout);
        assert_eq!(classify_sqlstate("23505").0, ErrorKind::UniqueViolation);
        assert_eq!(classify_sqlstate("23502").0, ErrorKind::ValidationError);
        assert_eq!(classify_sqlstate("08006").0, ErrorKind::StoreConnectionFailed);
        assert_eq!(classify_sqlstate("53300").0, ErrorKind::StoreUnavailable);
        assert_eq!(classify_sqlstate("57P01").0, ErrorKind::StoreUnavailable);
        assert_eq!(classify_sqlstate("42601").0, ErrorKind::StoreSyntaxError);
        assert_eq!(classify_sqlstate("42P01").0, ErrorKind::StoreObjectMissing);
        assert_eq!(classify_sqlstate("42701").0, ErrorKind::DuplicateColumn);
        assert_eq!(classify_sqlstate("XX000").0, ErrorKind::StoreQueryFailed);
    }

    #[test]
    fn classes_drive_retryability() {
        assert!(etl_error!(ErrorKind::StoreConflict, "conflict").is_retryable());
        assert!(etl_error!(ErrorKind::StoreConnectionFailed, "down").is_retryable());
        assert!(!etl_error!(ErrorKind::StoreSyntaxError, "bad sql").is_retryable());
        assert!(!etl_error!(ErrorKind::SchemaIncompatible, "decimal").is_retryable());
    }

    #[test]
    fn store_message_errors_are_classified() {
        let err = EtlError::from_store_message("Merge failed", "Serialization conflict on table");
        assert_eq!(err.kind(), ErrorKind::StoreConflict);
        assert_eq!(err.detail(), Some("Serialization conflict on table"));
    }

    #[test]
    fn single_error_vector_is_unwrapped() {
        let err = EtlError::from(vec![etl_error!(ErrorKind::InvalidData, "bad row")]);
        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = EtlError::from(vec![
            etl_error!(ErrorKind::InvalidData, "bad row"),
            etl_error!(ErrorKind::StoreConflict, "conflict"),
        ]);
        assert_eq!(err.errors().map(|e| e.len()), Some(2));
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "2 errors\n  1. [InvalidData] bad row\n  2. [StoreConflict] conflict");
    }

    #[test]
    fn display_includes_kind_description_and_detail() {
        let err = etl_error!(
            ErrorKind::SchemaIncompatible,
            "Key column excluded from merge",
            detail = "table: orders\nkeys: id".to_string()
        );

        assert_eq!(
            err.to_string(),
            "[SchemaIncompatible] Key column excluded from merge: table: orders\n  keys: id"
        );
    }
}
