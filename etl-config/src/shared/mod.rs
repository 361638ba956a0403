//! Shared configuration types for the ingestion service.

mod cdc;
mod connection;
mod ingest;
mod keys;
mod ledger;
mod merge;
mod notification;
mod schema;
mod sentry;
mod source;
mod validation;

pub use cdc::CdcConfig;
pub use connection::{PgConnectionConfig, SessionOptions, SessionRole, TlsConfig};
pub use ingest::{IngestServiceConfig, MetricsConfig, StoreConfig};
pub use keys::{KeySourceConfig, KeysConfig};
pub use ledger::LedgerConfig;
pub use merge::{MergeConfig, PreMergeCleanup};
pub use notification::WebhookConfig;
pub use schema::{SchemaConfig, SnapshotConfig};
pub use sentry::SentryConfig;
pub use source::{SourceConfig, URI_PLACEHOLDER};
pub use validation::ValidationError;
