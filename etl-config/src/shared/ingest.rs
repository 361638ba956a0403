use serde::Deserialize;

use crate::Config;
use crate::shared::{
    CdcConfig, KeysConfig, LedgerConfig, MergeConfig, PgConnectionConfig, SchemaConfig,
    SentryConfig, SourceConfig, ValidationError, WebhookConfig,
};

/// Complete configuration of the ingestion service.
///
/// Loaded once at process start and passed by reference to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestServiceConfig {
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub keys: KeysConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub cdc: CdcConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub notifications: Option<WebhookConfig>,
    #[serde(default)]
    pub sentry: Option<SentryConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Identifier recorded as the ledger owner. A random one is generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl IngestServiceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.store.validate()?;
        self.source.validate()?;
        self.keys.validate()?;
        self.ledger.validate()?;
        self.cdc.validate()?;
        self.merge.validate()?;
        if let Some(notifications) = &self.notifications {
            notifications.validate()?;
        }

        Ok(())
    }
}

impl Config for IngestServiceConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["cdc.delete_values", "source.databases"];
}

/// Target store connection and namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub connection: PgConnectionConfig,
    /// Schema holding the target tables and the ephemeral staging tables.
    #[serde(default = "default_store_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.validate()?;
        if self.schema.trim().is_empty() {
            return Err(ValidationError::EmptyField("store.schema".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                "store.max_connections",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_store_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_metrics_port() -> u16 {
    9000
}
