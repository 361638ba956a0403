//! Operator alerts for schema drift and failures that need manual attention.
//!
//! Alerts never sit on the success path: [`Notifier::notify`] does not return an error, and
//! every delivery failure is logged and dropped.

use chrono::{DateTime, Utc};
use etl_config::shared::WebhookConfig;
use secrecy::ExposeSecret;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;

/// Category of an [`Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Columns appeared, disappeared or changed type since the last snapshot.
    SchemaChange,
    /// New columns could not be added automatically or decimal columns were excluded.
    ManualInterventionRequired,
    /// A file failed permanently.
    IngestionFailed,
}

/// Payload delivered to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub alert_type: AlertKind,
    pub table_name: String,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub details: serde_json::Value,
    /// Stable hash grouping repeated failures of the same kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_hash: Option<String>,
}

impl Alert {
    pub fn new(alert_type: AlertKind, table_name: &str, details: serde_json::Value) -> Self {
        let subject = match alert_type {
            AlertKind::SchemaChange => format!("Schema Evolution Alert: {table_name}"),
            AlertKind::ManualInterventionRequired => {
                format!("Manual Schema Change Required: {table_name}")
            }
            AlertKind::IngestionFailed => format!("Ingestion Failed: {table_name}"),
        };

        Self {
            alert_type,
            table_name: table_name.to_string(),
            timestamp: Utc::now(),
            subject,
            details,
            error_hash: None,
        }
    }

    /// Builds an [`AlertKind::IngestionFailed`] alert for `error`.
    pub fn failure(table_name: &str, file_key: &str, error: &EtlError) -> Self {
        let mut alert = Alert::new(
            AlertKind::IngestionFailed,
            table_name,
            serde_json::json!({
                "file_key": file_key,
                "error_kind": format!("{:?}", error.kind()),
                "error_message": error.to_string(),
            }),
        );
        alert.error_hash = Some(compute_error_hash(error));

        alert
    }
}

/// Computes a stable hash for an error from its kind and static description.
pub fn compute_error_hash(error: &EtlError) -> String {
    let mut std_hasher = DefaultHasher::new();
    error.hash(&mut std_hasher);
    let hash_value = std_hasher.finish();

    let mut sha_hasher = Sha256::new();
    sha_hasher.update(hash_value.to_le_bytes());
    format!("{:x}", sha_hasher.finalize())
}

/// Fire-and-forget alert sink.
pub trait Notifier {
    fn notify(&self, alert: Alert) -> impl Future<Output = ()> + Send;
}

/// [`Notifier`] discarding every alert.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn notify(&self, _alert: Alert) {}
}

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    topic: &'a str,
    #[serde(flatten)]
    alert: &'a Alert,
}

/// [`Notifier`] posting alerts as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    topic: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            url: config.url.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string()),
            topic: config.topic.clone(),
        }
    }

    async fn send(&self, alert: &Alert) -> EtlResult<()> {
        let mut request = self.client.post(&self.url).json(&WebhookRequest {
            topic: &self.topic,
            alert,
        });
        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read body>".to_string());

            return Err(etl_error!(
                ErrorKind::NotificationFailed,
                "Notification endpoint rejected the alert",
                detail = format!("status {status}: {body}")
            ));
        }

        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: Alert) {
        match self.send(&alert).await {
            Ok(()) => {
                info!(table = %alert.table_name, subject = %alert.subject, "alert sent");
            }
            Err(err) => {
                warn!(
                    table = %alert.table_name,
                    error = %err,
                    "failed to send alert, continuing without notification"
                );
            }
        }
    }
}

/// [`Notifier`] keeping alerts in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

impl Notifier for MemoryNotifier {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}

/// Notifier chosen at startup from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Webhook(WebhookNotifier),
    Noop(NoopNotifier),
}

impl ConfiguredNotifier {
    pub fn from_config(config: Option<&WebhookConfig>) -> Self {
        match config {
            Some(config) => ConfiguredNotifier::Webhook(WebhookNotifier::new(config)),
            None => ConfiguredNotifier::Noop(NoopNotifier),
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn notify(&self, alert: Alert) {
        match self {
            ConfiguredNotifier::Webhook(notifier) => notifier.notify(alert).await,
            ConfiguredNotifier::Noop(notifier) => notifier.notify(alert).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_hash_ignores_detail() {
        let err1 = EtlError::from((
            ErrorKind::StoreConflict,
            "Store serialization conflict",
            "orders".to_string(),
        ));
        let err2 = EtlError::from((
            ErrorKind::StoreConflict,
            "Store serialization conflict",
            "customers".to_string(),
        ));
        let err3 = EtlError::from((ErrorKind::StoreQueryFailed, "Store query failed"));

        assert_eq!(compute_error_hash(&err1), compute_error_hash(&err2));
        assert_ne!(compute_error_hash(&err1), compute_error_hash(&err3));
    }

    #[test]
    fn webhook_payload_is_flattened() {
        let alert = Alert::new(
            AlertKind::SchemaChange,
            "orders",
            serde_json::json!({ "new_columns": ["discount"] }),
        );
        let request = WebhookRequest {
            topic: "cdc-schema-alerts",
            alert: &alert,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["topic"], "cdc-schema-alerts");
        assert_eq!(value["alert_type"], "schema_change");
        assert_eq!(value["subject"], "Schema Evolution Alert: orders");
        assert_eq!(value["details"]["new_columns"][0], "discount");
        assert!(value.get("error_hash").is_none());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        let config: WebhookConfig = serde_json::from_value(serde_json::json!({
            "url": "http://127.0.0.1:9/alerts",
            "timeout_secs": 1
        }))
        .unwrap();
        let notifier = WebhookNotifier::new(&config);

        notifier
            .notify(Alert::new(
                AlertKind::SchemaChange,
                "orders",
                serde_json::Value::Null,
            ))
            .await;
    }
}
