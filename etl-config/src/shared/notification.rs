use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Webhook receiving schema drift and manual-intervention alerts.
///
/// Alerts are fire-and-forget; an unreachable endpoint never fails ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Sent as the `apikey` header when present.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Topic name included in every alert payload.
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ValidationError::invalid(
                "notifications.url",
                "must be an http or https url",
            ));
        }

        Ok(())
    }
}

fn default_topic() -> String {
    "cdc-schema-alerts".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}
