use serde::Deserialize;
use std::collections::BTreeMap;

use crate::shared::ValidationError;

/// Where the primary-key configuration comes from.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    pub source: KeySourceConfig,
    /// Probe the target store's primary index for tables absent from the configuration.
    #[serde(default)]
    pub auto_discovery: bool,
}

/// Source of the table → key specification mapping.
///
/// A key specification is a column name, a comma-separated list of column names, or
/// `null` to disable CDC for the table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySourceConfig {
    Inline {
        #[serde(default)]
        tables: BTreeMap<String, Option<String>>,
    },
    /// A JSON document fetched from the blob store once at startup.
    Blob { bucket: String, key: String },
}

impl KeysConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let KeySourceConfig::Blob { bucket, key } = &self.source {
            if bucket.trim().is_empty() {
                return Err(ValidationError::EmptyField("keys.source.bucket".to_string()));
            }
            if key.trim().is_empty() {
                return Err(ValidationError::EmptyField("keys.source.key".to_string()));
            }
        }

        Ok(())
    }
}
