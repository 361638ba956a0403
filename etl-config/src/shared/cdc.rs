use serde::Deserialize;

use crate::shared::ValidationError;

/// Names of the change-data-capture metadata columns written by the upstream producer.
#[derive(Debug, Clone, Deserialize)]
pub struct CdcConfig {
    #[serde(default = "default_operation_column")]
    pub operation_column: String,
    #[serde(default = "default_load_timestamp_column")]
    pub load_timestamp_column: String,
    #[serde(default = "default_updated_column")]
    pub updated_column: String,
    #[serde(default = "default_created_column")]
    pub created_column: String,
    /// Column whose value marks a row version as a delete. `None` disables deletes entirely.
    #[serde(default = "default_delete_column")]
    pub delete_column: Option<String>,
    /// Values of [`CdcConfig::delete_column`] that mark a delete.
    #[serde(default = "default_delete_values")]
    pub delete_values: Vec<String>,
}

impl CdcConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("cdc.operation_column", &self.operation_column),
            ("cdc.load_timestamp_column", &self.load_timestamp_column),
            ("cdc.updated_column", &self.updated_column),
            ("cdc.created_column", &self.created_column),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field.to_string()));
            }
        }

        if self.delete_column.is_some() && self.delete_values.iter().all(|v| v.trim().is_empty()) {
            return Err(ValidationError::invalid(
                "cdc.delete_values",
                "at least one value is required when cdc.delete_column is set",
            ));
        }

        Ok(())
    }
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            operation_column: default_operation_column(),
            load_timestamp_column: default_load_timestamp_column(),
            updated_column: default_updated_column(),
            created_column: default_created_column(),
            delete_column: default_delete_column(),
            delete_values: default_delete_values(),
        }
    }
}

fn default_operation_column() -> String {
    "Op".to_string()
}

fn default_load_timestamp_column() -> String {
    "load_timestamp".to_string()
}

fn default_updated_column() -> String {
    "updated".to_string()
}

fn default_created_column() -> String {
    "created".to_string()
}

fn default_delete_column() -> Option<String> {
    Some(default_operation_column())
}

fn default_delete_values() -> Vec<String> {
    vec!["D".to_string()]
}
