use serde::Deserialize;

use crate::shared::ValidationError;

/// Placeholder replaced by the quoted object URI in [`SourceConfig::reader_template`].
pub const URI_PLACEHOLDER: &str = "{uri}";

/// Layout of the CDC files in object storage and how the store reads them.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Bucket assumed for keys given without an event document.
    pub bucket: String,
    /// Leading path segments before `<database>/<table>/...`, may be empty.
    #[serde(default)]
    pub root_prefix: String,
    /// Accepted database segments. Empty accepts any.
    #[serde(default)]
    pub databases: Vec<String>,
    /// File name prefix of full-load files, which are never merged.
    #[serde(default = "default_full_load_prefix")]
    pub full_load_prefix: String,
    #[serde(default = "default_uri_scheme")]
    pub uri_scheme: String,
    /// Table expression reading one parquet object, e.g. `read_parquet({uri})`.
    #[serde(default = "default_reader_template")]
    pub reader_template: String,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bucket.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.bucket".to_string()));
        }
        if !self.reader_template.contains(URI_PLACEHOLDER) {
            return Err(ValidationError::invalid(
                "source.reader_template",
                "must contain the {uri} placeholder",
            ));
        }

        Ok(())
    }
}

fn default_full_load_prefix() -> String {
    "LOAD".to_string()
}

fn default_uri_scheme() -> String {
    "s3".to_string()
}

fn default_reader_template() -> String {
    "read_parquet({uri})".to_string()
}
