use serde::Deserialize;

use crate::shared::ValidationError;

/// Settings of the processed-file ledger stored in `etl.cdc_processed_files`.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Age after which a `processing` entry is considered abandoned and may be reclaimed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Probability that a run opportunistically prunes old entries.
    #[serde(default = "default_prune_probability")]
    pub prune_probability: f64,
    /// Maximum number of characters of an error message stored on failure.
    #[serde(default = "default_error_message_max_len")]
    pub error_message_max_len: usize,
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stale_after_secs == 0 {
            return Err(ValidationError::invalid(
                "ledger.stale_after_secs",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.prune_probability) {
            return Err(ValidationError::invalid(
                "ledger.prune_probability",
                "must be between 0 and 1",
            ));
        }
        if self.error_message_max_len == 0 {
            return Err(ValidationError::invalid(
                "ledger.error_message_max_len",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            retention_days: default_retention_days(),
            prune_probability: default_prune_probability(),
            error_message_max_len: default_error_message_max_len(),
        }
    }
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_retention_days() -> u32 {
    30
}

fn default_prune_probability() -> f64 {
    0.01
}

fn default_error_message_max_len() -> usize {
    500
}
