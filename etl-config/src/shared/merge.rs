use serde::Deserialize;

use crate::shared::ValidationError;

/// Deletes target rows matching the batch keys before a MERGE attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreMergeCleanup {
    #[default]
    Disabled,
    /// Only before the second and later attempts.
    BeforeRetries,
    BeforeEveryAttempt,
}

/// Retry behaviour of the merge executor.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff; also bounds the random jitter.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub pre_merge_cleanup: PreMergeCleanup,
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                "merge.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.base_backoff_ms == 0 {
            return Err(ValidationError::invalid(
                "merge.base_backoff_ms",
                "must be greater than 0",
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ValidationError::invalid(
                "merge.max_backoff_ms",
                "must be at least merge.base_backoff_ms",
            ));
        }

        Ok(())
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            pre_merge_cleanup: PreMergeCleanup::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    600_000
}
