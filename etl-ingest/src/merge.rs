//! Upsert/delete of a canonical batch into its target table.

use etl_config::shared::{CdcConfig, MergeConfig, PreMergeCleanup};
use metrics::counter;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ErrorKind, EtlResult};
use crate::metrics::{
    ETL_INGEST_MERGE_ATTEMPTS_TOTAL, ETL_INGEST_MERGE_RETRIES_TOTAL, FAILURE_CLASS_LABEL,
    TABLE_NAME_LABEL,
};
use crate::reconcile::DecimalMismatch;
use crate::store::TargetStore;
use crate::types::{CdcColumns, TableColumns, TableName};
use crate::{bail, etl_error};

/// Marks source rows whose matched target row is deleted instead of updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCondition {
    pub column: String,
    pub values: Vec<String>,
}

impl DeleteCondition {
    /// Returns the configured condition, or [`None`] when deletes are not configured.
    pub fn from_config(config: &CdcConfig) -> Option<Self> {
        let column = config.delete_column.as_ref()?;
        let values: Vec<String> = config
            .delete_values
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();

        if values.is_empty() {
            return None;
        }

        Some(Self {
            column: column.clone(),
            values,
        })
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        value.is_some_and(|value| self.values.iter().any(|v| v == value))
    }
}

/// Columns taking part in a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumns {
    /// Written columns, in target table order.
    pub columns: Vec<String>,
    /// Common columns left out because of a decimal precision mismatch.
    pub excluded: Vec<String>,
}

/// Selects the columns written by the merge.
///
/// The result is the intersection of target and batch columns in target order, without
/// CDC metadata columns and without columns in `incompatible`. Fails when no column is
/// left or when a key column is not among them.
pub fn select_merge_columns(
    table: &str,
    target: &TableColumns,
    batch: &TableColumns,
    key_columns: &[String],
    incompatible: &[DecimalMismatch],
    cdc: &CdcColumns,
) -> EtlResult<MergeColumns> {
    let is_incompatible = |name: &str| incompatible.iter().any(|m| m.column == name);

    let common: Vec<&str> = target
        .names()
        .filter(|name| batch.contains(name) && !cdc.is_metadata(name))
        .collect();

    if common.is_empty() {
        bail!(
            ErrorKind::SchemaIncompatible,
            "No common columns between batch and target table",
            detail = format!("table: {table}\nkeys: {}", key_columns.join(", "))
        );
    }

    let (excluded, columns): (Vec<&str>, Vec<&str>) =
        common.into_iter().partition(|name| is_incompatible(name));
    let columns: Vec<String> = columns.into_iter().map(str::to_string).collect();
    let excluded: Vec<String> = excluded.into_iter().map(str::to_string).collect();

    if columns.is_empty() {
        bail!(
            ErrorKind::SchemaIncompatible,
            "No compatible columns after excluding decimal mismatches",
            detail = format!(
                "table: {table}\nexcluded columns: {}\nkeys: {}",
                excluded.join(", "),
                key_columns.join(", ")
            )
        );
    }

    let missing_keys: Vec<&String> = key_columns
        .iter()
        .filter(|key| !columns.contains(key))
        .collect();

    if !missing_keys.is_empty() {
        let mismatched: Vec<String> = incompatible
            .iter()
            .filter(|m| key_columns.contains(&m.column))
            .map(ToString::to_string)
            .collect();

        let detail = format!(
            "table: {table}\ncolumns: {}\nkeys: {}\nmissing keys: {}",
            columns.join(", "),
            key_columns.join(", "),
            missing_keys
                .iter()
                .map(|key| key.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if mismatched.is_empty() {
            bail!(
                ErrorKind::SchemaIncompatible,
                "Key columns not found among merge columns",
                detail = detail
            );
        }

        bail!(
            ErrorKind::SchemaIncompatible,
            "Key columns have a decimal precision mismatch",
            detail = format!("{detail}\nmismatched: {}", mismatched.join("; "))
        );
    }

    Ok(MergeColumns { columns, excluded })
}

/// Statement-level description of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub target: TableName,
    pub source: TableName,
    pub key_columns: Vec<String>,
    /// Written columns, key columns included.
    pub columns: Vec<String>,
    pub delete: Option<DeleteCondition>,
}

impl MergePlan {
    /// Columns assigned when a target row is matched.
    pub fn update_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|column| !self.key_columns.contains(column))
            .map(String::as_str)
    }

    pub fn insert_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }
}

/// Bounded exponential backoff with jitter for merge attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub cleanup: PreMergeCleanup,
}

impl RetryPolicy {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            cleanup: config.pre_merge_cleanup,
        }
    }

    /// Delay before the attempt following the failed `attempt` (1-based), without jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt, with a random jitter in `[0, base_backoff)`.
    ///
    /// As long as the exponential term is below `max_backoff`, consecutive delays strictly
    /// increase because the jitter is smaller than the base.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_millis = self.base_backoff.as_millis().max(1) as u64;
        let jitter = rand::rng().random_range(0..base_millis);

        self.backoff_for_attempt(attempt) + Duration::from_millis(jitter)
    }

    fn cleanup_before(&self, attempt: u32) -> bool {
        match self.cleanup {
            PreMergeCleanup::Disabled => false,
            PreMergeCleanup::BeforeRetries => attempt > 1,
            PreMergeCleanup::BeforeEveryAttempt => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MergeConfig::default())
    }
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub attempts: u32,
    pub rows_affected: Option<u64>,
}

/// Executes `plan`, retrying conflict and transient failures.
///
/// Other merge failures are returned immediately. When the configured cleanup applies, target
/// rows matching the batch keys are deleted before the attempt. A failed cleanup skips the
/// merge of that attempt and is retried whatever its class, within the same attempt budget.
pub async fn execute_merge<S>(store: &S, plan: &MergePlan, policy: &RetryPolicy) -> EtlResult<MergeReport>
where
    S: TargetStore,
{
    let table = plan.target.name.clone();
    let mut attempt = 0;

    loop {
        attempt += 1;
        counter!(ETL_INGEST_MERGE_ATTEMPTS_TOTAL, TABLE_NAME_LABEL => table.clone()).increment(1);

        let cleanup = if policy.cleanup_before(attempt) {
            store.delete_matching_keys(plan).await.map(Some)
        } else {
            Ok(None)
        };

        let err = match cleanup {
            Ok(deleted) => {
                if let Some(deleted) = deleted {
                    info!(table = %plan.target, attempt, deleted, "deleted target rows before merge");
                }

                match store.merge(plan).await {
                    Ok(rows_affected) => {
                        info!(
                            table = %plan.target,
                            attempt,
                            rows_affected = ?rows_affected,
                            "merge completed"
                        );

                        return Ok(MergeReport {
                            attempts: attempt,
                            rows_affected,
                        });
                    }
                    Err(err) if !err.is_retryable() => {
                        warn!(
                            table = %plan.target,
                            attempt,
                            error = %err,
                            "merge failed with a non-retryable error"
                        );
                        return Err(err);
                    }
                    Err(err) => err,
                }
            }
            Err(err) => {
                warn!(table = %plan.target, attempt, error = %err, "pre-merge cleanup failed");
                err
            }
        };

        if attempt >= policy.max_attempts {
            warn!(table = %plan.target, attempt, error = %err, "merge retries exhausted");
            return Err(etl_error!(
                ErrorKind::RetriesExhausted,
                "Merge retries exhausted",
                detail = format!("table: {}\nattempts: {attempt}\nlast error: {err}", plan.target),
                source: err
            ));
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            table = %plan.target,
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "merge failed, retrying"
        );
        counter!(
            ETL_INGEST_MERGE_RETRIES_TOTAL,
            TABLE_NAME_LABEL => table.clone(),
            FAILURE_CLASS_LABEL => format!("{:?}", err.class())
        )
        .increment(1);

        tokio::time::sleep(delay).await;
    }
}
