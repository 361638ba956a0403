//! Reconciliation of a batch's columns with its target table.

use metrics::counter;
use std::fmt;
use tracing::{info, warn};

use crate::error::EtlResult;
use crate::metrics::{
    ETL_INGEST_COLUMNS_ADDED_TOTAL, ETL_INGEST_COLUMNS_EXCLUDED_TOTAL, TABLE_NAME_LABEL,
};
use crate::store::TargetStore;
use crate::type_mapper::{decimal_signature, map_type};
use crate::types::{CdcColumns, ColumnInfo, TableColumns, TableName};

/// New batch column that was not added to the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedColumn {
    pub column: String,
    pub source_type: String,
    pub reason: String,
}

/// Common column whose decimal precision or scale differs between batch and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecimalMismatch {
    pub column: String,
    pub batch_type: String,
    pub target_type: String,
}

impl fmt::Display for DecimalMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (target: {}, batch: {})",
            self.column, self.target_type, self.batch_type
        )
    }
}

/// Decisions taken for every column difference between batch and target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<ColumnInfo>,
    pub skipped_manual: Vec<SkippedColumn>,
    pub incompatible_decimals: Vec<DecimalMismatch>,
}

impl ReconcileReport {
    pub fn requires_attention(&self) -> bool {
        !self.skipped_manual.is_empty() || !self.incompatible_decimals.is_empty()
    }
}

/// Columns of `batch` absent from `target`, CDC metadata columns excluded.
pub fn new_columns<'a>(
    batch: &'a TableColumns,
    target: &TableColumns,
    cdc: &CdcColumns,
) -> Vec<&'a ColumnInfo> {
    batch
        .iter()
        .filter(|column| !target.contains(&column.name) && !cdc.is_metadata(&column.name))
        .collect()
}

/// Common columns whose target type is a decimal with a different precision or scale.
pub fn incompatible_decimals(batch: &TableColumns, target: &TableColumns) -> Vec<DecimalMismatch> {
    target
        .iter()
        .filter_map(|target_column| {
            let batch_column = batch.get(&target_column.name)?;
            let target_signature = decimal_signature(&target_column.data_type)?;

            if decimal_signature(&batch_column.data_type) == Some(target_signature) {
                return None;
            }

            Some(DecimalMismatch {
                column: target_column.name.clone(),
                batch_type: batch_column.data_type.clone(),
                target_type: target_column.data_type.clone(),
            })
        })
        .collect()
}

/// Adds auto-safe new columns to `target` and records every other difference.
///
/// A failed `ALTER TABLE` is recorded as a skipped column and does not fail the run.
pub async fn reconcile<S>(
    store: &S,
    target: &TableName,
    batch_columns: &TableColumns,
    target_columns: &TableColumns,
    cdc: &CdcColumns,
    auto_add_columns: bool,
) -> EtlResult<ReconcileReport>
where
    S: TargetStore,
{
    let mut report = ReconcileReport::default();

    for column in new_columns(batch_columns, target_columns, cdc) {
        let mapping = map_type(&column.data_type);
        let skipped = |reason: String| SkippedColumn {
            column: column.name.clone(),
            source_type: column.data_type.clone(),
            reason,
        };

        let target_type = match (&mapping.target, mapping.auto_safe) {
            (Some(target_type), true) if auto_add_columns => target_type.clone(),
            (Some(_), true) => {
                report
                    .skipped_manual
                    .push(skipped("automatic column addition disabled".to_string()));
                continue;
            }
            _ => {
                warn!(
                    table = %target,
                    column = %column.name,
                    source_type = %column.data_type,
                    reason = %mapping.reason,
                    "new column requires manual action"
                );
                report.skipped_manual.push(skipped(mapping.reason.to_string()));
                continue;
            }
        };

        let added = ColumnInfo::new(column.name.clone(), target_type);
        match store.add_column(target, &added).await {
            Ok(()) => {
                info!(
                    table = %target,
                    column = %added.name,
                    data_type = %added.data_type,
                    "added column to target table"
                );
                report.added.push(added);
            }
            Err(err) => {
                warn!(
                    table = %target,
                    column = %added.name,
                    error = %err,
                    "failed to add column to target table"
                );
                report.skipped_manual.push(skipped(err.to_string()));
            }
        }
    }

    report.incompatible_decimals = incompatible_decimals(batch_columns, target_columns);
    for mismatch in &report.incompatible_decimals {
        warn!(table = %target, column = %mismatch, "decimal column excluded from merge");
    }

    counter!(ETL_INGEST_COLUMNS_ADDED_TOTAL, TABLE_NAME_LABEL => target.name.clone())
        .increment(report.added.len() as u64);
    counter!(ETL_INGEST_COLUMNS_EXCLUDED_TOTAL, TABLE_NAME_LABEL => target.name.clone())
        .increment(report.incompatible_decimals.len() as u64);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(spec: &[(&str, &str)]) -> TableColumns {
        spec.iter()
            .map(|(name, data_type)| ColumnInfo::new(*name, *data_type))
            .collect()
    }

    #[test]
    fn new_columns_skip_metadata() {
        let batch = columns(&[
            ("id", "BIGINT"),
            ("Op", "TEXT"),
            ("load_timestamp", "TIMESTAMP"),
            ("ingestion_seq", "BIGINT"),
            ("note", "VARCHAR(20)"),
        ]);
        let target = columns(&[("id", "BIGINT")]);

        let names: Vec<&str> = new_columns(&batch, &target, &CdcColumns::default())
            .into_iter()
            .map(|column| column.name.as_str())
            .collect();

        assert_eq!(names, vec!["note"]);
    }

    #[test]
    fn decimal_mismatches() {
        let target = columns(&[
            ("id", "BIGINT"),
            ("amount", "NUMERIC(38,10)"),
            ("fee", "NUMERIC(10,2)"),
            ("rate", "NUMERIC(5,2)"),
        ]);
        let batch = columns(&[
            ("id", "NUMERIC(20,0)"),
            ("amount", "NUMERIC(20,2)"),
            ("fee", "NUMERIC(10, 2)"),
            ("rate", "DOUBLE PRECISION"),
        ]);

        let mismatches = incompatible_decimals(&batch, &target);
        let names: Vec<&str> = mismatches.iter().map(|m| m.column.as_str()).collect();

        assert_eq!(names, vec!["amount", "rate"]);
        assert_eq!(
            mismatches[0].to_string(),
            "amount (target: NUMERIC(38,10), batch: NUMERIC(20,2))"
        );
    }
}
