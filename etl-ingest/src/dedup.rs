//! Selection of one surviving row version per key within a batch.
//!
//! Row versions sharing a key are ranked by a fixed cascade, each level only breaking ties
//! of the previous one:
//!
//! 1. load timestamp, latest first;
//! 2. operation priority, delete > update > insert > other;
//! 3. origin `updated` timestamp, latest first;
//! 4. origin `created` timestamp, latest first;
//! 5. ingestion sequence, last physical row first.
//!
//! Missing timestamps rank below any present one. Levels whose column is absent from the
//! batch are left out. The ingestion sequence is unique within a batch, so the order is
//! total and the survivor deterministic.

use metrics::counter;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::EtlResult;
use crate::metrics::{ETL_INGEST_DUPLICATES_REMOVED_TOTAL, TABLE_NAME_LABEL};
use crate::store::TargetStore;
use crate::types::{
    CdcColumns, INGESTION_SEQ_COLUMN, OperationMarker, ROW_NUMBER_COLUMN, Row, TableColumns,
    TableName, Value,
};

/// Suffix of the deduplicated copy of a staging table.
pub const DEDUP_TABLE_SUFFIX: &str = "_dedup";

/// One level of the ranking cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTerm {
    /// Column value descending, missing values last.
    Descending(String),
    /// Priority of the operation marker in the column, descending.
    OperationPriority(String),
}

impl OrderTerm {
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        match self {
            OrderTerm::Descending(column) => value_of(b, column).cmp(value_of(a, column)),
            OrderTerm::OperationPriority(column) => {
                operation_priority(b, column).cmp(&operation_priority(a, column))
            }
        }
    }
}

/// Builds the ranking cascade for a batch with the given columns.
pub fn ordering_cascade(columns: &TableColumns, cdc: &CdcColumns) -> Vec<OrderTerm> {
    let mut terms = Vec::with_capacity(5);

    if columns.contains(&cdc.load_timestamp) {
        terms.push(OrderTerm::Descending(cdc.load_timestamp.clone()));
    }
    if columns.contains(&cdc.operation) {
        terms.push(OrderTerm::OperationPriority(cdc.operation.clone()));
    }
    if columns.contains(&cdc.updated) {
        terms.push(OrderTerm::Descending(cdc.updated.clone()));
    }
    if columns.contains(&cdc.created) {
        terms.push(OrderTerm::Descending(cdc.created.clone()));
    }
    terms.push(OrderTerm::Descending(INGESTION_SEQ_COLUMN.to_string()));

    terms
}

/// Compares two row versions of the same key. [`Ordering::Less`] means `a` ranks first.
pub fn compare_versions(a: &Row, b: &Row, terms: &[OrderTerm]) -> Ordering {
    terms
        .iter()
        .map(|term| term.compare(a, b))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Keeps the first-ranked row of every key group, in order of first appearance.
///
/// The scratch ordering columns are removed from the surviving rows.
pub fn select_survivors(rows: &[Row], key_columns: &[String], terms: &[OrderTerm]) -> Vec<Row> {
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut winners: BTreeMap<Vec<Value>, &Row> = BTreeMap::new();

    for row in rows {
        let key: Vec<Value> = key_columns
            .iter()
            .map(|column| value_of(row, column).clone())
            .collect();

        match winners.get(&key) {
            Some(current) if compare_versions(row, current, terms).is_lt() => {
                winners.insert(key, row);
            }
            Some(_) => {}
            None => {
                order.push(key.clone());
                winners.insert(key, row);
            }
        }
    }

    order
        .iter()
        .filter_map(|key| winners.get(key))
        .map(|row| {
            let mut survivor = (*row).clone();
            survivor.remove(INGESTION_SEQ_COLUMN);
            survivor.remove(ROW_NUMBER_COLUMN);
            survivor
        })
        .collect()
}

/// Statement-level description of a deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPlan {
    pub source: TableName,
    pub target: TableName,
    pub key_columns: Vec<String>,
    pub order: Vec<OrderTerm>,
    /// Columns copied to the deduplicated table, in batch order.
    pub columns: Vec<String>,
}

impl DedupPlan {
    pub fn new(
        staging: &TableName,
        staging_columns: &TableColumns,
        key_columns: &[String],
        cdc: &CdcColumns,
    ) -> Self {
        let columns = staging_columns
            .names()
            .filter(|name| *name != INGESTION_SEQ_COLUMN && *name != ROW_NUMBER_COLUMN)
            .map(str::to_string)
            .collect();

        Self {
            source: staging.clone(),
            target: staging.with_suffix(DEDUP_TABLE_SUFFIX),
            key_columns: key_columns.to_vec(),
            order: ordering_cascade(staging_columns, cdc),
            columns,
        }
    }
}

/// Result of deduplicating a staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Table holding exactly one row per key; the staging table itself when nothing was removed.
    pub table: TableName,
    pub total_rows: u64,
    pub distinct_keys: u64,
    pub removed: u64,
}

impl DedupOutcome {
    pub fn is_passthrough(&self) -> bool {
        self.removed == 0
    }
}

/// Reduces the staging table to one row version per key.
///
/// When every key is unique, the staging table is returned as-is. Otherwise a new
/// table named `<staging>_dedup` is created with the survivors.
pub async fn deduplicate<S>(
    store: &S,
    staging: &TableName,
    staging_columns: &TableColumns,
    key_columns: &[String],
    cdc: &CdcColumns,
    table_name: &str,
) -> EtlResult<DedupOutcome>
where
    S: TargetStore,
{
    let counts = store.key_counts(staging, key_columns).await?;

    if !counts.has_duplicates() {
        debug!(
            staging_table = %staging,
            rows = counts.total_rows,
            "no duplicate keys in batch"
        );

        return Ok(DedupOutcome {
            table: staging.clone(),
            total_rows: counts.total_rows,
            distinct_keys: counts.distinct_keys,
            removed: 0,
        });
    }

    let plan = DedupPlan::new(staging, staging_columns, key_columns, cdc);
    let surviving = store.create_deduplicated(&plan).await?;
    let removed = counts.total_rows.saturating_sub(surviving);

    info!(
        staging_table = %staging,
        dedup_table = %plan.target,
        total_rows = counts.total_rows,
        distinct_keys = counts.distinct_keys,
        removed,
        "deduplicated batch"
    );
    counter!(ETL_INGEST_DUPLICATES_REMOVED_TOTAL, TABLE_NAME_LABEL => table_name.to_string())
        .increment(removed);

    Ok(DedupOutcome {
        table: plan.target,
        total_rows: counts.total_rows,
        distinct_keys: counts.distinct_keys,
        removed,
    })
}

fn value_of<'a>(row: &'a Row, column: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;

    row.get(column).unwrap_or(NULL)
}

fn operation_priority(row: &Row, column: &str) -> i64 {
    value_of(row, column)
        .as_str()
        .map(OperationMarker::from_code)
        .unwrap_or(OperationMarker::Other)
        .priority()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnInfo;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn row(values: &[(&str, Value)]) -> Row {
        values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn batch_columns(names: &[&str]) -> TableColumns {
        names
            .iter()
            .map(|name| ColumnInfo::new(*name, "TEXT"))
            .collect()
    }

    fn full_cascade() -> Vec<OrderTerm> {
        ordering_cascade(
            &batch_columns(&[
                "id",
                "Op",
                "load_timestamp",
                "updated",
                "created",
                INGESTION_SEQ_COLUMN,
            ]),
            &CdcColumns::default(),
        )
    }

    fn keys() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn cascade_skips_absent_columns() {
        let terms = ordering_cascade(
            &batch_columns(&["id", "Op", INGESTION_SEQ_COLUMN]),
            &CdcColumns::default(),
        );

        assert_eq!(
            terms,
            vec![
                OrderTerm::OperationPriority("Op".to_string()),
                OrderTerm::Descending(INGESTION_SEQ_COLUMN.to_string()),
            ]
        );
        assert_eq!(full_cascade().len(), 5);
    }

    #[test]
    fn delete_wins_over_update_with_equal_timestamp() {
        let rows = vec![
            row(&[
                ("id", Value::Int(1)),
                ("Op", "U".into()),
                ("load_timestamp", ts(100).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(5)),
            ]),
            row(&[
                ("id", Value::Int(1)),
                ("Op", "D".into()),
                ("load_timestamp", ts(100).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(7)),
            ]),
        ];

        let survivors = select_survivors(&rows, &keys(), &full_cascade());

        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0]["Op"], Value::from("D"));
    }

    #[test]
    fn delete_wins_even_when_physically_earlier() {
        let rows = vec![
            row(&[
                ("id", Value::Int(1)),
                ("Op", "D".into()),
                ("load_timestamp", ts(100).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(1)),
            ]),
            row(&[
                ("id", Value::Int(1)),
                ("Op", "U".into()),
                ("load_timestamp", ts(100).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(2)),
            ]),
        ];

        let survivors = select_survivors(&rows, &keys(), &full_cascade());

        assert_eq!(survivors[0]["Op"], Value::from("D"));
    }

    #[test]
    fn ingestion_sequence_breaks_full_ties() {
        let version = |seq: i64| {
            row(&[
                ("id", Value::Int(2)),
                ("Op", "U".into()),
                ("load_timestamp", ts(100).into()),
                ("updated", ts(90).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(seq)),
                ("payload", format!("seq-{seq}").into()),
            ])
        };
        let rows = vec![version(3), version(9)];

        let survivors = select_survivors(&rows, &keys(), &full_cascade());

        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0]["payload"], Value::from("seq-9"));
        assert!(!survivors[0].contains_key(INGESTION_SEQ_COLUMN));
    }

    #[test]
    fn later_load_timestamp_wins_over_operation() {
        let rows = vec![
            row(&[
                ("id", Value::Int(1)),
                ("Op", "D".into()),
                ("load_timestamp", ts(100).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(2)),
            ]),
            row(&[
                ("id", Value::Int(1)),
                ("Op", "I".into()),
                ("load_timestamp", ts(200).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(1)),
            ]),
        ];

        let survivors = select_survivors(&rows, &keys(), &full_cascade());

        assert_eq!(survivors[0]["Op"], Value::from("I"));
    }

    #[test]
    fn missing_updated_ranks_below_present() {
        let rows = vec![
            row(&[
                ("id", Value::Int(1)),
                ("Op", "U".into()),
                ("load_timestamp", ts(100).into()),
                ("updated", ts(50).into()),
                (INGESTION_SEQ_COLUMN, Value::Int(1)),
            ]),
            row(&[
                ("id", Value::Int(1)),
                ("Op", "U".into()),
                ("load_timestamp", ts(100).into()),
                ("updated", Value::Null),
                (INGESTION_SEQ_COLUMN, Value::Int(2)),
            ]),
        ];

        let survivors = select_survivors(&rows, &keys(), &full_cascade());

        assert_eq!(survivors[0]["updated"], Value::from(ts(50)));
    }

    #[test]
    fn survivors_keep_first_appearance_order_and_composite_keys() {
        let composite = vec!["tenant".to_string(), "id".to_string()];
        let rows = vec![
            row(&[
                ("tenant", "b".into()),
                ("id", Value::Int(1)),
                (INGESTION_SEQ_COLUMN, Value::Int(1)),
            ]),
            row(&[
                ("tenant", "a".into()),
                ("id", Value::Int(1)),
                (INGESTION_SEQ_COLUMN, Value::Int(2)),
            ]),
            row(&[
                ("tenant", "b".into()),
                ("id", Value::Int(1)),
                (INGESTION_SEQ_COLUMN, Value::Int(3)),
            ]),
        ];

        let survivors = select_survivors(&rows, &composite, &full_cascade());

        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0]["tenant"], Value::from("b"));
        assert_eq!(survivors[1]["tenant"], Value::from("a"));
    }

    #[test]
    fn plan_excludes_scratch_columns() {
        let staging = TableName::new("public", "stg_orders_1_abcdef12");
        let columns = batch_columns(&["order_id", "Op", "amount", INGESTION_SEQ_COLUMN]);

        let plan = DedupPlan::new(
            &staging,
            &columns,
            &["order_id".to_string()],
            &CdcColumns::default(),
        );

        assert_eq!(plan.target.name, "stg_orders_1_abcdef12_dedup");
        assert_eq!(plan.columns, vec!["order_id", "Op", "amount"]);
    }
}
