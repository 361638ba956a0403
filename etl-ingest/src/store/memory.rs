use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::dedup::{DedupPlan, select_survivors};
use crate::error::{ErrorKind, EtlResult};
use crate::merge::MergePlan;
use crate::store::{KeyCounts, TargetStore};
use crate::types::{
    ColumnInfo, INGESTION_SEQ_COLUMN, Row, SourceObject, TableColumns, TableName, Value,
};
use crate::{bail, etl_error};

/// Operations of [`TargetStore`], used to inject failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    LoadStaging,
    KeyCounts,
    CreateDeduplicated,
    AddColumn,
    DeleteMatchingKeys,
    Merge,
    DropTable,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: TableColumns,
    rows: Vec<Row>,
    primary_key: Vec<String>,
}

#[derive(Debug, Clone)]
struct SourceFixture {
    columns: TableColumns,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    kind: ErrorKind,
    /// Remaining failures, [`None`] for every call.
    remaining: Option<u32>,
}

/// Inner state of [`MemoryStore`]
#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableName, MemoryTable>,
    /// Rows readable by [`TargetStore::load_staging`], keyed by object.
    sources: HashMap<SourceObject, SourceFixture>,
    failures: HashMap<StoreOperation, InjectedFailure>,
    calls: HashMap<StoreOperation, u32>,
    /// Instants at which merges were attempted, used to observe backoff.
    merge_instants: Vec<Instant>,
}

impl Inner {
    /// Records a call of `operation` and fails it when a failure is injected.
    fn begin(&mut self, operation: StoreOperation) -> EtlResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if operation == StoreOperation::Merge {
            self.merge_instants.push(Instant::now());
        }

        let Some(failure) = self.failures.get_mut(&operation) else {
            return Ok(());
        };

        let kind = failure.kind;
        match failure.remaining.as_mut() {
            Some(0) => Ok(()),
            Some(remaining) => {
                *remaining -= 1;
                Err(injected_error(kind))
            }
            None => Err(injected_error(kind)),
        }
    }

    fn table(&self, table: &TableName) -> EtlResult<&MemoryTable> {
        match self.tables.get(table) {
            Some(memory_table) => Ok(memory_table),
            None => Err(etl_error!(
                ErrorKind::StoreObjectMissing,
                "Store object not found",
                detail = format!("relation {table} does not exist")
            )),
        }
    }
}

fn injected_error(kind: ErrorKind) -> crate::error::EtlError {
    etl_error!(kind, "Injected store failure")
}

fn key_of(row: &Row, key_columns: &[String]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Key of `row` as compared by `t.k = s.k`, [`None`] when a key value is null.
fn join_key(row: &Row, key_columns: &[String]) -> Option<Vec<Value>> {
    let key = key_of(row, key_columns);
    (!key.contains(&Value::Null)).then_some(key)
}

fn ensure_columns<'a>(
    table: &TableName,
    columns: &TableColumns,
    names: impl IntoIterator<Item = &'a String>,
) -> EtlResult<()> {
    for name in names {
        if !columns.contains(name) {
            bail!(
                ErrorKind::StoreObjectMissing,
                "Store object not found",
                detail = format!("column {name} of relation {table} does not exist")
            );
        }
    }

    Ok(())
}

/// In-memory target store.
///
/// Evaluates staging loads, deduplication and merges with the same semantics as the SQL
/// issued by [`super::postgres::PostgresStore`], which makes it suitable for pipeline tests.
/// Source objects must be registered with [`MemoryStore::register_source`] before they can
/// be loaded.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Creates or replaces a table.
    pub async fn create_table(
        &self,
        table: TableName,
        columns: TableColumns,
        primary_key: Vec<String>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            table,
            MemoryTable {
                columns,
                rows: Vec::new(),
                primary_key,
            },
        );
    }

    /// Appends rows to an existing table. Unknown tables are ignored.
    pub async fn insert_rows(&self, table: &TableName, rows: Vec<Row>) {
        let mut inner = self.inner.lock().await;
        if let Some(memory_table) = inner.tables.get_mut(table) {
            memory_table.rows.extend(rows);
        }
    }

    /// Makes `rows` readable as the contents of `source`.
    pub async fn register_source(&self, source: SourceObject, columns: TableColumns, rows: Vec<Row>) {
        let mut inner = self.inner.lock().await;
        inner.sources.insert(source, SourceFixture { columns, rows });
    }

    /// Fails the next `times` calls of `operation` with `kind`, or every call when `None`.
    pub async fn fail_operation(&self, operation: StoreOperation, kind: ErrorKind, times: Option<u32>) {
        let mut inner = self.inner.lock().await;
        inner.failures.insert(
            operation,
            InjectedFailure {
                kind,
                remaining: times,
            },
        );
    }

    pub async fn calls(&self, operation: StoreOperation) -> u32 {
        let inner = self.inner.lock().await;
        inner.calls.get(&operation).copied().unwrap_or(0)
    }

    pub async fn merge_instants(&self) -> Vec<Instant> {
        let inner = self.inner.lock().await;
        inner.merge_instants.clone()
    }

    /// Returns the rows of `table`, or [`None`] when it does not exist.
    pub async fn rows(&self, table: &TableName) -> Option<Vec<Row>> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|t| t.rows.clone())
    }

    pub async fn table_names(&self) -> Vec<TableName> {
        let inner = self.inner.lock().await;
        inner.tables.keys().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetStore for MemoryStore {
    async fn table_columns(&self, table: &TableName) -> EtlResult<Option<TableColumns>> {
        let inner = self.inner.lock().await;

        Ok(inner.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn primary_index_columns(&self, table: &TableName) -> EtlResult<Vec<String>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .tables
            .get(table)
            .map(|t| t.primary_key.clone())
            .unwrap_or_default())
    }

    async fn load_staging(&self, staging: &TableName, source: &SourceObject) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::LoadStaging)?;

        if inner.tables.contains_key(staging) {
            bail!(
                ErrorKind::StoreQueryFailed,
                "Store query failed",
                detail = format!("relation {staging} already exists")
            );
        }

        let Some(fixture) = inner.sources.get(source).cloned() else {
            bail!(
                ErrorKind::StoreQueryFailed,
                "Source object could not be read",
                detail = format!("no object at {}/{}", source.bucket, source.key)
            );
        };

        let mut columns = fixture.columns;
        columns.push(ColumnInfo::new(INGESTION_SEQ_COLUMN, "BIGINT"));

        let rows: Vec<Row> = fixture
            .rows
            .into_iter()
            .enumerate()
            .map(|(index, mut row)| {
                row.insert(INGESTION_SEQ_COLUMN.to_string(), Value::Int(index as i64 + 1));
                row
            })
            .collect();
        let loaded = rows.len() as u64;

        inner.tables.insert(
            staging.clone(),
            MemoryTable {
                columns,
                rows,
                primary_key: Vec::new(),
            },
        );

        Ok(loaded)
    }

    async fn key_counts(&self, table: &TableName, key_columns: &[String]) -> EtlResult<KeyCounts> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::KeyCounts)?;

        let memory_table = inner.table(table)?;
        ensure_columns(table, &memory_table.columns, key_columns)?;

        let distinct: BTreeSet<Vec<Value>> = memory_table
            .rows
            .iter()
            .map(|row| key_of(row, key_columns))
            .collect();

        Ok(KeyCounts {
            total_rows: memory_table.rows.len() as u64,
            distinct_keys: distinct.len() as u64,
        })
    }

    async fn create_deduplicated(&self, plan: &DedupPlan) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::CreateDeduplicated)?;

        let source = inner.table(&plan.source)?;
        ensure_columns(&plan.source, &source.columns, plan.key_columns.iter().chain(&plan.columns))?;

        let columns: TableColumns = source
            .columns
            .iter()
            .filter(|column| plan.columns.contains(&column.name))
            .cloned()
            .collect();
        let rows: Vec<Row> = select_survivors(&source.rows, &plan.key_columns, &plan.order)
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .filter(|(name, _)| plan.columns.contains(name))
                    .collect()
            })
            .collect();
        let surviving = rows.len() as u64;

        inner.tables.insert(
            plan.target.clone(),
            MemoryTable {
                columns,
                rows,
                primary_key: Vec::new(),
            },
        );

        Ok(surviving)
    }

    async fn add_column(&self, table: &TableName, column: &ColumnInfo) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::AddColumn)?;

        inner.table(table)?;
        let Some(memory_table) = inner.tables.get_mut(table) else {
            return Ok(());
        };

        if memory_table.columns.contains(&column.name) {
            bail!(
                ErrorKind::DuplicateColumn,
                "Store column already exists",
                detail = format!("column {} of relation {table} already exists", column.name)
            );
        }
        memory_table.columns.push(column.clone());

        Ok(())
    }

    async fn delete_matching_keys(&self, plan: &MergePlan) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::DeleteMatchingKeys)?;

        let keys: BTreeSet<Vec<Value>> = inner
            .table(&plan.source)?
            .rows
            .iter()
            .filter_map(|row| join_key(row, &plan.key_columns))
            .collect();

        inner.table(&plan.target)?;
        let Some(target) = inner.tables.get_mut(&plan.target) else {
            return Ok(0);
        };

        let before = target.rows.len();
        target.rows.retain(|row| {
            join_key(row, &plan.key_columns).is_none_or(|key| !keys.contains(&key))
        });

        Ok((before - target.rows.len()) as u64)
    }

    async fn merge(&self, plan: &MergePlan) -> EtlResult<Option<u64>> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::Merge)?;

        let source = inner.table(&plan.source)?.clone();
        let mut target = inner.table(&plan.target)?.clone();
        ensure_columns(&plan.target, &target.columns, &plan.columns)?;
        ensure_columns(&plan.source, &source.columns, &plan.columns)?;
        if let Some(delete) = &plan.delete {
            ensure_columns(&plan.source, &source.columns, [&delete.column])?;
        }

        let update_columns: Vec<&str> = plan.update_columns().collect();
        let mut affected = 0;

        for source_row in &source.rows {
            let key = join_key(source_row, &plan.key_columns);
            let is_delete = plan.delete.as_ref().is_some_and(|delete| {
                delete.matches(source_row.get(&delete.column).and_then(Value::as_str))
            });
            let position = key.as_ref().and_then(|key| {
                target.rows.iter().position(|row| {
                    join_key(row, &plan.key_columns).is_some_and(|other| other == *key)
                })
            });

            match position {
                Some(index) if is_delete => {
                    target.rows.remove(index);
                    affected += 1;
                }
                Some(index) if !update_columns.is_empty() => {
                    for column in &update_columns {
                        let value = source_row.get(*column).cloned().unwrap_or(Value::Null);
                        target.rows[index].insert(column.to_string(), value);
                    }
                    affected += 1;
                }
                Some(_) => {}
                None if is_delete => {}
                None => {
                    let row: Row = target
                        .columns
                        .names()
                        .map(|name| {
                            let value = if plan.columns.iter().any(|c| c == name) {
                                source_row.get(name).cloned().unwrap_or(Value::Null)
                            } else {
                                Value::Null
                            };
                            (name.to_string(), value)
                        })
                        .collect();
                    target.rows.push(row);
                    affected += 1;
                }
            }
        }

        inner.tables.insert(plan.target.clone(), target);

        Ok(Some(affected))
    }

    async fn drop_table(&self, table: &TableName) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.begin(StoreOperation::DropTable)?;

        inner.tables.remove(table);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::DeleteCondition;

    fn columns(names: &[&str]) -> TableColumns {
        names.iter().map(|name| ColumnInfo::new(*name, "TEXT")).collect()
    }

    fn row(values: &[(&str, Value)]) -> Row {
        values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn merge_upserts_and_deletes() {
        let store = MemoryStore::new();
        let target = TableName::new("public", "orders");
        let source = TableName::new("public", "stg");

        store
            .create_table(target.clone(), columns(&["id", "name"]), vec!["id".to_string()])
            .await;
        store
            .insert_rows(
                &target,
                vec![
                    row(&[("id", Value::Int(1)), ("name", "old".into())]),
                    row(&[("id", Value::Int(2)), ("name", "gone".into())]),
                ],
            )
            .await;
        store
            .create_table(source.clone(), columns(&["id", "name", "Op"]), Vec::new())
            .await;
        store
            .insert_rows(
                &source,
                vec![
                    row(&[("id", Value::Int(1)), ("name", "new".into()), ("Op", "U".into())]),
                    row(&[("id", Value::Int(2)), ("name", Value::Null), ("Op", "D".into())]),
                    row(&[("id", Value::Int(3)), ("name", "fresh".into()), ("Op", "I".into())]),
                    row(&[("id", Value::Int(4)), ("name", Value::Null), ("Op", "D".into())]),
                ],
            )
            .await;

        let plan = MergePlan {
            target: target.clone(),
            source,
            key_columns: vec!["id".to_string()],
            columns: vec!["id".to_string(), "name".to_string()],
            delete: Some(DeleteCondition {
                column: "Op".to_string(),
                values: vec!["D".to_string()],
            }),
        };

        let affected = store.merge(&plan).await.unwrap();
        assert_eq!(affected, Some(3));

        let rows = store.rows(&target).await.unwrap();
        assert_eq!(
            rows,
            vec![
                row(&[("id", Value::Int(1)), ("name", "new".into())]),
                row(&[("id", Value::Int(3)), ("name", "fresh".into())]),
            ]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_bounded() {
        let store = MemoryStore::new();
        let table = TableName::new("public", "t");
        store
            .fail_operation(StoreOperation::DropTable, ErrorKind::StoreConflict, Some(1))
            .await;

        let err = store.drop_table(&table).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreConflict);
        assert!(store.drop_table(&table).await.is_ok());
        assert_eq!(store.calls(StoreOperation::DropTable).await, 2);
    }

    #[tokio::test]
    async fn staging_load_numbers_rows() {
        let store = MemoryStore::new();
        let object = SourceObject::new("bucket", "fair/orders/2024/01/02/a.parquet");
        store
            .register_source(
                object.clone(),
                columns(&["id"]),
                vec![row(&[("id", Value::Int(7))]), row(&[("id", Value::Int(8))])],
            )
            .await;

        let staging = TableName::new("public", "stg");
        assert_eq!(store.load_staging(&staging, &object).await.unwrap(), 2);

        let rows = store.rows(&staging).await.unwrap();
        assert_eq!(rows[1][INGESTION_SEQ_COLUMN], Value::Int(2));
        assert!(store.table_columns(&staging).await.unwrap().unwrap().contains(INGESTION_SEQ_COLUMN));
    }

    #[tokio::test]
    async fn null_keys_never_match() {
        let store = MemoryStore::new();
        let target = TableName::new("public", "orders");
        let source = TableName::new("public", "stg");

        store
            .create_table(target.clone(), columns(&["id", "name"]), vec!["id".to_string()])
            .await;
        store
            .insert_rows(&target, vec![row(&[("id", Value::Null), ("name", "orphan".into())])])
            .await;
        store
            .create_table(source.clone(), columns(&["id", "name", "Op"]), Vec::new())
            .await;
        store
            .insert_rows(
                &source,
                vec![
                    row(&[("id", Value::Null), ("name", "first".into()), ("Op", "U".into())]),
                    row(&[("id", Value::Null), ("name", Value::Null), ("Op", "D".into())]),
                ],
            )
            .await;

        let plan = MergePlan {
            target: target.clone(),
            source,
            key_columns: vec!["id".to_string()],
            columns: vec!["id".to_string(), "name".to_string()],
            delete: Some(DeleteCondition {
                column: "Op".to_string(),
                values: vec!["D".to_string()],
            }),
        };

        assert_eq!(store.delete_matching_keys(&plan).await.unwrap(), 0);
        assert_eq!(store.merge(&plan).await.unwrap(), Some(1));

        // The null-keyed target row is kept, the update is inserted and the tombstone dropped.
        assert_eq!(
            store.rows(&target).await.unwrap(),
            vec![
                row(&[("id", Value::Null), ("name", "orphan".into())]),
                row(&[("id", Value::Null), ("name", "first".into())]),
            ]
        );
    }
}
