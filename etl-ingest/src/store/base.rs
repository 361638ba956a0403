use std::future::Future;

use crate::dedup::DedupPlan;
use crate::error::EtlResult;
use crate::merge::MergePlan;
use crate::types::{ColumnInfo, SourceObject, TableColumns, TableName};

/// Row and distinct-key counts of a loaded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCounts {
    pub total_rows: u64,
    pub distinct_keys: u64,
}

impl KeyCounts {
    pub fn has_duplicates(&self) -> bool {
        self.total_rows != self.distinct_keys
    }
}

/// Operations the ingestion pipeline issues against the target store.
///
/// Every mutation is a single statement, so each call either applies completely or not at
/// all. Implementations classify their failures into an
/// [`ErrorKind`](crate::error::ErrorKind) at this boundary.
pub trait TargetStore {
    /// Returns the columns of `table` in ordinal order, or [`None`] when it does not exist.
    fn table_columns(
        &self,
        table: &TableName,
    ) -> impl Future<Output = EtlResult<Option<TableColumns>>> + Send;

    /// Returns the columns of the declared primary index of `table`, empty when none exists.
    fn primary_index_columns(
        &self,
        table: &TableName,
    ) -> impl Future<Output = EtlResult<Vec<String>>> + Send;

    /// Creates `staging` from the rows of `source`, numbering them in file order in the
    /// ingestion sequence column. Returns the number of rows loaded.
    fn load_staging(
        &self,
        staging: &TableName,
        source: &SourceObject,
    ) -> impl Future<Output = EtlResult<u64>> + Send;

    fn key_counts(
        &self,
        table: &TableName,
        key_columns: &[String],
    ) -> impl Future<Output = EtlResult<KeyCounts>> + Send;

    /// Creates the deduplicated table described by `plan`. Returns the number of surviving rows.
    fn create_deduplicated(&self, plan: &DedupPlan) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Adds a nullable column to `table`.
    fn add_column(
        &self,
        table: &TableName,
        column: &ColumnInfo,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Deletes target rows whose key appears in the merge source. Returns the number deleted.
    fn delete_matching_keys(&self, plan: &MergePlan)
    -> impl Future<Output = EtlResult<u64>> + Send;

    /// Applies `plan` in one statement. Returns the affected row count when the store reports it.
    fn merge(&self, plan: &MergePlan) -> impl Future<Output = EtlResult<Option<u64>>> + Send;

    /// Drops `table` if it exists.
    fn drop_table(&self, table: &TableName) -> impl Future<Output = EtlResult<()>> + Send;
}
