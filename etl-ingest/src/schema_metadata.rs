//! Per-table schema snapshots used to detect and report schema drift.
//!
//! Snapshots are advisory. The live target schema always drives merge column selection, and
//! no failure in this module is ever returned to the pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use etl_config::shared::SnapshotConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::error::EtlResult;
use crate::notification::{Alert, AlertKind, Notifier};
use crate::types::TableColumns;

/// Stored snapshot of a table's column types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub table_name: String,
    pub schema: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeChange {
    pub old: String,
    pub new: String,
}

/// Difference between the previous snapshot and the current batch schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaChanges {
    pub new_columns: BTreeMap<String, String>,
    pub removed_columns: BTreeMap<String, String>,
    pub type_changes: BTreeMap<String, TypeChange>,
    pub is_new_table: bool,
}

impl SchemaChanges {
    /// Returns `true` when an existing table changed. A first observation is not drift.
    pub fn has_drift(&self) -> bool {
        !self.is_new_table
            && !(self.new_columns.is_empty()
                && self.removed_columns.is_empty()
                && self.type_changes.is_empty())
    }
}

/// Compares `current` against the previous snapshot, if any.
pub fn detect_schema_changes(
    current: &BTreeMap<String, String>,
    previous: Option<&BTreeMap<String, String>>,
) -> SchemaChanges {
    let Some(previous) = previous else {
        return SchemaChanges {
            new_columns: current.clone(),
            is_new_table: true,
            ..SchemaChanges::default()
        };
    };

    let mut changes = SchemaChanges::default();
    for (column, data_type) in current {
        match previous.get(column) {
            None => {
                changes
                    .new_columns
                    .insert(column.clone(), data_type.clone());
            }
            Some(old) if old != data_type => {
                changes.type_changes.insert(
                    column.clone(),
                    TypeChange {
                        old: old.clone(),
                        new: data_type.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (column, data_type) in previous {
        if !current.contains_key(column) {
            changes
                .removed_columns
                .insert(column.clone(), data_type.clone());
        }
    }

    changes
}

/// Loads, diffs and rewrites schema snapshots in a blob store.
#[derive(Debug, Clone)]
pub struct SchemaTracker<B> {
    blobs: B,
    bucket: String,
    prefix: String,
}

impl<B> SchemaTracker<B>
where
    B: BlobStore + Sync,
{
    pub fn new(blobs: B, config: &SnapshotConfig) -> Self {
        Self {
            blobs,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        }
    }

    pub fn snapshot_key(&self, table: &str) -> String {
        format!("{}{table}_schema.json", self.prefix)
    }

    pub async fn load(&self, table: &str) -> EtlResult<Option<SchemaSnapshot>> {
        let Some(body) = self.blobs.get(&self.bucket, &self.snapshot_key(table)).await? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn save(&self, snapshot: &SchemaSnapshot) -> EtlResult<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        self.blobs
            .put(
                &self.bucket,
                &self.snapshot_key(&snapshot.table_name),
                Bytes::from(body),
            )
            .await
    }

    /// Diffs the batch schema against the stored snapshot, stores the new snapshot and
    /// alerts on drift.
    ///
    /// Returns [`None`] when any step failed; the failure is logged.
    pub async fn track<N>(
        &self,
        table: &str,
        staging_table: &str,
        batch_columns: &TableColumns,
        notifier: &N,
    ) -> Option<SchemaChanges>
    where
        N: Notifier + Sync,
    {
        match self.try_track(table, staging_table, batch_columns, notifier).await {
            Ok(changes) => Some(changes),
            Err(err) => {
                warn!(table, error = %err, "schema snapshot tracking failed");
                None
            }
        }
    }

    async fn try_track<N>(
        &self,
        table: &str,
        staging_table: &str,
        batch_columns: &TableColumns,
        notifier: &N,
    ) -> EtlResult<SchemaChanges>
    where
        N: Notifier + Sync,
    {
        let current: BTreeMap<String, String> = batch_columns
            .iter()
            .map(|column| (column.name.clone(), column.data_type.clone()))
            .collect();

        // An unreadable snapshot is replaced below.
        let previous = match self.load(table).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(table, error = %err, "previous schema snapshot could not be read");
                None
            }
        };
        let changes = detect_schema_changes(&current, previous.as_ref().map(|s| &s.schema));

        if changes.is_new_table {
            info!(table, "first schema snapshot for table");
        } else if changes.has_drift() {
            warn!(
                table,
                new_columns = ?changes.new_columns.keys().collect::<Vec<_>>(),
                removed_columns = ?changes.removed_columns.keys().collect::<Vec<_>>(),
                type_changes = ?changes.type_changes.keys().collect::<Vec<_>>(),
                "schema drift detected"
            );
            notifier
                .notify(Alert::new(
                    AlertKind::SchemaChange,
                    table,
                    serde_json::to_value(&changes)?,
                ))
                .await;
        }

        let snapshot = SchemaSnapshot {
            table_name: table.to_string(),
            schema: current,
            last_updated: Utc::now(),
            metadata: serde_json::json!({
                "staging_table": staging_table,
                "changes_detected": changes,
                "columns_count": batch_columns.len(),
            }),
        };
        self.save(&snapshot).await?;

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::notification::MemoryNotifier;
    use crate::types::ColumnInfo;

    fn schema(columns: &[(&str, &str)]) -> BTreeMap<String, String> {
        columns
            .iter()
            .map(|(name, data_type)| (name.to_string(), data_type.to_string()))
            .collect()
    }

    #[test]
    fn first_observation_is_a_new_table() {
        let current = schema(&[("id", "BIGINT")]);
        let changes = detect_schema_changes(&current, None);

        assert!(changes.is_new_table);
        assert!(!changes.has_drift());
        assert_eq!(changes.new_columns, current);
    }

    #[test]
    fn drift_is_classified() {
        let previous = schema(&[("id", "BIGINT"), ("amount", "NUMERIC(20,2)"), ("legacy", "TEXT")]);
        let current = schema(&[("id", "BIGINT"), ("amount", "NUMERIC(38,10)"), ("note", "TEXT")]);

        let changes = detect_schema_changes(&current, Some(&previous));

        assert!(changes.has_drift());
        assert_eq!(changes.new_columns, schema(&[("note", "TEXT")]));
        assert_eq!(changes.removed_columns, schema(&[("legacy", "TEXT")]));
        assert_eq!(
            changes.type_changes.get("amount"),
            Some(&TypeChange {
                old: "NUMERIC(20,2)".to_string(),
                new: "NUMERIC(38,10)".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn tracker_stores_snapshot_and_alerts_on_drift() {
        let blobs = MemoryBlobStore::new();
        let notifier = MemoryNotifier::new();
        let tracker = SchemaTracker::new(
            blobs.clone(),
            &SnapshotConfig {
                bucket: "meta".to_string(),
                prefix: "schema_metadata/".to_string(),
            },
        );

        let first: TableColumns = [ColumnInfo::new("id", "BIGINT")].into_iter().collect();
        let changes = tracker.track("orders", "stg_1", &first, &notifier).await.unwrap();
        assert!(changes.is_new_table);
        assert!(notifier.alerts().await.is_empty());

        let second: TableColumns = [ColumnInfo::new("id", "BIGINT"), ColumnInfo::new("note", "TEXT")]
            .into_iter()
            .collect();
        let changes = tracker.track("orders", "stg_2", &second, &notifier).await.unwrap();
        assert!(changes.has_drift());

        let alerts = notifier.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertKind::SchemaChange);

        let stored = tracker.load("orders").await.unwrap().unwrap();
        assert_eq!(stored.schema.len(), 2);
        assert_eq!(stored.metadata["staging_table"], "stg_2");
        assert!(
            blobs
                .get("meta", "schema_metadata/orders_schema.json")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_replaced() {
        let blobs = MemoryBlobStore::new();
        blobs
            .put("meta", "s/orders_schema.json", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let tracker = SchemaTracker::new(
            blobs,
            &SnapshotConfig {
                bucket: "meta".to_string(),
                prefix: "s/".to_string(),
            },
        );

        let columns: TableColumns = [ColumnInfo::new("id", "BIGINT")].into_iter().collect();
        let changes = tracker
            .track("orders", "stg", &columns, &MemoryNotifier::new())
            .await
            .unwrap();

        assert!(changes.is_new_table);
        assert!(tracker.load("orders").await.unwrap().is_some());
    }
}
