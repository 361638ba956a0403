//! Fixtures for driving [`IngestPipeline`] against in-memory back-ends.

use etl_config::shared::IngestServiceConfig;
use std::sync::Arc;

use crate::blob::MemoryBlobStore;
use crate::keys::KeyConfig;
use crate::ledger::memory::MemoryLedger;
use crate::notification::MemoryNotifier;
use crate::pipeline::IngestPipeline;
use crate::store::memory::MemoryStore;
use crate::types::{ColumnInfo, Row, SourceObject, TableColumns, TableName, Value};

pub const TEST_BUCKET: &str = "cdc-landing";
pub const TEST_DATABASE: &str = "fair";
pub const TEST_SCHEMA: &str = "public";

pub type TestPipeline = IngestPipeline<MemoryStore, MemoryLedger, MemoryBlobStore, MemoryNotifier>;

/// Returns a configuration with inline keys for `tables` and a 10ms merge backoff base.
pub fn test_config(tables: &[(&str, Option<&str>)]) -> IngestServiceConfig {
    let tables: serde_json::Map<String, serde_json::Value> = tables
        .iter()
        .map(|(table, spec)| (table.to_string(), serde_json::json!(spec)))
        .collect();

    serde_json::from_value(serde_json::json!({
        "store": {
            "connection": {
                "host": "localhost",
                "port": 5432,
                "name": "analytics",
                "username": "ingest",
                "password": "secret"
            },
            "schema": TEST_SCHEMA
        },
        "source": { "bucket": TEST_BUCKET, "databases": [TEST_DATABASE] },
        "keys": { "source": { "type": "inline", "tables": tables } },
        "ledger": { "prune_probability": 0.0 },
        "merge": { "base_backoff_ms": 10, "max_backoff_ms": 60_000 },
        "worker_id": "test-worker"
    }))
    .expect("test configuration must deserialize")
}

/// Pipeline wired to in-memory back-ends, with handles on each of them.
pub struct TestHarness {
    pub pipeline: TestPipeline,
    pub store: MemoryStore,
    pub ledger: MemoryLedger,
    pub blobs: MemoryBlobStore,
    pub notifier: MemoryNotifier,
}

impl TestHarness {
    pub fn new(config: IngestServiceConfig) -> Self {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new(&config.ledger);
        let blobs = MemoryBlobStore::new();
        let notifier = MemoryNotifier::new();

        let keys = match &config.keys.source {
            etl_config::shared::KeySourceConfig::Inline { tables } => KeyConfig::from_inline(tables),
            etl_config::shared::KeySourceConfig::Blob { .. } => KeyConfig::default(),
        };

        let pipeline = IngestPipeline::new(
            Arc::new(config),
            store.clone(),
            ledger.clone(),
            blobs.clone(),
            notifier.clone(),
            keys,
        );

        Self {
            pipeline,
            store,
            ledger,
            blobs,
            notifier,
        }
    }

    /// Registers `rows` as the contents of a change file of `table` and returns its object.
    pub async fn add_change_file(
        &self,
        table: &str,
        filename: &str,
        columns: &[(&str, &str)],
        rows: Vec<Row>,
    ) -> SourceObject {
        let object = SourceObject::new(TEST_BUCKET, change_file_key(table, filename));
        self.store
            .register_source(object.clone(), table_columns(columns), rows)
            .await;

        object
    }
}

pub fn change_file_key(table: &str, filename: &str) -> String {
    format!("{TEST_DATABASE}/{table}/2024/03/15/{filename}")
}

pub fn target_table(table: &str) -> TableName {
    TableName::new(TEST_SCHEMA, table)
}

pub fn table_columns(columns: &[(&str, &str)]) -> TableColumns {
    columns
        .iter()
        .map(|(name, data_type)| ColumnInfo::new(*name, *data_type))
        .collect()
}

/// Builds a row from `(column, value)` pairs.
pub fn row(values: &[(&str, Value)]) -> Row {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Returns the rows of `table` sorted by the integer value of `key`.
pub async fn sorted_rows(store: &MemoryStore, table: &TableName, key: &str) -> Vec<Row> {
    let mut rows = store.rows(table).await.unwrap_or_default();
    rows.sort_by(|a, b| a.get(key).cmp(&b.get(key)));

    rows
}
