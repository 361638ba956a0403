use serde::Deserialize;

/// Schema reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Issue `ALTER TABLE ... ADD COLUMN` for new columns with an auto-safe type mapping.
    #[serde(default = "default_auto_add_columns")]
    pub auto_add_columns: bool,
    /// Persist per-table schema snapshots for drift alerts.
    #[serde(default)]
    pub snapshots: Option<SnapshotConfig>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            auto_add_columns: default_auto_add_columns(),
            snapshots: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    pub bucket: String,
    #[serde(default = "default_snapshot_prefix")]
    pub prefix: String,
}

fn default_auto_add_columns() -> bool {
    true
}

fn default_snapshot_prefix() -> String {
    "schema_metadata/".to_string()
}
