use etl_config::shared::{KeySourceConfig, KeysConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::store::TargetStore;
use crate::types::{KeySpec, TableName};

/// Key specification as written in a key configuration document.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKeySpec {
    Columns(String),
    List(Vec<String>),
}

impl From<Option<RawKeySpec>> for KeySpec {
    fn from(raw: Option<RawKeySpec>) -> Self {
        match raw {
            None => KeySpec::NoKey,
            Some(RawKeySpec::Columns(spec)) => KeySpec::parse(Some(&spec)),
            Some(RawKeySpec::List(columns)) => KeySpec::from_columns(columns),
        }
    }
}

/// Static mapping of table name to primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyConfig {
    tables: BTreeMap<String, KeySpec>,
}

impl KeyConfig {
    pub fn from_inline(tables: &BTreeMap<String, Option<String>>) -> Self {
        Self {
            tables: tables
                .iter()
                .map(|(table, spec)| (table.clone(), KeySpec::parse(spec.as_deref())))
                .collect(),
        }
    }

    /// Parses a JSON object mapping table names to a column name, a comma-separated list,
    /// an array of column names or `null`.
    pub fn from_json(body: &[u8]) -> EtlResult<Self> {
        let raw: BTreeMap<String, Option<RawKeySpec>> = serde_json::from_slice(body)?;

        Ok(Self {
            tables: raw
                .into_iter()
                .map(|(table, spec)| (table, KeySpec::from(spec)))
                .collect(),
        })
    }

    /// Builds the mapping from configuration, fetching it from the blob store if needed.
    pub async fn load<B>(config: &KeysConfig, blobs: &B) -> EtlResult<Self>
    where
        B: BlobStore + Sync,
    {
        match &config.source {
            KeySourceConfig::Inline { tables } => Ok(Self::from_inline(tables)),
            KeySourceConfig::Blob { bucket, key } => {
                let Some(body) = blobs.get(bucket, key).await? else {
                    return Err(etl_error!(
                        ErrorKind::MissingConfiguration,
                        "Key configuration object not found",
                        detail = format!("{bucket}/{key}")
                    ));
                };

                let keys = Self::from_json(&body)?;
                info!(bucket, key, tables = keys.len(), "loaded key configuration");

                Ok(keys)
            }
        }
    }

    /// Returns the configured key of `table`, or [`None`] if the table is not configured.
    pub fn lookup(&self, table: &str) -> Option<&KeySpec> {
        self.tables.get(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl FromIterator<(String, KeySpec)> for KeyConfig {
    fn from_iter<T: IntoIterator<Item = (String, KeySpec)>>(iter: T) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Configured,
    PrimaryIndex,
    /// A column with a conventional key name.
    ColumnName,
    Unresolved,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self {
            KeyOrigin::Configured => "configured",
            KeyOrigin::PrimaryIndex => "primary_index",
            KeyOrigin::ColumnName => "column_name",
            KeyOrigin::Unresolved => "unresolved",
        };
        f.write_str(origin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub spec: KeySpec,
    pub origin: KeyOrigin,
}

/// Conventional key column names probed, in order, for unconfigured tables.
fn candidate_key_columns(table: &str) -> [String; 4] {
    [
        "id".to_string(),
        format!("{table}_id"),
        "uuid".to_string(),
        "pk_id".to_string(),
    ]
}

/// Resolves the primary key of a table.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    keys: KeyConfig,
    auto_discovery: bool,
}

impl KeyResolver {
    pub fn new(keys: KeyConfig, auto_discovery: bool) -> Self {
        Self {
            keys,
            auto_discovery,
        }
    }

    /// Looks `table` up in the configuration.
    ///
    /// Unconfigured tables are probed in the store when auto-discovery is enabled: a declared
    /// primary index wins, then the first existing column among `id`, `<table>_id`, `uuid` and
    /// `pk_id`. Anything else resolves to [`KeySpec::NoKey`].
    pub async fn resolve<S>(&self, store: &S, table: &TableName) -> EtlResult<ResolvedKey>
    where
        S: TargetStore + Sync,
    {
        if let Some(spec) = self.keys.lookup(&table.name) {
            return Ok(ResolvedKey {
                spec: spec.clone(),
                origin: KeyOrigin::Configured,
            });
        }

        if !self.auto_discovery {
            debug!(table = %table, "table has no key configuration");
            return Ok(ResolvedKey {
                spec: KeySpec::NoKey,
                origin: KeyOrigin::Unresolved,
            });
        }

        let indexed = store.primary_index_columns(table).await?;
        let spec = KeySpec::from_columns(indexed);
        if !spec.is_no_key() {
            info!(table = %table, keys = %spec, "discovered key from primary index");
            return Ok(ResolvedKey {
                spec,
                origin: KeyOrigin::PrimaryIndex,
            });
        }

        if let Some(columns) = store.table_columns(table).await? {
            let found = candidate_key_columns(&table.name)
                .into_iter()
                .find(|candidate| columns.contains(candidate));

            if let Some(column) = found {
                info!(table = %table, key = %column, "discovered key from column name");
                return Ok(ResolvedKey {
                    spec: KeySpec::Single(column),
                    origin: KeyOrigin::ColumnName,
                });
            }
        }

        warn!(table = %table, "no primary key found for unconfigured table");

        Ok(ResolvedKey {
            spec: KeySpec::NoKey,
            origin: KeyOrigin::Unresolved,
        })
    }
}
