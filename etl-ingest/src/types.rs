use chrono::{DateTime, Utc};
use etl_config::shared::CdcConfig;
use pg_escape::quote_identifier;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Scratch column holding a row's physical position within its source file.
pub const INGESTION_SEQ_COLUMN: &str = "ingestion_seq";

/// Scratch column holding the rank of a row version within its key group.
pub const ROW_NUMBER_COLUMN: &str = "rn";

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns a table in the same schema with `suffix` appended to the name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.schema.clone(), format!("{}{suffix}", self.name))
    }

    /// Returns the quoted, schema-qualified name to be used in SQL statements.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One column of a table or batch, with its type as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Ordered column list of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    columns: Vec<ColumnInfo>,
}

impl TableColumns {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter()
    }

    pub fn push(&mut self, column: ColumnInfo) {
        self.columns.push(column);
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<ColumnInfo> for TableColumns {
    fn from_iter<T: IntoIterator<Item = ColumnInfo>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Primary key of a table as configured or discovered.
///
/// Resolved once when the configuration is read; downstream code only matches on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    /// CDC is intentionally disabled for the table.
    NoKey,
    Single(String),
    Composite(Vec<String>),
}

impl KeySpec {
    /// Parses a key specification: a column name or a comma-separated list of names.
    ///
    /// `None` and specifications without any column name yield [`KeySpec::NoKey`].
    pub fn parse(spec: Option<&str>) -> KeySpec {
        let Some(spec) = spec else {
            return KeySpec::NoKey;
        };

        Self::from_columns(spec.split(',').map(str::to_string).collect())
    }

    /// Builds a key specification from an ordered list of column names.
    pub fn from_columns(columns: Vec<String>) -> KeySpec {
        let mut columns: Vec<String> = columns
            .into_iter()
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .collect();

        match columns.len() {
            0 => KeySpec::NoKey,
            1 => KeySpec::Single(columns.remove(0)),
            _ => KeySpec::Composite(columns),
        }
    }

    /// Returns the key columns, empty for [`KeySpec::NoKey`].
    pub fn columns(&self) -> &[String] {
        match self {
            KeySpec::NoKey => &[],
            KeySpec::Single(column) => std::slice::from_ref(column),
            KeySpec::Composite(columns) => columns,
        }
    }

    pub fn is_no_key(&self) -> bool {
        matches!(self, KeySpec::NoKey)
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::NoKey => f.write_str("<none>"),
            _ => f.write_str(&self.columns().join(", ")),
        }
    }
}

/// Operation recorded by the upstream producer for a row version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMarker {
    Insert,
    Update,
    Delete,
    Other,
}

impl OperationMarker {
    pub fn from_code(code: &str) -> Self {
        match code {
            "I" => OperationMarker::Insert,
            "U" => OperationMarker::Update,
            "D" => OperationMarker::Delete,
            _ => OperationMarker::Other,
        }
    }

    pub fn code(self) -> Option<&'static str> {
        match self {
            OperationMarker::Insert => Some("I"),
            OperationMarker::Update => Some("U"),
            OperationMarker::Delete => Some("D"),
            OperationMarker::Other => None,
        }
    }

    /// Rank used to order row versions tied on capture time. Deletes rank highest.
    pub fn priority(self) -> i64 {
        match self {
            OperationMarker::Delete => 3,
            OperationMarker::Update => 2,
            OperationMarker::Insert => 1,
            OperationMarker::Other => 0,
        }
    }

    /// Markers with a non-zero priority, highest first.
    pub const RANKED: [OperationMarker; 3] = [
        OperationMarker::Delete,
        OperationMarker::Update,
        OperationMarker::Insert,
    ];
}

/// Names of the CDC columns as configured for the upstream producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcColumns {
    pub operation: String,
    pub load_timestamp: String,
    pub updated: String,
    pub created: String,
}

impl CdcColumns {
    pub fn from_config(config: &CdcConfig) -> Self {
        Self {
            operation: config.operation_column.clone(),
            load_timestamp: config.load_timestamp_column.clone(),
            updated: config.updated_column.clone(),
            created: config.created_column.clone(),
        }
    }

    /// Returns `true` for columns that only drive merge logic and are never persisted.
    pub fn is_metadata(&self, column: &str) -> bool {
        column == self.operation
            || column == self.load_timestamp
            || column == INGESTION_SEQ_COLUMN
            || column == ROW_NUMBER_COLUMN
    }
}

impl Default for CdcColumns {
    fn default() -> Self {
        Self::from_config(&CdcConfig::default())
    }
}

/// Location of one source object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceObject {
    pub bucket: String,
    pub key: String,
}

impl SourceObject {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Returns the object URI, e.g. `s3://bucket/key`.
    pub fn uri(&self, scheme: &str) -> String {
        format!("{scheme}://{}/{}", self.bucket, self.key)
    }
}

/// A single cell value, used by the in-memory store.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
        }
    }
}

/// Total order over values with [`Value::Null`] lowest.
///
/// Integers and floats compare numerically; values of unrelated types compare by type.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row keyed by column name.
pub type Row = BTreeMap<String, Value>;
