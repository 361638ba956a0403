//! Mapping of source column types to target store column types.
//!
//! Pure and deterministic: the same source type always yields the same [`TypeMapping`].

use std::fmt;

/// Largest precision supported by the target store for `NUMERIC`.
pub const MAX_NUMERIC_PRECISION: u32 = 38;

/// Target type used for unknown source types.
pub const FALLBACK_TYPE: &str = "TEXT";

/// Why a mapping produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingReason {
    AlreadyValid,
    Mapped,
    PreservedPrecision,
    ManualConversion,
    UnknownFallback,
    EmptyType,
}

impl fmt::Display for MappingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            MappingReason::AlreadyValid => "already a valid target type",
            MappingReason::Mapped => "mapped from source type",
            MappingReason::PreservedPrecision => "mapped with preserved precision",
            MappingReason::ManualConversion => "manual conversion required",
            MappingReason::UnknownFallback => "unknown type, using fallback",
            MappingReason::EmptyType => "empty source type",
        };

        f.write_str(reason)
    }
}

/// Result of mapping one source type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    /// Target type, or [`None`] when the source type cannot be translated.
    pub target: Option<String>,
    /// Whether the column may be added to the target table without review.
    pub auto_safe: bool,
    pub reason: MappingReason,
}

impl TypeMapping {
    fn safe(target: impl Into<String>, reason: MappingReason) -> Self {
        Self {
            target: Some(target.into()),
            auto_safe: true,
            reason,
        }
    }

    fn manual() -> Self {
        Self {
            target: None,
            auto_safe: false,
            reason: MappingReason::ManualConversion,
        }
    }
}

/// Base types the target store accepts as-is.
const VALID_TARGET_TYPES: &[&str] = &[
    "TEXT",
    "VARCHAR",
    "CHAR",
    "SMALLINT",
    "INT",
    "INTEGER",
    "BIGINT",
    "BOOL",
    "BOOLEAN",
    "REAL",
    "DOUBLE PRECISION",
    "NUMERIC",
    "DECIMAL",
    "DATE",
    "TIMESTAMP",
    "TIMESTAMPTZ",
];

/// Source base types carrying a precision and scale.
const DECIMAL_FAMILY: &[&str] = &[
    "DECIMAL",
    "NUMERIC",
    "DEC",
    "FIXED",
    "NUMBER",
    "MONEY",
    "SMALLMONEY",
];

/// Static source → target table for base types that are not valid target types.
///
/// A [`None`] target marks a type that cannot be translated automatically.
pub const SOURCE_TYPE_MAP: &[(&str, Option<&str>)] = &[
    // Strings
    ("TINYTEXT", Some("TEXT")),
    ("MEDIUMTEXT", Some("TEXT")),
    ("LONGTEXT", Some("TEXT")),
    ("STRING", Some("TEXT")),
    ("NCHAR", Some("TEXT")),
    ("NVARCHAR", Some("TEXT")),
    ("NTEXT", Some("TEXT")),
    ("CLOB", Some("TEXT")),
    ("NCLOB", Some("TEXT")),
    ("XML", Some("TEXT")),
    ("ENUM", Some("TEXT")),
    ("SET", Some("TEXT")),
    ("JSON", Some("TEXT")),
    ("JSONB", Some("TEXT")),
    ("UUID", Some("TEXT")),
    ("INET", Some("TEXT")),
    ("CIDR", Some("TEXT")),
    ("MACADDR", Some("TEXT")),
    // Binary
    ("BINARY", Some("TEXT")),
    ("VARBINARY", Some("TEXT")),
    ("TINYBLOB", Some("TEXT")),
    ("BLOB", Some("TEXT")),
    ("MEDIUMBLOB", Some("TEXT")),
    ("LONGBLOB", Some("TEXT")),
    ("BYTEA", Some("TEXT")),
    ("IMAGE", Some("TEXT")),
    // Integers
    ("BIT", Some("BOOLEAN")),
    ("TINYINT", Some("INTEGER")),
    ("MEDIUMINT", Some("INTEGER")),
    ("SERIAL", Some("INTEGER")),
    ("SMALLSERIAL", Some("INTEGER")),
    ("BIGSERIAL", Some("BIGINT")),
    ("TINYINT UNSIGNED", Some("INTEGER")),
    ("SMALLINT UNSIGNED", Some("INTEGER")),
    ("MEDIUMINT UNSIGNED", Some("INTEGER")),
    ("INT UNSIGNED", Some("BIGINT")),
    ("INTEGER UNSIGNED", Some("BIGINT")),
    ("BIGINT UNSIGNED", Some("NUMERIC(20, 0)")),
    ("INT8", Some("INTEGER")),
    ("INT16", Some("INTEGER")),
    ("INT32", Some("INTEGER")),
    ("INT64", Some("BIGINT")),
    ("UINT8", Some("INTEGER")),
    ("UINT16", Some("INTEGER")),
    ("UINT32", Some("BIGINT")),
    ("UINT64", Some("NUMERIC(20, 0)")),
    // Decimals without an explicit precision
    ("DEC", Some("NUMERIC(38, 10)")),
    ("FIXED", Some("NUMERIC(38, 10)")),
    ("NUMBER", Some("NUMERIC(38, 10)")),
    ("MONEY", Some("NUMERIC(19, 4)")),
    ("SMALLMONEY", Some("NUMERIC(10, 4)")),
    // Floating point
    ("FLOAT", Some("REAL")),
    ("FLOAT4", Some("REAL")),
    ("FLOAT32", Some("REAL")),
    ("FLOAT8", Some("DOUBLE PRECISION")),
    ("FLOAT64", Some("DOUBLE PRECISION")),
    ("DOUBLE", Some("DOUBLE PRECISION")),
    // Date and time
    ("DATETIME", Some("TIMESTAMP")),
    ("DATE32", Some("DATE")),
    ("DATE64", Some("DATE")),
    ("TIMESTAMP_S", Some("TIMESTAMP")),
    ("TIMESTAMP_MS", Some("TIMESTAMP")),
    ("TIMESTAMP_US", Some("TIMESTAMP")),
    ("TIMESTAMP_NS", Some("TIMESTAMP")),
    ("TIME", Some("TEXT")),
    ("TIMETZ", Some("TEXT")),
    ("INTERVAL", Some("TEXT")),
    ("YEAR", Some("INTEGER")),
    // Spatial
    ("GEOMETRY", None),
    ("GEOGRAPHY", None),
    ("POINT", None),
    ("LINESTRING", None),
    ("POLYGON", None),
    ("MULTIPOINT", None),
    ("MULTILINESTRING", None),
    ("MULTIPOLYGON", None),
    ("GEOMETRYCOLLECTION", None),
    // Nested
    ("ARRAY", None),
    ("STRUCT", None),
    ("MAP", None),
    ("ROW", None),
    ("TUPLE", None),
];

/// Maps a source column type to a target column type.
pub fn map_type(source_type: &str) -> TypeMapping {
    let source_type = source_type.trim();
    if source_type.is_empty() {
        return TypeMapping {
            target: None,
            auto_safe: false,
            reason: MappingReason::EmptyType,
        };
    }

    let base = normalize_type(source_type);
    let precision = extract_precision(source_type);

    if VALID_TARGET_TYPES.contains(&base.as_str()) {
        if let (true, Some((p, s))) = (is_decimal_family(&base), precision) {
            return TypeMapping::safe(numeric_type(p, s), MappingReason::PreservedPrecision);
        }

        return TypeMapping::safe(source_type, MappingReason::AlreadyValid);
    }

    let Some((_, target)) = SOURCE_TYPE_MAP.iter().find(|(source, _)| *source == base) else {
        return TypeMapping {
            target: Some(FALLBACK_TYPE.to_string()),
            auto_safe: false,
            reason: MappingReason::UnknownFallback,
        };
    };

    let Some(target) = target else {
        return TypeMapping::manual();
    };

    match (is_decimal_family(&base), precision) {
        (true, Some((p, s))) => {
            TypeMapping::safe(numeric_type(p, s), MappingReason::PreservedPrecision)
        }
        _ => TypeMapping::safe(*target, MappingReason::Mapped),
    }
}

/// Reduces a type string to its upper-case base type.
///
/// The parenthesized precision/scale is removed and whitespace collapsed, so
/// `int(10) unsigned` normalizes to `INT UNSIGNED`.
pub fn normalize_type(data_type: &str) -> String {
    let upper = data_type.trim().to_uppercase();
    let without_precision = match (upper.find('('), upper.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            format!("{} {}", &upper[..open], &upper[close + 1..])
        }
        (Some(open), _) => upper[..open].to_string(),
        _ => upper,
    };

    without_precision.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extracts `(precision, scale)` from a type string, with the scale defaulting to 0.
pub fn extract_precision(data_type: &str) -> Option<(u32, u32)> {
    let open = data_type.find('(')?;
    let close = open + data_type[open..].find(')')?;
    let mut parts = data_type[open + 1..close].split(',').map(str::trim);

    let precision = parts.next()?.parse().ok()?;
    let scale = match parts.next() {
        Some(scale) => scale.parse().ok()?,
        None => 0,
    };

    Some((precision, scale))
}

/// Returns `(precision, scale)` when `data_type` is a decimal-family type.
///
/// A decimal without explicit precision yields `None` for the pair but `Some` overall, so
/// `NUMERIC` and `NUMERIC(10, 2)` compare as different.
pub fn decimal_signature(data_type: &str) -> Option<Option<(u32, u32)>> {
    let base = normalize_type(data_type);
    if is_decimal_family(&base) {
        Some(extract_precision(data_type))
    } else {
        None
    }
}

fn is_decimal_family(base: &str) -> bool {
    DECIMAL_FAMILY.contains(&base)
}

fn numeric_type(precision: u32, scale: u32) -> String {
    format!("NUMERIC({}, {})", precision.min(MAX_NUMERIC_PRECISION), scale)
}
