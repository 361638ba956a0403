use etl_config::shared::{PgConnectionConfig, SessionRole};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::debug;

use crate::dedup::DedupPlan;
use crate::error::EtlResult;
use crate::merge::MergePlan;
use crate::sql;
use crate::store::{KeyCounts, TargetStore};
use crate::types::{ColumnInfo, SourceObject, TableColumns, TableName};

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const TABLE_COLUMNS_QUERY: &str = r#"
select column_name::text, data_type::text, numeric_precision::int4, numeric_scale::int4
from information_schema.columns
where table_schema = $1 and table_name = $2
order by ordinal_position
"#;

const PRIMARY_INDEX_QUERY: &str = r#"
select a.attname::text
from pg_index i
join pg_attribute a on a.attrelid = i.indrelid and a.attnum = any(i.indkey)
where i.indrelid = to_regclass($1) and i.indisprimary
order by array_position(i.indkey::int2[], a.attnum)
"#;

/// Creates a lazily connected pool to the target store.
pub fn create_store_pool(config: &PgConnectionConfig, max_connections: u32) -> PgPool {
    let options = config.connect_options(SessionRole::Store);

    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(max_connections)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options)
}

/// Normalizes an `information_schema` type to the spelling used in DDL.
///
/// Numeric columns carry their precision and scale, e.g. `NUMERIC(38,10)`.
pub fn canonical_type_name(
    data_type: &str,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
) -> String {
    match data_type {
        "numeric" => match (numeric_precision, numeric_scale) {
            (Some(precision), scale) => format!("NUMERIC({precision},{})", scale.unwrap_or(0)),
            (None, _) => "NUMERIC".to_string(),
        },
        "character varying" => "VARCHAR".to_string(),
        "character" => "CHAR".to_string(),
        "timestamp without time zone" => "TIMESTAMP".to_string(),
        "timestamp with time zone" => "TIMESTAMPTZ".to_string(),
        "time without time zone" => "TIME".to_string(),
        "time with time zone" => "TIMETZ".to_string(),
        other => other.to_uppercase(),
    }
}

/// Target store backed by Postgres.
///
/// Staging and deduplicated tables are created next to the target tables and dropped by
/// the pipeline once the file is merged.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    reader_template: String,
    uri_scheme: String,
}

impl PostgresStore {
    /// Creates a store reading source objects through `reader_template`, e.g.
    /// `read_parquet({uri})`.
    pub fn new(pool: PgPool, reader_template: String, uri_scheme: String) -> Self {
        Self {
            pool,
            reader_template,
            uri_scheme,
        }
    }
}

impl TargetStore for PostgresStore {
    async fn table_columns(&self, table: &TableName) -> EtlResult<Option<TableColumns>> {
        let rows: Vec<(String, String, Option<i32>, Option<i32>)> =
            sqlx::query_as(TABLE_COLUMNS_QUERY)
                .bind(&table.schema)
                .bind(&table.name)
                .fetch_all(&self.pool)
                .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.into_iter()
                .map(|(name, data_type, precision, scale)| {
                    ColumnInfo::new(name, canonical_type_name(&data_type, precision, scale))
                })
                .collect(),
        ))
    }

    async fn primary_index_columns(&self, table: &TableName) -> EtlResult<Vec<String>> {
        let columns: Vec<String> = sqlx::query_scalar(PRIMARY_INDEX_QUERY)
            .bind(table.as_quoted_identifier())
            .fetch_all(&self.pool)
            .await?;

        Ok(columns)
    }

    async fn load_staging(&self, staging: &TableName, source: &SourceObject) -> EtlResult<u64> {
        let reader = sql::reader_expression(&self.reader_template, &source.uri(&self.uri_scheme));
        let statement = sql::create_staging(staging, &reader);
        debug!(staging_table = %staging, %statement, "loading staging table");

        let result = sqlx::query(&statement).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn key_counts(&self, table: &TableName, key_columns: &[String]) -> EtlResult<KeyCounts> {
        let (total_rows, distinct_keys): (i64, i64) =
            sqlx::query_as(&sql::key_counts(table, key_columns))
                .fetch_one(&self.pool)
                .await?;

        Ok(KeyCounts {
            total_rows: total_rows.max(0) as u64,
            distinct_keys: distinct_keys.max(0) as u64,
        })
    }

    async fn create_deduplicated(&self, plan: &DedupPlan) -> EtlResult<u64> {
        let statement = sql::create_deduplicated(plan);
        debug!(dedup_table = %plan.target, %statement, "creating deduplicated table");

        let result = sqlx::query(&statement).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn add_column(&self, table: &TableName, column: &ColumnInfo) -> EtlResult<()> {
        let statement = sql::add_column(table, column)?;
        sqlx::query(&statement).execute(&self.pool).await?;

        Ok(())
    }

    async fn delete_matching_keys(&self, plan: &MergePlan) -> EtlResult<u64> {
        let result = sqlx::query(&sql::delete_matching_keys(plan))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn merge(&self, plan: &MergePlan) -> EtlResult<Option<u64>> {
        let statement = sql::merge(plan);
        debug!(table = %plan.target, %statement, "executing merge");

        let result = sqlx::query(&statement).execute(&self.pool).await?;

        Ok(Some(result.rows_affected()))
    }

    async fn drop_table(&self, table: &TableName) -> EtlResult<()> {
        sqlx::query(&sql::drop_table(table))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
