//! SQL statements issued against the target store.
//!
//! Every identifier goes through [`quote_identifier`] and every value through
//! [`quote_literal`]; table and column names originate from object keys and schema
//! introspection and are never interpolated raw.

use etl_config::shared::URI_PLACEHOLDER;
use pg_escape::{quote_identifier, quote_literal};

use crate::bail;
use crate::dedup::{DedupPlan, OrderTerm};
use crate::error::{ErrorKind, EtlResult};
use crate::merge::{DeleteCondition, MergePlan};
use crate::types::{
    ColumnInfo, INGESTION_SEQ_COLUMN, OperationMarker, ROW_NUMBER_COLUMN, TableName,
};

const TARGET_ALIAS: &str = "t";
const SOURCE_ALIAS: &str = "s";

/// Renders the table expression reading one object, e.g. `read_parquet('s3://b/k')`.
pub fn reader_expression(template: &str, uri: &str) -> String {
    template.replace(URI_PLACEHOLDER, &quote_literal(uri))
}

/// Creates the staging table from `reader`, numbering rows in file order.
pub fn create_staging(staging: &TableName, reader: &str) -> String {
    format!(
        "CREATE TABLE {} AS SELECT src.*, ROW_NUMBER() OVER () AS {} FROM {reader} AS src",
        staging.as_quoted_identifier(),
        quote_identifier(INGESTION_SEQ_COLUMN),
    )
}

pub fn key_counts(table: &TableName, key_columns: &[String]) -> String {
    format!(
        "SELECT COUNT(*) AS total_rows, COUNT(DISTINCT ROW({})) AS distinct_keys FROM {}",
        column_list(key_columns.iter().map(String::as_str)),
        table.as_quoted_identifier(),
    )
}

/// Renders one level of the ranking cascade.
pub fn order_term(term: &OrderTerm) -> String {
    match term {
        OrderTerm::Descending(column) => format!("{} DESC NULLS LAST", quote_identifier(column)),
        OrderTerm::OperationPriority(column) => {
            let branches: Vec<String> = OperationMarker::RANKED
                .iter()
                .filter_map(|marker| {
                    marker
                        .code()
                        .map(|code| format!("WHEN {} THEN {}", quote_literal(code), marker.priority()))
                })
                .collect();

            format!(
                "CASE {} {} ELSE {} END DESC",
                quote_identifier(column),
                branches.join(" "),
                OperationMarker::Other.priority()
            )
        }
    }
}

/// Creates the deduplicated table keeping the first-ranked row of every key group.
pub fn create_deduplicated(plan: &DedupPlan) -> String {
    let order: Vec<String> = plan.order.iter().map(order_term).collect();
    let row_number = quote_identifier(ROW_NUMBER_COLUMN);

    format!(
        "CREATE TABLE {target} AS SELECT {columns} FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {order}) AS {row_number} FROM {source}) AS ranked WHERE {row_number} = 1",
        target = plan.target.as_quoted_identifier(),
        columns = column_list(plan.columns.iter().map(String::as_str)),
        keys = column_list(plan.key_columns.iter().map(String::as_str)),
        order = order.join(", "),
        source = plan.source.as_quoted_identifier(),
    )
}

/// Renders the delete condition against the merge source. Null markers never match.
pub fn delete_condition(condition: &DeleteCondition) -> String {
    let values: Vec<String> = condition
        .values
        .iter()
        .map(|value| quote_literal(value))
        .collect();

    format!(
        "COALESCE({SOURCE_ALIAS}.{} IN ({}), FALSE)",
        quote_identifier(&condition.column),
        values.join(", ")
    )
}

/// Renders the MERGE statement of `plan`.
///
/// The UPDATE branch is left out when every written column is a key column. With a delete
/// condition, matched rows are deleted and unmatched tombstones are not inserted.
pub fn merge(plan: &MergePlan) -> String {
    let mut sql = format!(
        "MERGE INTO {} AS {TARGET_ALIAS} USING {} AS {SOURCE_ALIAS} ON {}",
        plan.target.as_quoted_identifier(),
        plan.source.as_quoted_identifier(),
        key_join(&plan.key_columns),
    );

    let delete = plan.delete.as_ref().map(delete_condition);
    if let Some(condition) = &delete {
        sql.push_str(&format!(" WHEN MATCHED AND {condition} THEN DELETE"));
    }

    let assignments: Vec<String> = plan
        .update_columns()
        .map(|column| {
            let column = quote_identifier(column);
            format!("{column} = {SOURCE_ALIAS}.{column}")
        })
        .collect();
    if !assignments.is_empty() {
        sql.push_str(&format!(
            " WHEN MATCHED THEN UPDATE SET {}",
            assignments.join(", ")
        ));
    }

    let not_matched = match &delete {
        Some(condition) => format!(" WHEN NOT MATCHED AND NOT {condition}"),
        None => " WHEN NOT MATCHED".to_string(),
    };
    let values: Vec<String> = plan
        .insert_columns()
        .map(|column| format!("{SOURCE_ALIAS}.{}", quote_identifier(column)))
        .collect();
    sql.push_str(&format!(
        "{not_matched} THEN INSERT ({}) VALUES ({})",
        column_list(plan.insert_columns()),
        values.join(", ")
    ));

    sql
}

/// Deletes target rows whose key appears in the merge source.
pub fn delete_matching_keys(plan: &MergePlan) -> String {
    format!(
        "DELETE FROM {} AS {TARGET_ALIAS} USING {} AS {SOURCE_ALIAS} WHERE {}",
        plan.target.as_quoted_identifier(),
        plan.source.as_quoted_identifier(),
        key_join(&plan.key_columns),
    )
}

/// Adds a nullable column. Fails when the type contains characters outside a type name.
pub fn add_column(table: &TableName, column: &ColumnInfo) -> EtlResult<String> {
    let valid_type = !column.data_type.trim().is_empty()
        && column
            .data_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '(' | ')' | ',' | '_'));

    if !valid_type {
        bail!(
            ErrorKind::InvalidData,
            "Column type is not a valid type name",
            detail = format!("column: {}\ntype: {}", column.name, column.data_type)
        );
    }

    Ok(format!(
        "ALTER TABLE {} ADD COLUMN {} {} NULL",
        table.as_quoted_identifier(),
        quote_identifier(&column.name),
        column.data_type.trim()
    ))
}

pub fn drop_table(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.as_quoted_identifier())
}

fn column_list<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_join(key_columns: &[String]) -> String {
    key_columns
        .iter()
        .map(|column| {
            let column = quote_identifier(column);
            format!("{TARGET_ALIAS}.{column} = {SOURCE_ALIAS}.{column}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}
