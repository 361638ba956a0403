//! Metric names and labels recorded by the ingestion pipeline.

/// Label for the target table name.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Label for the skip reason code.
pub const REASON_LABEL: &str = "reason";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the failure class of a retried error.
pub const FAILURE_CLASS_LABEL: &str = "failure_class";

/// Label for the pipeline stage being timed.
pub const STAGE_LABEL: &str = "stage";

// File outcomes

/// Counter for files merged successfully.
pub const ETL_INGEST_FILES_PROCESSED_TOTAL: &str = "etl_ingest_files_processed_total";

/// Counter for files skipped, by reason.
pub const ETL_INGEST_FILES_SKIPPED_TOTAL: &str = "etl_ingest_files_skipped_total";

/// Counter for files that failed.
pub const ETL_INGEST_FILES_FAILED_TOTAL: &str = "etl_ingest_files_failed_total";

// Rows

pub const ETL_INGEST_ROWS_LOADED_TOTAL: &str = "etl_ingest_rows_loaded_total";

/// Counter for row versions discarded by deduplication.
pub const ETL_INGEST_DUPLICATES_REMOVED_TOTAL: &str = "etl_ingest_duplicates_removed_total";

// Merge

/// Counter for MERGE statements issued, including retries.
pub const ETL_INGEST_MERGE_ATTEMPTS_TOTAL: &str = "etl_ingest_merge_attempts_total";

pub const ETL_INGEST_MERGE_RETRIES_TOTAL: &str = "etl_ingest_merge_retries_total";

// Schema

/// Counter for columns added to target tables.
pub const ETL_INGEST_COLUMNS_ADDED_TOTAL: &str = "etl_ingest_columns_added_total";

/// Counter for columns excluded from a merge due to a decimal precision mismatch.
pub const ETL_INGEST_COLUMNS_EXCLUDED_TOTAL: &str = "etl_ingest_columns_excluded_total";

// Ledger

pub const ETL_INGEST_LEDGER_PRUNED_TOTAL: &str = "etl_ingest_ledger_pruned_total";

/// Histogram of the duration of each pipeline stage, in seconds.
pub const ETL_INGEST_STAGE_DURATION_SECONDS: &str = "etl_ingest_stage_duration_seconds";
