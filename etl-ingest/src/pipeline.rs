//! Per-file orchestration of the ingestion stages.
//!
//! A file goes through: path parsing, key resolution, ledger claim, staging load, schema
//! reconciliation, merge column selection, deduplication, merge, staging cleanup and ledger
//! completion. Any failure after the claim drops the staging tables and marks the ledger entry
//! failed before the error is returned.

use chrono::{TimeDelta, Utc};
use etl_config::shared::IngestServiceConfig;
use futures::StreamExt;
use metrics::{counter, histogram};
use rand::Rng;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::dedup::{DEDUP_TABLE_SUFFIX, deduplicate};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::event::{ObjectEvent, SourceFile, parse_source_file};
use crate::keys::{KeyConfig, KeyResolver};
use crate::ledger::{ClaimOutcome, FileLedger, LedgerStatus, MarkOutcome};
use crate::merge::{DeleteCondition, MergePlan, RetryPolicy, execute_merge, select_merge_columns};
use crate::metrics::{
    ERROR_KIND_LABEL, ETL_INGEST_FILES_FAILED_TOTAL, ETL_INGEST_FILES_PROCESSED_TOTAL,
    ETL_INGEST_FILES_SKIPPED_TOTAL, ETL_INGEST_LEDGER_PRUNED_TOTAL, ETL_INGEST_ROWS_LOADED_TOTAL,
    ETL_INGEST_STAGE_DURATION_SECONDS, REASON_LABEL, STAGE_LABEL, TABLE_NAME_LABEL,
};
use crate::notification::{Alert, AlertKind, Notifier};
use crate::outcome::{IngestOutcome, IngestSummary, SkipReason};
use crate::reconcile::reconcile;
use crate::schema_metadata::SchemaTracker;
use crate::store::TargetStore;
use crate::types::{CdcColumns, INGESTION_SEQ_COLUMN, KeySpec, SourceObject, TableColumns, TableName};

/// Longest table name segment kept in staging table names, so that
/// `stg_<table>_<millis>_<hex>_dedup` stays within identifier limits.
const STAGING_TABLE_NAME_MAX_CHARS: usize = 30;

/// Default number of files processed concurrently by [`IngestPipeline::reprocess`].
pub const DEFAULT_REPROCESS_CONCURRENCY: usize = 10;

/// Returns a staging table name unique to one run: `stg_<table>_<epoch_millis>_<8 hex>`.
pub fn staging_table_name(schema: &str, table: &str) -> TableName {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    let table: String = table.chars().take(STAGING_TABLE_NAME_MAX_CHARS).collect();

    TableName::new(schema, format!("stg_{table}_{millis}_{}", &suffix[..8]))
}

/// Files selected by [`IngestPipeline::reprocess`].
#[derive(Debug, Clone)]
pub struct ReprocessRequest {
    pub bucket: String,
    pub prefix: String,
    /// Only files of these tables. Empty selects every table.
    pub tables: Vec<String>,
    /// Remove ledger entries before processing so completed files are merged again.
    pub force: bool,
    pub concurrency: usize,
}

/// Per-file results of a reprocess run, ordered by file key.
#[derive(Debug)]
pub struct ReprocessReport {
    pub results: Vec<(String, EtlResult<IngestOutcome>)>,
}

impl ReprocessReport {
    pub fn succeeded(&self) -> usize {
        self.count(|result| matches!(result, Ok(IngestOutcome::Success(_))))
    }

    pub fn skipped(&self) -> usize {
        self.count(|result| matches!(result, Ok(IngestOutcome::Skipped { .. })))
    }

    pub fn failed(&self) -> usize {
        self.count(Result::is_err)
    }

    fn count(&self, predicate: impl Fn(&EtlResult<IngestOutcome>) -> bool) -> usize {
        self.results
            .iter()
            .filter(|(_, result)| predicate(result))
            .count()
    }
}

/// Tables created while processing a file, dropped once the file is done.
#[derive(Debug, Default)]
struct FileScratch {
    staging: Option<TableName>,
    merge_columns: Vec<String>,
}

/// Ingests CDC files into their target tables.
#[derive(Debug)]
pub struct IngestPipeline<S, L, B, N> {
    config: Arc<IngestServiceConfig>,
    store: S,
    ledger: L,
    blobs: B,
    notifier: N,
    keys: KeyResolver,
    schema_tracker: Option<SchemaTracker<B>>,
    cdc: CdcColumns,
    delete: Option<DeleteCondition>,
    retry: RetryPolicy,
    worker_id: String,
}

impl<S, L, B, N> IngestPipeline<S, L, B, N>
where
    S: TargetStore + Sync,
    L: FileLedger + Sync,
    B: BlobStore + Clone + Sync,
    N: Notifier + Sync,
{
    pub fn new(
        config: Arc<IngestServiceConfig>,
        store: S,
        ledger: L,
        blobs: B,
        notifier: N,
        keys: KeyConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("etl-ingest-{}", Uuid::new_v4()));
        let schema_tracker = config
            .schema
            .snapshots
            .as_ref()
            .map(|snapshots| SchemaTracker::new(blobs.clone(), snapshots));

        Self {
            keys: KeyResolver::new(keys, config.keys.auto_discovery),
            cdc: CdcColumns::from_config(&config.cdc),
            delete: DeleteCondition::from_config(&config.cdc),
            retry: RetryPolicy::from_config(&config.merge),
            schema_tracker,
            worker_id,
            config,
            store,
            ledger,
            blobs,
            notifier,
        }
    }

    pub fn config(&self) -> &IngestServiceConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Processes every record of `event` in order.
    pub async fn process_event(&self, event: &ObjectEvent) -> Vec<EtlResult<IngestOutcome>> {
        let mut results = Vec::with_capacity(event.records.len());
        for object in event.objects() {
            results.push(self.process_object(object).await);
        }

        results
    }

    /// Processes one source object.
    ///
    /// Skips are returned as [`IngestOutcome::Skipped`]; only failures of an owned file are
    /// errors.
    pub async fn process_object(&self, object: SourceObject) -> EtlResult<IngestOutcome> {
        let file_key = object.key.clone();

        let file = match parse_source_file(&self.config.source, object) {
            Ok(file) => file,
            Err(reason) => return Ok(self.skip(&file_key, None, reason)),
        };

        info!(
            file_key,
            database = %file.database,
            table = %file.table,
            date = %file.date,
            "processing cdc file"
        );

        let target = TableName::new(self.config.store.schema.clone(), file.table.clone());
        let resolved = self.keys.resolve(&self.store, &target).await?;
        if resolved.spec.is_no_key() {
            return Ok(self.skip(&file_key, Some(&file.table), SkipReason::NoKeysConfigured));
        }
        debug!(table = %target, keys = %resolved.spec, origin = %resolved.origin, "resolved keys");

        let (done, status) = self.ledger.is_done(&file_key).await?;
        if done {
            debug!(file_key, status = ?status, "file already processed");
            return Ok(self.skip(&file_key, Some(&file.table), SkipReason::AlreadyProcessed));
        }

        match self.ledger.try_claim(&file_key, &self.worker_id).await? {
            ClaimOutcome::Claimed { attempt } => {
                info!(file_key, attempt, worker_id = %self.worker_id, "claimed file");
            }
            ClaimOutcome::AlreadyDone(_) => {
                return Ok(self.skip(&file_key, Some(&file.table), SkipReason::AlreadyProcessed));
            }
            ClaimOutcome::HeldByOther { owner_id } => {
                info!(file_key, owner_id = ?owner_id, "file is claimed by another worker");
                return Ok(self.skip(
                    &file_key,
                    Some(&file.table),
                    SkipReason::ClaimedByOtherWorker,
                ));
            }
        }

        self.process_claimed(&file, &target, &resolved.spec).await
    }

    async fn process_claimed(
        &self,
        file: &SourceFile,
        target: &TableName,
        keys: &KeySpec,
    ) -> EtlResult<IngestOutcome> {
        let started = Instant::now();
        let file_key = file.file_key();
        let mut scratch = FileScratch::default();

        let result = self.merge_file(file, target, keys, &mut scratch, started).await;
        self.drop_scratch(&scratch).await;

        match result {
            Ok(summary) => {
                match self.ledger.mark_completed(file_key, &self.worker_id).await {
                    Ok(MarkOutcome::Recorded) => {}
                    Ok(MarkOutcome::ClaimLost { owner_id, status }) => {
                        // The merge is idempotent per key, the current owner records the outcome.
                        warn!(
                            file_key,
                            worker_id = %self.worker_id,
                            current_owner = owner_id.as_deref().unwrap_or("<none>"),
                            current_status = status.map(LedgerStatus::as_str).unwrap_or("<none>"),
                            "claim was taken over before completion, ledger entry left unchanged"
                        );
                    }
                    Err(err) => {
                        error!(
                            file_key,
                            table = %target,
                            error = %err,
                            "failed to mark file as completed after merge"
                        );
                        return Err(self.fail(file, target, keys, &scratch, err).await);
                    }
                }

                info!(
                    file_key,
                    table = %target,
                    rows_loaded = summary.rows_loaded,
                    duplicates_removed = summary.duplicates_removed,
                    attempts = summary.attempts,
                    duration_seconds = summary.duration_seconds,
                    "cdc file merged"
                );
                counter!(ETL_INGEST_FILES_PROCESSED_TOTAL, TABLE_NAME_LABEL => file.table.clone())
                    .increment(1);

                self.maybe_prune().await;

                Ok(IngestOutcome::Success(summary))
            }
            Err(err) => Err(self.fail(file, target, keys, &scratch, err).await),
        }
    }

    async fn merge_file(
        &self,
        file: &SourceFile,
        target: &TableName,
        keys: &KeySpec,
        scratch: &mut FileScratch,
        started: Instant,
    ) -> EtlResult<IngestSummary> {
        let table = file.table.as_str();
        let key_columns = keys.columns();

        let Some(mut target_columns) = self.store.table_columns(target).await? else {
            return Err(etl_error!(
                ErrorKind::StoreObjectMissing,
                "Target table not found",
                detail = format!("table: {target}")
            ));
        };

        let staging = staging_table_name(&target.schema, table);
        scratch.staging = Some(staging.clone());

        let stage = Instant::now();
        let rows_loaded = self.store.load_staging(&staging, &file.object).await?;
        record_stage(table, "load", stage);
        info!(staging_table = %staging, rows_loaded, "loaded staging table");
        counter!(ETL_INGEST_ROWS_LOADED_TOTAL, TABLE_NAME_LABEL => table.to_string())
            .increment(rows_loaded);

        let Some(staging_columns) = self.store.table_columns(&staging).await? else {
            return Err(etl_error!(
                ErrorKind::InvalidState,
                "Staging table missing after load",
                detail = format!("table: {staging}")
            ));
        };
        let batch_columns: TableColumns = staging_columns
            .iter()
            .filter(|column| column.name != INGESTION_SEQ_COLUMN)
            .cloned()
            .collect();

        if let Some(tracker) = &self.schema_tracker {
            tracker
                .track(table, &staging.name, &batch_columns, &self.notifier)
                .await;
        }

        let stage = Instant::now();
        let report = reconcile(
            &self.store,
            target,
            &batch_columns,
            &target_columns,
            &self.cdc,
            self.config.schema.auto_add_columns,
        )
        .await?;
        record_stage(table, "reconcile", stage);

        if report.requires_attention() {
            self.notifier
                .notify(Alert::new(
                    AlertKind::ManualInterventionRequired,
                    table,
                    serde_json::json!({
                        "file_key": file.file_key(),
                        "skipped_columns": report
                            .skipped_manual
                            .iter()
                            .map(|skipped| serde_json::json!({
                                "column": skipped.column,
                                "source_type": skipped.source_type,
                                "reason": skipped.reason,
                            }))
                            .collect::<Vec<_>>(),
                        "incompatible_decimals": report
                            .incompatible_decimals
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                    }),
                ))
                .await;
        }

        if !report.added.is_empty() {
            target_columns = self.store.table_columns(target).await?.ok_or_else(|| {
                etl_error!(
                    ErrorKind::StoreObjectMissing,
                    "Target table not found",
                    detail = format!("table: {target}")
                )
            })?;
        }

        let merge_columns = select_merge_columns(
            table,
            &target_columns,
            &batch_columns,
            key_columns,
            &report.incompatible_decimals,
            &self.cdc,
        )?;
        scratch.merge_columns = merge_columns.columns.clone();

        let stage = Instant::now();
        let dedup = deduplicate(
            &self.store,
            &staging,
            &staging_columns,
            key_columns,
            &self.cdc,
            table,
        )
        .await?;
        record_stage(table, "dedup", stage);

        let delete = self.delete.clone().filter(|condition| {
            let present = batch_columns.contains(&condition.column);
            if !present {
                warn!(
                    table,
                    column = %condition.column,
                    "delete marker column missing from batch, merging without deletes"
                );
            }
            present
        });

        let plan = MergePlan {
            target: target.clone(),
            source: dedup.table.clone(),
            key_columns: key_columns.to_vec(),
            columns: merge_columns.columns,
            delete,
        };

        let stage = Instant::now();
        let merged = execute_merge(&self.store, &plan, &self.retry).await?;
        record_stage(table, "merge", stage);

        Ok(IngestSummary {
            database: file.database.clone(),
            table: file.table.clone(),
            date: file.date,
            filename: file.filename.clone(),
            rows_loaded,
            rows_merged: merged.rows_affected,
            duplicates_removed: dedup.removed,
            columns_added: report.added.into_iter().map(|column| column.name).collect(),
            excluded_columns: merge_columns.excluded,
            attempts: merged.attempts,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Drops the staging and deduplicated tables. Failures are logged.
    async fn drop_scratch(&self, scratch: &FileScratch) {
        let Some(staging) = &scratch.staging else {
            return;
        };

        for table in [staging.with_suffix(DEDUP_TABLE_SUFFIX), staging.clone()] {
            if let Err(err) = self.store.drop_table(&table).await {
                warn!(table = %table, error = %err, "failed to drop scratch table");
            }
        }
    }

    /// Records the failure in the ledger and returns `err` with the file context attached.
    async fn fail(
        &self,
        file: &SourceFile,
        target: &TableName,
        keys: &KeySpec,
        scratch: &FileScratch,
        err: EtlError,
    ) -> EtlError {
        let file_key = file.file_key();

        error!(file_key, table = %target, error = %err, "cdc file failed");
        counter!(
            ETL_INGEST_FILES_FAILED_TOTAL,
            TABLE_NAME_LABEL => file.table.clone(),
            ERROR_KIND_LABEL => format!("{:?}", err.kind())
        )
        .increment(1);

        match self
            .ledger
            .mark_failed(file_key, &self.worker_id, &err.to_string())
            .await
        {
            Ok(MarkOutcome::Recorded) => {}
            Ok(MarkOutcome::ClaimLost { owner_id, .. }) => warn!(
                file_key,
                worker_id = %self.worker_id,
                current_owner = owner_id.as_deref().unwrap_or("<none>"),
                "claim was taken over, failure not recorded in the ledger"
            ),
            Err(ledger_err) => warn!(file_key, error = %ledger_err, "failed to mark file as failed"),
        }

        if !err.is_retryable() {
            self.notifier
                .notify(Alert::failure(&file.table, file_key, &err))
                .await;
        }

        let columns = if scratch.merge_columns.is_empty() {
            "<not selected>".to_string()
        } else {
            scratch.merge_columns.join(", ")
        };

        etl_error!(
            err.kind(),
            "CDC file processing failed",
            detail = format!(
                "file: {file_key}\ntable: {target}\ncolumns: {columns}\nkeys: {keys}\nerror: {err}"
            ),
            source: err
        )
    }

    fn skip(&self, file_key: &str, table: Option<&str>, reason: SkipReason) -> IngestOutcome {
        info!(file_key, table = ?table, reason = %reason, "skipping file");
        counter!(ETL_INGEST_FILES_SKIPPED_TOTAL, REASON_LABEL => reason.as_str()).increment(1);

        IngestOutcome::skipped(file_key, reason)
    }

    /// Prunes the ledger with the configured probability. Failures are logged.
    async fn maybe_prune(&self) {
        let probability = self.config.ledger.prune_probability;
        if probability <= 0.0 || rand::rng().random::<f64>() >= probability {
            return;
        }

        if let Err(err) = self.prune_ledger().await {
            warn!(error = %err, "opportunistic ledger pruning failed");
        }
    }

    /// Removes ledger entries older than the retention window.
    pub async fn prune_ledger(&self) -> EtlResult<u64> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(self.config.ledger.retention_days));
        let pruned = self.ledger.prune(cutoff).await?;

        info!(pruned, cutoff = %cutoff, "pruned ledger entries");
        counter!(ETL_INGEST_LEDGER_PRUNED_TOTAL).increment(pruned);

        Ok(pruned)
    }

    /// Processes every object below a prefix with bounded concurrency.
    pub async fn reprocess(&self, request: &ReprocessRequest) -> EtlResult<ReprocessReport> {
        let keys = self.blobs.list(&request.bucket, &request.prefix).await?;

        let mut objects = Vec::new();
        for key in keys {
            let object = SourceObject::new(request.bucket.clone(), key);
            if !request.tables.is_empty() {
                let Ok(file) = parse_source_file(&self.config.source, object.clone()) else {
                    continue;
                };
                if !request.tables.contains(&file.table) {
                    continue;
                }
            }

            if request.force && self.ledger.reset(&object.key).await? {
                debug!(file_key = %object.key, "reset ledger entry");
            }
            objects.push(object);
        }

        info!(
            bucket = %request.bucket,
            prefix = %request.prefix,
            files = objects.len(),
            concurrency = request.concurrency,
            "reprocessing files"
        );

        let mut results: Vec<(String, EtlResult<IngestOutcome>)> = futures::stream::iter(objects)
            .map(|object| async move {
                let key = object.key.clone();
                (key, self.process_object(object).await)
            })
            .buffer_unordered(request.concurrency.max(1))
            .collect()
            .await;
        results.sort_by(|(a, _), (b, _)| a.cmp(b));

        Ok(ReprocessReport { results })
    }
}

fn record_stage(table: &str, stage: &'static str, started: Instant) {
    histogram!(
        ETL_INGEST_STAGE_DURATION_SECONDS,
        TABLE_NAME_LABEL => table.to_string(),
        STAGE_LABEL => stage
    )
    .record(started.elapsed().as_secs_f64());
}
