#![cfg(feature = "test-utils")]

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use etl_config::shared::{PreMergeCleanup, SnapshotConfig};
use etl_ingest::blob::BlobStore;
use etl_ingest::error::ErrorKind;
use etl_ingest::event::ObjectEvent;
use etl_ingest::ledger::{FileLedger, LedgerStatus};
use etl_ingest::notification::AlertKind;
use etl_ingest::outcome::{IngestOutcome, SkipReason};
use etl_ingest::pipeline::ReprocessRequest;
use etl_ingest::store::memory::StoreOperation;
use etl_ingest::test_utils::{
    TEST_BUCKET, TestHarness, change_file_key, row, sorted_rows, table_columns, target_table,
    test_config,
};
use etl_ingest::types::{SourceObject, Value};
use etl_telemetry::tracing::init_test_tracing;

const ORDER_BATCH_COLUMNS: &[(&str, &str)] = &[
    ("id", "BIGINT"),
    ("status", "TEXT"),
    ("Op", "TEXT"),
    ("load_timestamp", "TIMESTAMP"),
];

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_710_000_000 + seconds, 0).unwrap()
}

fn order(id: i64, status: &str, op: &str, loaded_at: i64) -> etl_ingest::types::Row {
    row(&[
        ("id", Value::Int(id)),
        ("status", status.into()),
        ("Op", op.into()),
        ("load_timestamp", ts(loaded_at).into()),
    ])
}

fn target_order(id: i64, status: &str) -> etl_ingest::types::Row {
    row(&[("id", Value::Int(id)), ("status", status.into())])
}

/// Creates `public.orders` holding orders 3 and 4.
async fn create_orders(harness: &TestHarness) {
    let target = target_table("orders");
    harness
        .store
        .create_table(
            target.clone(),
            table_columns(&[("id", "BIGINT"), ("status", "TEXT")]),
            vec!["id".to_string()],
        )
        .await;
    harness
        .store
        .insert_rows(&target, vec![target_order(3, "old"), target_order(4, "untouched")])
        .await;
}

async fn add_order_changes(harness: &TestHarness, filename: &str) -> SourceObject {
    harness
        .add_change_file(
            "orders",
            filename,
            ORDER_BATCH_COLUMNS,
            vec![
                order(1, "new", "I", 0),
                order(1, "paid", "U", 10),
                order(2, "new", "I", 0),
                order(3, "old", "D", 5),
            ],
        )
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn change_file_is_deduplicated_and_merged() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;

    let outcome = harness.pipeline.process_object(object.clone()).await.unwrap();

    let summary = outcome.summary().unwrap();
    assert_eq!(summary.database, "fair");
    assert_eq!(summary.table, "orders");
    assert_eq!(summary.date.to_string(), "2024-03-15");
    assert_eq!(summary.rows_loaded, 4);
    assert_eq!(summary.duplicates_removed, 1);
    assert_eq!(summary.rows_merged, Some(3));
    assert_eq!(summary.attempts, 1);
    assert!(summary.columns_added.is_empty());
    assert!(summary.excluded_columns.is_empty());

    let target = target_table("orders");
    assert_eq!(
        sorted_rows(&harness.store, &target, "id").await,
        vec![
            target_order(1, "paid"),
            target_order(2, "new"),
            target_order(4, "untouched"),
        ]
    );

    // Staging and deduplicated tables are gone.
    assert_eq!(harness.store.table_names().await, vec![target]);

    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Completed);
    assert_eq!(entry.owner_id.as_deref(), Some("test-worker"));
    assert!(entry.completed_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn processing_a_file_twice_merges_it_once() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;

    let first = harness.pipeline.process_object(object.clone()).await.unwrap();
    let rows_after_first = sorted_rows(&harness.store, &target_table("orders"), "id").await;
    let second = harness.pipeline.process_object(object.clone()).await.unwrap();

    assert!(first.summary().is_some());
    assert_eq!(second.skip_reason(), Some(SkipReason::AlreadyProcessed));
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 1);
    assert_eq!(harness.store.calls(StoreOperation::LoadStaging).await, 1);
    assert_eq!(
        sorted_rows(&harness.store, &target_table("orders"), "id").await,
        rows_after_first
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn incompatible_decimal_columns_are_left_untouched() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("payments", Some("id"))]));
    let target = target_table("payments");
    harness
        .store
        .create_table(
            target.clone(),
            table_columns(&[("id", "BIGINT"), ("amount", "NUMERIC(38,10)")]),
            vec!["id".to_string()],
        )
        .await;
    harness
        .store
        .insert_rows(
            &target,
            vec![row(&[("id", Value::Int(1)), ("amount", "1.0000000000".into())])],
        )
        .await;
    let object = harness
        .add_change_file(
            "payments",
            "20240315-090000000.parquet",
            &[("id", "BIGINT"), ("amount", "NUMERIC(20,2)"), ("Op", "TEXT")],
            vec![
                row(&[("id", Value::Int(1)), ("amount", "2.50".into()), ("Op", "U".into())]),
                row(&[("id", Value::Int(2)), ("amount", "3.00".into()), ("Op", "I".into())]),
            ],
        )
        .await;

    let outcome = harness.pipeline.process_object(object).await.unwrap();

    assert_eq!(outcome.summary().unwrap().excluded_columns, vec!["amount"]);
    assert_eq!(
        sorted_rows(&harness.store, &target, "id").await,
        vec![
            row(&[("id", Value::Int(1)), ("amount", "1.0000000000".into())]),
            row(&[("id", Value::Int(2)), ("amount", Value::Null)]),
        ]
    );

    let alerts = harness.notifier.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertKind::ManualInterventionRequired);
    assert_eq!(alerts[0].table_name, "payments");
}

#[tokio::test(flavor = "multi_thread")]
async fn new_batch_columns_are_added_before_merging() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = harness
        .add_change_file(
            "orders",
            "20240315-130000000.parquet",
            &[("id", "BIGINT"), ("status", "TEXT"), ("discount", "DECIMAL(12,4)"), ("Op", "TEXT")],
            vec![row(&[
                ("id", Value::Int(5)),
                ("status", "new".into()),
                ("discount", "0.1500".into()),
                ("Op", "I".into()),
            ])],
        )
        .await;

    let outcome = harness.pipeline.process_object(object).await.unwrap();

    assert_eq!(outcome.summary().unwrap().columns_added, vec!["discount"]);
    let rows = sorted_rows(&harness.store, &target_table("orders"), "id").await;
    assert_eq!(
        rows.last().unwrap(),
        &row(&[
            ("id", Value::Int(5)),
            ("status", "new".into()),
            ("discount", "0.1500".into()),
        ])
    );
    assert_eq!(harness.store.calls(StoreOperation::AddColumn).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn decimal_mismatch_on_key_fails_the_file() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("ledgers", Some("id"))]));
    let target = target_table("ledgers");
    harness
        .store
        .create_table(
            target.clone(),
            table_columns(&[("id", "NUMERIC(38,10)"), ("name", "TEXT")]),
            vec!["id".to_string()],
        )
        .await;
    let object = harness
        .add_change_file(
            "ledgers",
            "20240315-100000000.parquet",
            &[("id", "NUMERIC(20,2)"), ("name", "TEXT")],
            vec![row(&[("id", "1.00".into()), ("name", "cash".into())])],
        )
        .await;

    let err = harness.pipeline.process_object(object.clone()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaIncompatible);
    assert_eq!(err.description(), "CDC file processing failed");
    let detail = err.detail().unwrap();
    assert!(detail.contains(&format!("file: {}", object.key)));
    assert!(detail.contains("keys: id"));

    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 0);
    assert_eq!(harness.store.table_names().await, vec![target.clone()]);
    assert!(harness.store.rows(&target).await.unwrap().is_empty());

    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert!(entry.error_message.is_some());

    let kinds: Vec<AlertKind> = harness
        .notifier
        .alerts()
        .await
        .iter()
        .map(|alert| alert.alert_type)
        .collect();
    assert_eq!(
        kinds,
        vec![AlertKind::ManualInterventionRequired, AlertKind::IngestionFailed]
    );
}

#[tokio::test(start_paused = true)]
async fn conflicting_merges_are_retried_with_growing_backoff() {
    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::Merge, ErrorKind::StoreConflict, None)
        .await;

    let err = harness.pipeline.process_object(object.clone()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 10);

    let instants = harness.store.merge_instants().await;
    let gaps: Vec<_> = instants.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(gaps.len(), 9);
    assert!(gaps.windows(2).all(|pair| pair[1] > pair[0]), "{gaps:?}");

    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert_eq!(harness.store.table_names().await, vec![target_table("orders")]);
}

#[tokio::test(start_paused = true)]
async fn transient_conflicts_recover_within_the_retry_budget() {
    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::Merge, ErrorKind::StoreConflict, Some(2))
        .await;

    let outcome = harness.pipeline.process_object(object).await.unwrap();

    assert_eq!(outcome.summary().unwrap().attempts, 3);
    assert!(harness.notifier.alerts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_is_retried_like_a_conflict() {
    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::Merge, ErrorKind::StoreUnavailable, Some(3))
        .await;

    let outcome = harness.pipeline.process_object(object.clone()).await.unwrap();

    assert_eq!(outcome.summary().unwrap().attempts, 4);
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 4);
    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn configured_cleanup_deletes_batch_keys_before_retries() {
    let mut config = test_config(&[("orders", Some("id"))]);
    config.merge.pre_merge_cleanup = PreMergeCleanup::BeforeRetries;
    let harness = TestHarness::new(config);
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::Merge, ErrorKind::StoreConflict, Some(1))
        .await;

    let outcome = harness.pipeline.process_object(object).await.unwrap();

    assert_eq!(outcome.summary().unwrap().attempts, 2);
    assert_eq!(harness.store.calls(StoreOperation::DeleteMatchingKeys).await, 1);
    // Order 3 was removed by the cleanup and its tombstone is not inserted.
    assert_eq!(
        sorted_rows(&harness.store, &target_table("orders"), "id").await,
        vec![
            target_order(1, "paid"),
            target_order(2, "new"),
            target_order(4, "untouched"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn ledger_errors_after_the_merge_fail_the_file() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness.ledger.fail_next_mark(ErrorKind::StoreQueryFailed).await;

    let err = harness.pipeline.process_object(object.clone()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StoreQueryFailed);
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 1);

    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);

    let alerts = harness.notifier.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertKind::IngestionFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_merge_errors_fail_without_retry() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::Merge, ErrorKind::StoreSyntaxError, None)
        .await;

    let err = harness.pipeline.process_object(object.clone()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StoreSyntaxError);
    assert!(!err.is_retryable());
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 1);

    let alerts = harness.notifier.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertKind::IngestionFailed);
    assert!(alerts[0].error_hash.is_some());
    assert_eq!(alerts[0].details["file_key"], object.key.as_str());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_files_are_claimed_again() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::LoadStaging, ErrorKind::StoreQueryFailed, Some(1))
        .await;

    assert!(harness.pipeline.process_object(object.clone()).await.is_err());
    let outcome = harness.pipeline.process_object(object.clone()).await.unwrap();

    assert!(outcome.summary().is_some());
    let entry = harness.ledger.entry(&object.key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Completed);
    assert_eq!(entry.attempt_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_failures_do_not_fail_the_file() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .store
        .fail_operation(StoreOperation::DropTable, ErrorKind::StoreUnavailable, None)
        .await;

    let outcome = harness.pipeline.process_object(object.clone()).await.unwrap();

    assert!(outcome.summary().is_some());
    assert_eq!(harness.store.calls(StoreOperation::DropTable).await, 2);
    let (done, _) = harness.ledger.is_done(&object.key).await.unwrap();
    assert!(done);
}

#[tokio::test(flavor = "multi_thread")]
async fn files_outside_the_change_layout_are_skipped() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id")), ("audit", None)]));
    create_orders(&harness).await;

    let cases = [
        ("fair/orders/readme.txt", SkipReason::NotACdcFile),
        ("fair/orders/2024/02/30/a.parquet", SkipReason::NotACdcFile),
        ("other/orders/2024/03/15/a.parquet", SkipReason::NotACdcFile),
        ("fair/orders/2024/03/15/LOAD00000001.parquet", SkipReason::LoadFile),
        ("fair/audit/2024/03/15/a.parquet", SkipReason::NoKeysConfigured),
        ("fair/unconfigured/2024/03/15/a.parquet", SkipReason::NoKeysConfigured),
    ];

    for (key, reason) in cases {
        let outcome = harness
            .pipeline
            .process_object(SourceObject::new(TEST_BUCKET, key))
            .await
            .unwrap();
        assert_eq!(outcome.skip_reason(), Some(reason), "{key}");
    }

    assert!(harness.ledger.entries().await.is_empty());
    assert_eq!(harness.store.calls(StoreOperation::LoadStaging).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn files_claimed_by_another_worker_are_skipped() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness
        .ledger
        .try_claim(&object.key, "other-worker")
        .await
        .unwrap();

    let outcome = harness.pipeline.process_object(object).await.unwrap();

    assert_eq!(outcome.skip_reason(), Some(SkipReason::ClaimedByOtherWorker));
    assert_eq!(harness.store.calls(StoreOperation::LoadStaging).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_event_record_gets_an_outcome() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    add_order_changes(&harness, "changes 1.parquet").await;

    let event = ObjectEvent::from_json(
        serde_json::json!({
            "Records": [
                {
                    "s3": {
                        "bucket": { "name": TEST_BUCKET },
                        "object": { "key": "fair/orders/2024/03/15/changes+1.parquet" }
                    }
                },
                {
                    "s3": {
                        "bucket": { "name": TEST_BUCKET },
                        "object": { "key": "fair/orders/notes%2Etxt" }
                    }
                }
            ]
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap();

    let results = harness.pipeline.process_event(&event).await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Ok(IngestOutcome::Success(_))));
    assert_eq!(
        results[1].as_ref().unwrap().skip_reason(),
        Some(SkipReason::NotACdcFile)
    );
    let (done, _) = harness
        .ledger
        .is_done(&change_file_key("orders", "changes 1.parquet"))
        .await
        .unwrap();
    assert!(done);
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_snapshots_are_written_per_table() {
    init_test_tracing();

    let mut config = test_config(&[("orders", Some("id"))]);
    config.schema.snapshots = Some(SnapshotConfig {
        bucket: "cdc-metadata".to_string(),
        prefix: "schema_metadata/".to_string(),
    });
    let harness = TestHarness::new(config);
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;

    harness.pipeline.process_object(object).await.unwrap();

    let snapshot = harness
        .blobs
        .get("cdc-metadata", "schema_metadata/orders_schema.json")
        .await
        .unwrap()
        .unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&snapshot).unwrap();
    assert_eq!(snapshot["table_name"], "orders");
    assert_eq!(snapshot["schema"]["status"], "TEXT");
    assert!(snapshot["schema"].get("ingestion_seq").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn reprocess_skips_done_files_unless_forced() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let first = add_order_changes(&harness, "a.parquet").await;
    let second = add_order_changes(&harness, "b.parquet").await;
    for object in [&first, &second] {
        harness
            .blobs
            .put(TEST_BUCKET, &object.key, Bytes::from_static(b"PAR1"))
            .await
            .unwrap();
    }
    harness.pipeline.process_object(first.clone()).await.unwrap();

    let mut request = ReprocessRequest {
        bucket: TEST_BUCKET.to_string(),
        prefix: "fair/orders/".to_string(),
        tables: vec!["orders".to_string()],
        force: false,
        concurrency: 2,
    };

    let report = harness.pipeline.reprocess(&request).await.unwrap();
    assert_eq!(report.results[0].0, first.key);
    assert_eq!(
        report.results[0].1.as_ref().unwrap().skip_reason(),
        Some(SkipReason::AlreadyProcessed)
    );
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.failed(), 0);

    request.force = true;
    let report = harness.pipeline.reprocess(&request).await.unwrap();
    assert_eq!(report.succeeded(), 2);
    assert_eq!(harness.store.calls(StoreOperation::Merge).await, 4);

    request.tables = vec!["customers".to_string()];
    let report = harness.pipeline.reprocess(&request).await.unwrap();
    assert!(report.results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn pruning_removes_entries_past_retention() {
    init_test_tracing();

    let harness = TestHarness::new(test_config(&[("orders", Some("id"))]));
    create_orders(&harness).await;
    let object = add_order_changes(&harness, "20240315-120000000.parquet").await;
    harness.pipeline.process_object(object.clone()).await.unwrap();

    assert_eq!(harness.pipeline.prune_ledger().await.unwrap(), 0);

    harness
        .ledger
        .backdate(&object.key, chrono::TimeDelta::days(31))
        .await;
    assert_eq!(harness.pipeline.prune_ledger().await.unwrap(), 1);
    assert!(harness.ledger.entry(&object.key).await.unwrap().is_none());
}
