use chrono::{DateTime, Utc};
use etl_config::shared::LedgerConfig;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::ledger::truncate_message;
use crate::ledger::{ClaimOutcome, FileLedger, LedgerEntry, LedgerStatus, MarkOutcome};

const INSERT_CLAIM: &str = r#"
insert into etl.cdc_processed_files
    (file_key, status, owner_id, claimed_at, attempt_count, updated_at)
values ($1, 'processing', $2, now(), 1, now())
"#;

/// Takes over a failed entry or a `processing` entry whose claim is older than `$3` seconds.
const RECLAIM: &str = r#"
update etl.cdc_processed_files
set status = 'processing',
    owner_id = $2,
    claimed_at = now(),
    completed_at = null,
    error_message = null,
    attempt_count = attempt_count + 1,
    updated_at = now()
where file_key = $1
  and (status = 'failed'
       or (status = 'processing' and claimed_at < now() - make_interval(secs => $3)))
returning attempt_count
"#;

const MARK_COMPLETED: &str = r#"
update etl.cdc_processed_files
set status = 'completed',
    completed_at = now(),
    error_message = null,
    updated_at = now()
where file_key = $1 and owner_id = $2 and status = 'processing'
"#;

const MARK_FAILED: &str = r#"
update etl.cdc_processed_files
set status = 'failed',
    error_message = $3,
    updated_at = now()
where file_key = $1 and owner_id = $2 and status = 'processing'
"#;

const SELECT_ENTRY: &str = r#"
select file_key, status, owner_id, claimed_at, completed_at, error_message, attempt_count, updated_at
from etl.cdc_processed_files
where file_key = $1
"#;

type EntryRow = (
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<String>,
    i32,
    DateTime<Utc>,
);

/// [`FileLedger`] stored in the `etl.cdc_processed_files` table of the target store.
///
/// The table is created by [`crate::migrations::apply_ingest_migrations`].
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    stale_after_secs: f64,
    error_message_max_len: usize,
}

impl PostgresLedger {
    pub fn new(pool: PgPool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            stale_after_secs: config.stale_after_secs as f64,
            error_message_max_len: config.error_message_max_len,
        }
    }
}

impl PostgresLedger {
    /// Reports who holds the entry when a fenced update matched no row.
    async fn mark_outcome(&self, file_key: &str, rows_affected: u64) -> EtlResult<MarkOutcome> {
        if rows_affected > 0 {
            return Ok(MarkOutcome::Recorded);
        }

        let entry = self.entry(file_key).await?;
        Ok(MarkOutcome::ClaimLost {
            owner_id: entry.as_ref().and_then(|entry| entry.owner_id.clone()),
            status: entry.map(|entry| entry.status),
        })
    }
}

impl FileLedger for PostgresLedger {
    async fn try_claim(&self, file_key: &str, owner_id: &str) -> EtlResult<ClaimOutcome> {
        let inserted = sqlx::query(INSERT_CLAIM)
            .bind(file_key)
            .bind(owner_id)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => return Ok(ClaimOutcome::Claimed { attempt: 1 }),
            Err(err) => {
                let err = EtlError::from(err);
                if err.kind() != ErrorKind::UniqueViolation {
                    return Err(err);
                }
                debug!(file_key, "ledger entry exists, attempting reclaim");
            }
        }

        let reclaimed: Option<i32> = sqlx::query_scalar(RECLAIM)
            .bind(file_key)
            .bind(owner_id)
            .bind(self.stale_after_secs)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(attempt) = reclaimed {
            return Ok(ClaimOutcome::Claimed {
                attempt: attempt.max(1) as u32,
            });
        }

        match self.entry(file_key).await? {
            Some(entry) if entry.status.is_done() => Ok(ClaimOutcome::AlreadyDone(entry.status)),
            Some(entry) => Ok(ClaimOutcome::HeldByOther {
                owner_id: entry.owner_id,
            }),
            // Removed between the insert and the reclaim; the next trigger claims it.
            None => Ok(ClaimOutcome::HeldByOther { owner_id: None }),
        }
    }

    async fn mark_completed(&self, file_key: &str, owner_id: &str) -> EtlResult<MarkOutcome> {
        let result = sqlx::query(MARK_COMPLETED)
            .bind(file_key)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        self.mark_outcome(file_key, result.rows_affected()).await
    }

    async fn mark_failed(
        &self,
        file_key: &str,
        owner_id: &str,
        reason: &str,
    ) -> EtlResult<MarkOutcome> {
        let result = sqlx::query(MARK_FAILED)
            .bind(file_key)
            .bind(owner_id)
            .bind(truncate_message(reason, self.error_message_max_len))
            .execute(&self.pool)
            .await?;

        self.mark_outcome(file_key, result.rows_affected()).await
    }

    async fn is_done(&self, file_key: &str) -> EtlResult<(bool, Option<LedgerStatus>)> {
        let status: Option<String> =
            sqlx::query_scalar("select status from etl.cdc_processed_files where file_key = $1")
                .bind(file_key)
                .fetch_optional(&self.pool)
                .await?;

        let status = status.map(|status| status.parse::<LedgerStatus>()).transpose()?;

        Ok((status.is_some_and(LedgerStatus::is_done), status))
    }

    async fn entry(&self, file_key: &str) -> EtlResult<Option<LedgerEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(SELECT_ENTRY)
            .bind(file_key)
            .fetch_optional(&self.pool)
            .await?;

        let Some((
            file_key,
            status,
            owner_id,
            claimed_at,
            completed_at,
            error_message,
            attempt_count,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(LedgerEntry {
            file_key,
            status: status.parse()?,
            owner_id,
            claimed_at,
            completed_at,
            error_message,
            attempt_count: attempt_count.max(0) as u32,
            updated_at,
        }))
    }

    async fn reset(&self, file_key: &str) -> EtlResult<bool> {
        let result = sqlx::query("delete from etl.cdc_processed_files where file_key = $1")
            .bind(file_key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> EtlResult<u64> {
        let result = sqlx::query("delete from etl.cdc_processed_files where updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
