use chrono::{DateTime, TimeDelta, Utc};
use etl_config::shared::LedgerConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::ledger::truncate_message;
use crate::ledger::{ClaimOutcome, FileLedger, LedgerEntry, LedgerStatus, MarkOutcome};

/// In-memory [`FileLedger`].
///
/// All claims go through a single lock, which gives the same mutual exclusion as the unique
/// file key of [`super::postgres::PostgresLedger`].
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    entries: Arc<Mutex<BTreeMap<String, LedgerEntry>>>,
    /// Kind of the error returned by the next completion or failure mark.
    mark_failure: Arc<Mutex<Option<ErrorKind>>>,
    stale_after: TimeDelta,
    error_message_max_len: usize,
}

impl MemoryLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            mark_failure: Arc::new(Mutex::new(None)),
            stale_after: TimeDelta::seconds(config.stale_after_secs as i64),
            error_message_max_len: config.error_message_max_len,
        }
    }

    /// Inserts or replaces an entry as-is.
    pub async fn insert(&self, entry: LedgerEntry) {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.file_key.clone(), entry);
    }

    /// Moves the claim and update times of an entry `age` into the past.
    pub async fn backdate(&self, file_key: &str, age: TimeDelta) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(file_key) {
            entry.claimed_at -= age;
            entry.updated_at -= age;
        }
    }

    /// Fails the next [`FileLedger::mark_completed`] or [`FileLedger::mark_failed`] with `kind`.
    pub async fn fail_next_mark(&self, kind: ErrorKind) {
        *self.mark_failure.lock().await = Some(kind);
    }

    async fn take_mark_failure(&self) -> EtlResult<()> {
        match self.mark_failure.lock().await.take() {
            Some(kind) => Err(etl_error!(kind, "Injected ledger failure")),
            None => Ok(()),
        }
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        let entries = self.entries.lock().await;
        entries.values().cloned().collect()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(&LedgerConfig::default())
    }
}

fn new_entry(file_key: &str, status: LedgerStatus, now: DateTime<Utc>) -> LedgerEntry {
    LedgerEntry {
        file_key: file_key.to_string(),
        status,
        owner_id: None,
        claimed_at: now,
        completed_at: None,
        error_message: None,
        attempt_count: 1,
        updated_at: now,
    }
}

/// Returns the entry of `file_key` if `owner_id` holds its `processing` claim.
fn owned_claim<'a>(
    entries: &'a mut BTreeMap<String, LedgerEntry>,
    file_key: &str,
    owner_id: &str,
) -> Result<&'a mut LedgerEntry, MarkOutcome> {
    match entries.get_mut(file_key) {
        Some(entry)
            if entry.status == LedgerStatus::Processing
                && entry.owner_id.as_deref() == Some(owner_id) =>
        {
            Ok(entry)
        }
        Some(entry) => Err(MarkOutcome::ClaimLost {
            owner_id: entry.owner_id.clone(),
            status: Some(entry.status),
        }),
        None => Err(MarkOutcome::ClaimLost {
            owner_id: None,
            status: None,
        }),
    }
}

impl FileLedger for MemoryLedger {
    async fn try_claim(&self, file_key: &str, owner_id: &str) -> EtlResult<ClaimOutcome> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let Some(entry) = entries.get_mut(file_key) else {
            let mut entry = new_entry(file_key, LedgerStatus::Processing, now);
            entry.owner_id = Some(owner_id.to_string());
            entries.insert(file_key.to_string(), entry);

            return Ok(ClaimOutcome::Claimed { attempt: 1 });
        };

        let reclaimable = match entry.status {
            LedgerStatus::Failed => true,
            LedgerStatus::Processing => entry.claimed_at < now - self.stale_after,
            LedgerStatus::Completed | LedgerStatus::BatchProcessed => {
                return Ok(ClaimOutcome::AlreadyDone(entry.status));
            }
        };

        if !reclaimable {
            return Ok(ClaimOutcome::HeldByOther {
                owner_id: entry.owner_id.clone(),
            });
        }

        entry.status = LedgerStatus::Processing;
        entry.owner_id = Some(owner_id.to_string());
        entry.claimed_at = now;
        entry.completed_at = None;
        entry.error_message = None;
        entry.attempt_count += 1;
        entry.updated_at = now;

        Ok(ClaimOutcome::Claimed {
            attempt: entry.attempt_count,
        })
    }

    async fn mark_completed(&self, file_key: &str, owner_id: &str) -> EtlResult<MarkOutcome> {
        self.take_mark_failure().await?;
        let mut entries = self.entries.lock().await;

        let entry = match owned_claim(&mut entries, file_key, owner_id) {
            Ok(entry) => entry,
            Err(lost) => return Ok(lost),
        };
        let now = Utc::now();
        entry.status = LedgerStatus::Completed;
        entry.completed_at = Some(now);
        entry.error_message = None;
        entry.updated_at = now;

        Ok(MarkOutcome::Recorded)
    }

    async fn mark_failed(
        &self,
        file_key: &str,
        owner_id: &str,
        reason: &str,
    ) -> EtlResult<MarkOutcome> {
        self.take_mark_failure().await?;
        let mut entries = self.entries.lock().await;

        let entry = match owned_claim(&mut entries, file_key, owner_id) {
            Ok(entry) => entry,
            Err(lost) => return Ok(lost),
        };
        entry.status = LedgerStatus::Failed;
        entry.error_message = Some(truncate_message(reason, self.error_message_max_len));
        entry.updated_at = Utc::now();

        Ok(MarkOutcome::Recorded)
    }

    async fn is_done(&self, file_key: &str) -> EtlResult<(bool, Option<LedgerStatus>)> {
        let entries = self.entries.lock().await;
        let status = entries.get(file_key).map(|entry| entry.status);

        Ok((status.is_some_and(LedgerStatus::is_done), status))
    }

    async fn entry(&self, file_key: &str) -> EtlResult<Option<LedgerEntry>> {
        let entries = self.entries.lock().await;

        Ok(entries.get(file_key).cloned())
    }

    async fn reset(&self, file_key: &str) -> EtlResult<bool> {
        let mut entries = self.entries.lock().await;

        Ok(entries.remove(file_key).is_some())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> EtlResult<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.updated_at >= older_than);

        Ok((before - entries.len()) as u64)
    }
}
