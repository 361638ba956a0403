use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;

/// State of a file in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Processing,
    Completed,
    Failed,
    /// Applied as part of an aggregate run outside of per-file processing.
    BatchProcessed,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Processing => "processing",
            LedgerStatus::Completed => "completed",
            LedgerStatus::Failed => "failed",
            LedgerStatus::BatchProcessed => "batch_processed",
        }
    }

    /// Returns `true` when the file must not be processed again. Failed files are not done.
    pub fn is_done(self) -> bool {
        matches!(self, LedgerStatus::Completed | LedgerStatus::BatchProcessed)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = EtlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "processing" => Ok(LedgerStatus::Processing),
            "completed" => Ok(LedgerStatus::Completed),
            "failed" => Ok(LedgerStatus::Failed),
            "batch_processed" => Ok(LedgerStatus::BatchProcessed),
            other => Err(etl_error!(
                ErrorKind::InvalidState,
                "Unknown ledger status",
                detail = other.to_string()
            )),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub file_key: String,
    pub status: LedgerStatus,
    pub owner_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`FileLedger::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the file. `attempt` counts claims of the file, starting at 1.
    Claimed { attempt: u32 },
    /// The file was already processed.
    AlreadyDone(LedgerStatus),
    /// Another worker holds a claim that is not yet stale.
    HeldByOther { owner_id: Option<String> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }
}

/// Result of [`FileLedger::mark_completed`] and [`FileLedger::mark_failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The entry moved out of `processing`.
    Recorded,
    /// The caller no longer holds a `processing` claim of the file, usually because its claim
    /// went stale and was taken over. Nothing was written.
    ClaimLost {
        owner_id: Option<String>,
        status: Option<LedgerStatus>,
    },
}

impl MarkOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, MarkOutcome::Recorded)
    }
}

/// Durable, idempotent record of which files were processed.
///
/// Claims rely on the uniqueness of the file key: of several concurrent claims of the same
/// key, exactly one succeeds. A `processing` entry older than the configured staleness
/// threshold, or a `failed` entry, may be claimed again.
///
/// Completions and failures are fenced by the owner: they only apply to a `processing`
/// entry claimed by `owner_id`.
pub trait FileLedger {
    fn try_claim(
        &self,
        file_key: &str,
        owner_id: &str,
    ) -> impl Future<Output = EtlResult<ClaimOutcome>> + Send;

    fn mark_completed(
        &self,
        file_key: &str,
        owner_id: &str,
    ) -> impl Future<Output = EtlResult<MarkOutcome>> + Send;

    /// Records a failure. `reason` is stored truncated to the configured length.
    fn mark_failed(
        &self,
        file_key: &str,
        owner_id: &str,
        reason: &str,
    ) -> impl Future<Output = EtlResult<MarkOutcome>> + Send;

    /// Returns whether the file is done and its current status, if any.
    fn is_done(
        &self,
        file_key: &str,
    ) -> impl Future<Output = EtlResult<(bool, Option<LedgerStatus>)>> + Send;

    fn entry(&self, file_key: &str) -> impl Future<Output = EtlResult<Option<LedgerEntry>>> + Send;

    /// Removes the entry of `file_key`. Returns `true` if one existed.
    fn reset(&self, file_key: &str) -> impl Future<Output = EtlResult<bool>> + Send;

    /// Removes entries last updated before `older_than`. Returns the number removed.
    fn prune(&self, older_than: DateTime<Utc>) -> impl Future<Output = EtlResult<u64>> + Send;
}
