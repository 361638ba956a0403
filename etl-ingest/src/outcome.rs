use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// Reason a file was skipped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotACdcFile,
    LoadFile,
    NoKeysConfigured,
    AlreadyProcessed,
    ClaimedByOtherWorker,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NotACdcFile => "not-a-cdc-file",
            SkipReason::LoadFile => "load-file",
            SkipReason::NoKeysConfigured => "no-keys-configured",
            SkipReason::AlreadyProcessed => "already-processed",
            SkipReason::ClaimedByOtherWorker => "claimed-by-other-worker",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a merged file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub database: String,
    pub table: String,
    pub date: NaiveDate,
    pub filename: String,
    pub rows_loaded: u64,
    /// Rows reported by the store for the merge, when it reports any.
    pub rows_merged: Option<u64>,
    pub duplicates_removed: u64,
    pub columns_added: Vec<String>,
    pub excluded_columns: Vec<String>,
    pub attempts: u32,
    pub duration_seconds: f64,
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Success(IngestSummary),
    Skipped { file_key: String, reason: SkipReason },
}

impl IngestOutcome {
    pub fn skipped(file_key: impl Into<String>, reason: SkipReason) -> Self {
        IngestOutcome::Skipped {
            file_key: file_key.into(),
            reason,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            IngestOutcome::Success(_) => None,
            IngestOutcome::Skipped { reason, .. } => Some(*reason),
        }
    }

    pub fn summary(&self) -> Option<&IngestSummary> {
        match self {
            IngestOutcome::Success(summary) => Some(summary),
            IngestOutcome::Skipped { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let skipped = IngestOutcome::skipped("fair/orders/x.parquet", SkipReason::ClaimedByOtherWorker);
        assert_eq!(
            serde_json::to_value(&skipped).unwrap(),
            serde_json::json!({
                "status": "skipped",
                "file_key": "fair/orders/x.parquet",
                "reason": "claimed-by-other-worker"
            })
        );

        let success = IngestOutcome::Success(IngestSummary {
            database: "fair".to_string(),
            table: "orders".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            filename: "a.parquet".to_string(),
            rows_loaded: 3,
            rows_merged: Some(2),
            duplicates_removed: 1,
            columns_added: vec![],
            excluded_columns: vec!["amount".to_string()],
            attempts: 1,
            duration_seconds: 0.5,
        });
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["date"], "2024-01-02");
        assert_eq!(value["excluded_columns"][0], "amount");
    }

    #[test]
    fn reason_codes_match_serialization() {
        for reason in [
            SkipReason::NotACdcFile,
            SkipReason::LoadFile,
            SkipReason::NoKeysConfigured,
            SkipReason::AlreadyProcessed,
            SkipReason::ClaimedByOtherWorker,
        ] {
            assert_eq!(serde_json::to_value(reason).unwrap(), reason.as_str());
        }
    }
}
