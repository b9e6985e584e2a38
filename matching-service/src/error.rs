//! Error type shared by every public matching operation.

use crate::models::Side;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: side {side} transaction {transaction_id} is already matched in report {report_id} (match {existing_match_id:?})")]
    Conflict {
        report_id: i64,
        side: Side,
        transaction_id: i64,
        existing_match_id: Option<i64>,
    },

    #[error("Report {0} is busy with another matching operation")]
    ReportBusy(i64),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] AppError),

    #[error("Auto-match interrupted after committing {committed} matches: {source}")]
    Interrupted {
        committed: u64,
        #[source]
        source: Box<MatchError>,
    },
}

impl MatchError {
    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ReportBusy(_) => "report_busy",
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::Computation(_) => "computation",
            Self::Storage(_) => "storage",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Whether retrying the same storage call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(AppError::DatabaseError(_)) | Self::Storage(AppError::ServiceUnavailable)
        )
    }

    /// Number of matches committed before the failure, if any were.
    pub fn committed(&self) -> u64 {
        match self {
            Self::Interrupted { committed, .. } => *committed,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_the_transaction() {
        let err = MatchError::Conflict {
            report_id: 5,
            side: Side::A,
            transaction_id: 7,
            existing_match_id: Some(12),
        };
        let message = err.to_string();
        assert!(message.contains("transaction 7"));
        assert!(message.contains("report 5"));
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn only_database_failures_are_transient() {
        let db = MatchError::Storage(AppError::DatabaseError(anyhow::anyhow!("connection reset")));
        let missing = MatchError::Storage(AppError::NotFound(anyhow::anyhow!("gone")));
        assert!(db.is_transient());
        assert!(!missing.is_transient());
        assert!(!MatchError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn interrupted_reports_committed_count() {
        let err = MatchError::Interrupted {
            committed: 40,
            source: Box::new(MatchError::Storage(AppError::ServiceUnavailable)),
        };
        assert_eq!(err.committed(), 40);
        assert_eq!(MatchError::ReportBusy(1).committed(), 0);
    }
}
