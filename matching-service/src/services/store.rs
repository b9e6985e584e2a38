//! Storage interface consumed by the matching core.

use crate::models::{
    LocalRange, Match, NewMatch, Page, PageRequest, RawTransaction, Report, ReportStats, Side,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::HashSet;

/// Outcome of [`MatchStore::delete_match_with_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchWrite {
    /// Match removed and stats written together.
    Deleted,
    /// No such match in the report; nothing changed.
    MatchMissing,
    /// The report moved past `expected_version`; nothing changed.
    VersionMoved,
}

/// Persistence for reports, source transactions and matches.
///
/// Implementations must enforce per-report uniqueness of matched
/// transactions: a side A or side B id appears in at most one live match of a
/// report. Inserts that would break it are skipped, not failed.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get_report(&self, report_id: i64) -> Result<Option<Report>, AppError>;

    /// Write recomputed stats if the report is still at `expected_version`.
    /// Returns `false` when another writer moved the version first.
    async fn update_report_stats(
        &self,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<bool, AppError>;

    async fn get_transaction(
        &self,
        source: &str,
        transaction_id: i64,
    ) -> Result<Option<RawTransaction>, AppError>;

    /// Transactions of `source` on any of `accounts` recorded within `range`,
    /// minus `exclude`.
    async fn fetch_unmatched(
        &self,
        source: &str,
        accounts: &[String],
        range: &LocalRange,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<RawTransaction>, AppError>;

    /// Ids on `side` already used by a live match of the report.
    async fn matched_transaction_ids(
        &self,
        report_id: i64,
        side: Side,
    ) -> Result<HashSet<i64>, AppError>;

    async fn find_match_by_transaction(
        &self,
        report_id: i64,
        side: Side,
        transaction_id: i64,
    ) -> Result<Option<Match>, AppError>;

    /// Insert matches, skipping conflicting ones. Returns how many landed.
    async fn bulk_insert_matches(&self, matches: &[NewMatch]) -> Result<u64, AppError>;

    /// Insert one match. `None` means it conflicted with a live match.
    async fn insert_match(&self, new_match: &NewMatch) -> Result<Option<Match>, AppError>;

    async fn fetch_matches(
        &self,
        report_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Match>, AppError>;

    async fn all_matches(&self, report_id: i64) -> Result<Vec<Match>, AppError>;

    /// Delete a match of the given report. `false` when there is none.
    async fn delete_match(&self, match_id: i64, report_id: i64) -> Result<bool, AppError>;

    /// Delete a match and store the report's stats in one atomic write.
    /// Either both land or neither does.
    async fn delete_match_with_stats(
        &self,
        match_id: i64,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<UnmatchWrite, AppError>;
}
