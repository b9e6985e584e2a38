//! In-process [`MatchStore`] for embedding and tests.

use crate::models::{
    LocalRange, Match, MatchSort, NewMatch, Page, PageRequest, RawTransaction, Report,
    ReportStats, Side,
};
use crate::services::store::{MatchStore, UnmatchWrite};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    reports: HashMap<i64, Report>,
    transactions: BTreeMap<i64, RawTransaction>,
    matches: BTreeMap<i64, Match>,
    next_match_id: i64,
}

impl State {
    fn conflicts(&self, new_match: &NewMatch) -> bool {
        self.matches.values().any(|m| {
            m.report_id == new_match.report_id
                && (m.side_a_id == new_match.side_a_id || m.side_b_id == new_match.side_b_id)
        })
    }

    fn insert(&mut self, new_match: &NewMatch) -> Option<Match> {
        if self.conflicts(new_match) {
            return None;
        }
        self.next_match_id += 1;
        let stored = Match {
            match_id: self.next_match_id,
            report_id: new_match.report_id,
            side_a_id: new_match.side_a_id,
            side_b_id: new_match.side_b_id,
            time_difference_secs: new_match.time_difference_secs,
            gross_expense: new_match.financials.gross_expense,
            gross_income: new_match.financials.gross_income,
            gross_profit: new_match.financials.gross_profit,
            profit_percentage: new_match.financials.profit_percentage,
            origin: new_match.origin,
            created_by: new_match.created_by.clone(),
            created_utc: Utc::now(),
        };
        self.matches.insert(stored.match_id, stored.clone());
        Some(stored)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a report.
    pub async fn put_report(&self, report: Report) {
        let mut state = self.state.write().await;
        state.reports.insert(report.report_id, report);
    }

    /// Add or replace a source transaction.
    pub async fn put_transaction(&self, transaction: RawTransaction) {
        let mut state = self.state.write().await;
        state
            .transactions
            .insert(transaction.transaction_id, transaction);
    }
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn get_report(&self, report_id: i64) -> Result<Option<Report>, AppError> {
        Ok(self.state.read().await.reports.get(&report_id).cloned())
    }

    async fn update_report_stats(
        &self,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.reports.get_mut(&report_id) {
            Some(report) if report.version == expected_version => {
                report.stats = stats.clone();
                report.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Report {} not found",
                report_id
            ))),
        }
    }

    async fn get_transaction(
        &self,
        source: &str,
        transaction_id: i64,
    ) -> Result<Option<RawTransaction>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(&transaction_id)
            .filter(|t| t.source == source)
            .cloned())
    }

    async fn fetch_unmatched(
        &self,
        source: &str,
        accounts: &[String],
        range: &LocalRange,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<RawTransaction>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| {
                t.source == source
                    && accounts.contains(&t.account_id)
                    && range.contains(t.recorded_at)
                    && !exclude.contains(&t.transaction_id)
            })
            .cloned()
            .collect())
    }

    async fn matched_transaction_ids(
        &self,
        report_id: i64,
        side: Side,
    ) -> Result<HashSet<i64>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .matches
            .values()
            .filter(|m| m.report_id == report_id)
            .map(|m| m.transaction_id(side))
            .collect())
    }

    async fn find_match_by_transaction(
        &self,
        report_id: i64,
        side: Side,
        transaction_id: i64,
    ) -> Result<Option<Match>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .matches
            .values()
            .find(|m| m.report_id == report_id && m.transaction_id(side) == transaction_id)
            .cloned())
    }

    async fn bulk_insert_matches(&self, matches: &[NewMatch]) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for new_match in matches {
            if state.insert(new_match).is_some() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_match(&self, new_match: &NewMatch) -> Result<Option<Match>, AppError> {
        Ok(self.state.write().await.insert(new_match))
    }

    async fn fetch_matches(
        &self,
        report_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Match>, AppError> {
        let state = self.state.read().await;
        let mut items: Vec<Match> = state
            .matches
            .values()
            .filter(|m| m.report_id == report_id)
            .cloned()
            .collect();

        match page.sort {
            MatchSort::CreatedAsc => items.sort_by_key(|m| m.match_id),
            MatchSort::CreatedDesc => items.sort_by_key(|m| std::cmp::Reverse(m.match_id)),
            MatchSort::ProfitAsc => items.sort_by_key(|m| (m.gross_profit, m.match_id)),
            MatchSort::ProfitDesc => {
                items.sort_by(|x, y| {
                    y.gross_profit
                        .cmp(&x.gross_profit)
                        .then(x.match_id.cmp(&y.match_id))
                })
            }
            MatchSort::TimeDifferenceAsc => {
                items.sort_by_key(|m| (m.time_difference_secs, m.match_id))
            }
        }

        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .collect();

        Ok(Page {
            items,
            page: page.page,
            page_size: page.page_size,
            total,
        })
    }

    async fn all_matches(&self, report_id: i64) -> Result<Vec<Match>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .matches
            .values()
            .filter(|m| m.report_id == report_id)
            .cloned()
            .collect())
    }

    async fn delete_match(&self, match_id: i64, report_id: i64) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.matches.get(&match_id) {
            Some(m) if m.report_id == report_id => {
                state.matches.remove(&match_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_match_with_stats(
        &self,
        match_id: i64,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<UnmatchWrite, AppError> {
        let mut state = self.state.write().await;
        match state.reports.get(&report_id) {
            Some(report) if report.version == expected_version => {}
            Some(_) => return Ok(UnmatchWrite::VersionMoved),
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Report {} not found",
                    report_id
                )))
            }
        }
        if !matches!(state.matches.get(&match_id), Some(m) if m.report_id == report_id) {
            return Ok(UnmatchWrite::MatchMissing);
        }

        state.matches.remove(&match_id);
        if let Some(report) = state.reports.get_mut(&report_id) {
            report.stats = stats.clone();
            report.version += 1;
        }
        Ok(UnmatchWrite::Deleted)
    }
}
