//! Candidate selection for a report.

use crate::engine::profile::EngineProfile;
use crate::error::MatchError;
use crate::models::{AccountScope, Report, Side, SourceRecord};
use crate::services::store::MatchStore;
use tracing::{debug, instrument};

/// Unmatched transactions of both sides eligible for a report.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub side_a: Vec<SourceRecord>,
    pub side_b: Vec<SourceRecord>,
}

pub struct CandidateFinder<'a> {
    store: &'a dyn MatchStore,
    profile: &'a EngineProfile,
}

impl<'a> CandidateFinder<'a> {
    pub fn new(store: &'a dyn MatchStore, profile: &'a EngineProfile) -> Self {
        Self { store, profile }
    }

    /// Fail unless the report period is ordered and both sides of the report
    /// have at least one account.
    pub fn check_scope(report: &Report) -> Result<(), MatchError> {
        if report.period.end < report.period.start {
            return Err(MatchError::Validation(format!(
                "report {} period ends at {} before it starts at {}",
                report.report_id, report.period.end, report.period.start
            )));
        }
        for side in [Side::A, Side::B] {
            let scope = report.scope_for(side);
            if scope.is_empty() {
                return Err(MatchError::Configuration(format!(
                    "report {} has no side {} accounts in scope",
                    report.report_id, side
                )));
            }
            if let Some(bad) = scope.iter().find(|s| s.account_id.trim().is_empty()) {
                return Err(MatchError::Configuration(format!(
                    "report {} has a blank side {} account id ({:?})",
                    report.report_id, side, bad
                )));
            }
            if let Some(bad) = scope.iter().find(|s| {
                matches!((s.effective_start, s.effective_end), (Some(start), Some(end)) if end < start)
            }) {
                return Err(MatchError::Configuration(format!(
                    "report {} account {} has an inverted effective period",
                    report.report_id, bad.account_id
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, report), fields(report_id = report.report_id, profile = %self.profile.name))]
    pub async fn find(&self, report: &Report) -> Result<CandidateSet, MatchError> {
        Self::check_scope(report)?;

        let side_a = self.find_side(report, Side::A).await?;
        let side_b = self.find_side(report, Side::B).await?;

        debug!(
            side_a = side_a.len(),
            side_b = side_b.len(),
            "Candidates loaded"
        );

        Ok(CandidateSet { side_a, side_b })
    }

    async fn find_side(&self, report: &Report, side: Side) -> Result<Vec<SourceRecord>, MatchError> {
        let scope: Vec<&AccountScope> = report.scope_for(side);
        let mut accounts: Vec<String> = scope.iter().map(|s| s.account_id.clone()).collect();
        accounts.sort_unstable();
        accounts.dedup();

        // Read fresh on every run; a cached set would let a rerun reuse ids.
        let excluded = self
            .store
            .matched_transaction_ids(report.report_id, side)
            .await?;

        let adapter = self.profile.adapter(side);
        let raw = self
            .store
            .fetch_unmatched(
                adapter.source(),
                &accounts,
                &adapter.local_range(&report.period),
                &excluded,
            )
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for txn in &raw {
            let record = adapter.normalize(side, txn)?;
            let in_scope = report.period.contains(record.occurred_at)
                && scope
                    .iter()
                    .any(|s| s.account_id == record.account_id && s.admits(record.occurred_at));
            if in_scope && !excluded.contains(&record.transaction_id) {
                records.push(record);
            }
        }

        records.sort_by(|x, y| {
            x.occurred_at
                .cmp(&y.occurred_at)
                .then(x.transaction_id.cmp(&y.transaction_id))
        });
        Ok(records)
    }
}
