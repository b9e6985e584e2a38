//! Matching operations exposed to callers.
//!
//! Every mutating operation takes the report's run token first, so an
//! auto-match pass, a manual match and an unmatch on the same report never
//! overlap. Report statistics are recomputed from the stored match set after
//! each mutation.

use crate::engine::matcher::time_difference_secs;
use crate::engine::{
    greedy_match, summarize, CandidateFinder, EngineProfile, MatchOutcome, ProfileRegistry,
};
use crate::error::MatchError;
use crate::models::{
    Financials, Match, MatchOrigin, NewMatch, Page, PageRequest, Report, ReportStats, Side,
    SourceRecord,
};
use crate::services::locks::ReportLocks;
use crate::services::metrics::{
    record_auto_match_run, record_error, record_match_deleted, record_matches_created,
};
use crate::services::store::{MatchStore, UnmatchWrite};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Actor recorded on matches created by the automatic pass.
pub const AUTO_MATCH_ACTOR: &str = "auto-matcher";

const STATS_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Matches persisted per storage call during an auto-match run.
    pub commit_batch_size: usize,
    /// How long an operation waits for the report's run token.
    pub lock_timeout: Duration,
    /// Upper bound on retrying transient storage failures.
    pub retry_max_elapsed: Duration,
    /// How often finished background jobs are swept from the registry.
    pub job_cleanup_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            commit_batch_size: 200,
            lock_timeout: Duration::from_secs(30),
            retry_max_elapsed: Duration::from_secs(30),
            job_cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of one auto-match run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoMatchSummary {
    pub report_id: i64,
    pub new_matches: u64,
    pub total_matches: i64,
    pub total_profit: Decimal,
    pub average_profit: Decimal,
    pub success_rate: Decimal,
    pub unmatched_a: usize,
    pub unmatched_b: usize,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualMatch {
    pub match_id: i64,
    pub time_difference_secs: i64,
    pub financials: Financials,
    pub stats: ReportStats,
}

/// Matching engine bound to a store and a set of engine profiles.
#[derive(Clone)]
pub struct MatchingService {
    store: Arc<dyn MatchStore>,
    profiles: Arc<ProfileRegistry>,
    locks: ReportLocks,
    settings: EngineSettings,
}

impl MatchingService {
    pub fn new(
        store: Arc<dyn MatchStore>,
        profiles: ProfileRegistry,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            profiles: Arc::new(profiles),
            locks: ReportLocks::new(),
            settings,
        }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn locks(&self) -> &ReportLocks {
        &self.locks
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Auto Match
    // =========================================================================

    /// Match all currently unmatched candidates of a report.
    pub async fn run_auto_match(&self, report_id: i64) -> Result<AutoMatchSummary, MatchError> {
        self.run_auto_match_cancellable(report_id, &CancellationToken::new())
            .await
    }

    /// Same as [`run_auto_match`](Self::run_auto_match), stopping between
    /// commit batches once `cancel` fires. Batches already committed stay.
    #[instrument(skip(self, cancel), fields(report_id = %report_id))]
    pub async fn run_auto_match_cancellable(
        &self,
        report_id: i64,
        cancel: &CancellationToken,
    ) -> Result<AutoMatchSummary, MatchError> {
        let started = Instant::now();
        let result = observe(self.auto_match(report_id, cancel).await);

        let status = match &result {
            Ok(summary) => summary.status.as_str(),
            Err(_) => "failed",
        };
        record_auto_match_run(status, started.elapsed().as_secs_f64());

        if let Ok(summary) = &result {
            info!(
                report_id = %report_id,
                new_matches = summary.new_matches,
                total_matches = summary.total_matches,
                unmatched_a = summary.unmatched_a,
                unmatched_b = summary.unmatched_b,
                status = status,
                duration_ms = started.elapsed().as_millis() as u64,
                "Auto-match finished"
            );
        }
        result
    }

    async fn auto_match(
        &self,
        report_id: i64,
        cancel: &CancellationToken,
    ) -> Result<AutoMatchSummary, MatchError> {
        let report = self.load_report(report_id).await?;
        let profile = self.profiles.get(&report.profile)?;
        CandidateFinder::check_scope(&report)?;

        let _guard = self
            .locks
            .acquire(report_id, self.settings.lock_timeout)
            .await?;

        let finder = CandidateFinder::new(self.store.as_ref(), profile);
        let finder = &finder;
        let report_ref = &report;
        let candidates = self
            .with_retry("find_candidates", move || async move {
                finder.find(report_ref).await
            })
            .await?;

        let outcome = greedy_match(candidates.side_a, candidates.side_b, &profile.params)?;
        let unmatched_a = outcome.unmatched_a.len();
        let unmatched_b = outcome.unmatched_b.len();

        let new_matches: Vec<NewMatch> = outcome
            .pairs
            .iter()
            .map(|p| p.to_new_match(report_id, MatchOrigin::Auto, AUTO_MATCH_ACTOR))
            .collect();

        let (committed, status, failure) = self.commit_in_batches(&new_matches, cancel).await;
        if committed > 0 {
            record_matches_created(MatchOrigin::Auto.as_str(), committed);
        }

        let stats = self.recompute_locked(report_id).await;

        if let Some(err) = failure {
            if let Err(stats_err) = &stats {
                warn!(report_id = %report_id, error = %stats_err, "Stats recompute failed after interrupted run");
            }
            return Err(interrupted(committed, err));
        }
        let stats = stats.map_err(|e| interrupted(committed, e))?;

        Ok(AutoMatchSummary {
            report_id,
            new_matches: committed,
            total_matches: stats.total_matches,
            total_profit: stats.total_profit,
            average_profit: stats.average_profit,
            success_rate: stats.success_rate,
            unmatched_a,
            unmatched_b,
            status,
        })
    }

    /// Persist matches chunk by chunk, checking for cancellation in between.
    async fn commit_in_batches(
        &self,
        new_matches: &[NewMatch],
        cancel: &CancellationToken,
    ) -> (u64, RunStatus, Option<MatchError>) {
        let mut committed = 0;

        for chunk in new_matches.chunks(self.settings.commit_batch_size.max(1)) {
            if cancel.is_cancelled() {
                info!(committed = committed, "Auto-match cancelled between batches");
                return (committed, RunStatus::Cancelled, None);
            }

            let store = self.store.as_ref();
            let inserted = self
                .with_retry("bulk_insert_matches", move || async move {
                    store
                        .bulk_insert_matches(chunk)
                        .await
                        .map_err(MatchError::from)
                })
                .await;

            match inserted {
                Ok(count) => committed += count,
                Err(e) => return (committed, RunStatus::Completed, Some(e)),
            }
        }

        (committed, RunStatus::Completed, None)
    }

    /// Dry run: candidate selection and matching without persisting anything.
    #[instrument(skip(self), fields(report_id = %report_id))]
    pub async fn preview_auto_match(&self, report_id: i64) -> Result<MatchOutcome, MatchError> {
        observe(
            async {
                let report = self.load_report(report_id).await?;
                let profile = self.profiles.get(&report.profile)?;
                let candidates = CandidateFinder::new(self.store.as_ref(), profile)
                    .find(&report)
                    .await?;
                greedy_match(candidates.side_a, candidates.side_b, &profile.params)
            }
            .await,
        )
    }

    // =========================================================================
    // Manual Match
    // =========================================================================

    /// Record a human-directed pairing. Tolerance and time window are not
    /// enforced; the time difference is still stored.
    #[instrument(skip(self), fields(report_id = %report_id, side_a_id = %side_a_id, side_b_id = %side_b_id))]
    pub async fn create_manual_match(
        &self,
        report_id: i64,
        side_a_id: i64,
        side_b_id: i64,
        actor: &str,
    ) -> Result<ManualMatch, MatchError> {
        observe(
            self.manual_match(report_id, side_a_id, side_b_id, actor)
                .await,
        )
    }

    async fn manual_match(
        &self,
        report_id: i64,
        side_a_id: i64,
        side_b_id: i64,
        actor: &str,
    ) -> Result<ManualMatch, MatchError> {
        if actor.trim().is_empty() {
            return Err(MatchError::Validation(
                "manual match requires an actor".to_string(),
            ));
        }

        let report = self.load_report(report_id).await?;
        let profile = self.profiles.get(&report.profile)?;

        let _guard = self
            .locks
            .acquire(report_id, self.settings.lock_timeout)
            .await?;

        let a = self.load_record(profile, Side::A, side_a_id).await?;
        let b = self.load_record(profile, Side::B, side_b_id).await?;

        if let Some(conflict) = self.find_conflict(report_id, side_a_id, side_b_id).await? {
            return Err(conflict);
        }

        let financials = profile.params.roles.financials(a.amount, b.amount)?;
        let time_difference_secs = time_difference_secs(a.occurred_at, b.occurred_at);
        let new_match = NewMatch {
            report_id,
            side_a_id,
            side_b_id,
            time_difference_secs,
            financials,
            origin: MatchOrigin::Manual,
            created_by: actor.to_string(),
        };

        let stored = match self.store.insert_match(&new_match).await? {
            Some(stored) => stored,
            None => {
                // Lost a race with a writer outside this process.
                return Err(self
                    .find_conflict(report_id, side_a_id, side_b_id)
                    .await?
                    .unwrap_or_else(|| MatchError::Conflict {
                        report_id,
                        side: Side::A,
                        transaction_id: side_a_id,
                        existing_match_id: None,
                    }));
            }
        };
        record_matches_created(MatchOrigin::Manual.as_str(), 1);

        let stats = match self.recompute_locked(report_id).await {
            Ok(stats) => stats,
            Err(e) => {
                self.compensate(&stored).await;
                return Err(e);
            }
        };

        info!(
            report_id = %report_id,
            match_id = stored.match_id,
            actor = %actor,
            time_difference_secs = time_difference_secs,
            "Manual match created"
        );

        Ok(ManualMatch {
            match_id: stored.match_id,
            time_difference_secs,
            financials,
            stats,
        })
    }

    async fn find_conflict(
        &self,
        report_id: i64,
        side_a_id: i64,
        side_b_id: i64,
    ) -> Result<Option<MatchError>, MatchError> {
        for (side, transaction_id) in [(Side::A, side_a_id), (Side::B, side_b_id)] {
            if let Some(existing) = self
                .store
                .find_match_by_transaction(report_id, side, transaction_id)
                .await?
            {
                return Ok(Some(MatchError::Conflict {
                    report_id,
                    side,
                    transaction_id,
                    existing_match_id: Some(existing.match_id),
                }));
            }
        }
        Ok(None)
    }

    /// Undo a manual insert whose stats update failed.
    async fn compensate(&self, stored: &Match) {
        match self.store.delete_match(stored.match_id, stored.report_id).await {
            Ok(_) => warn!(match_id = stored.match_id, "Rolled back manual match"),
            Err(e) => warn!(
                match_id = stored.match_id,
                error = %e,
                "Failed to roll back manual match; recompute the report"
            ),
        }
    }

    // =========================================================================
    // Unmatch
    // =========================================================================

    /// Delete a match and store the owning report's recomputed statistics in
    /// the same write. On any failure the match stays in place.
    #[instrument(skip(self), fields(match_id = %match_id, report_id = %report_id))]
    pub async fn delete_match(&self, match_id: i64, report_id: i64) -> Result<ReportStats, MatchError> {
        observe(
            async {
                self.load_report(report_id).await?;

                let _guard = self
                    .locks
                    .acquire(report_id, self.settings.lock_timeout)
                    .await?;

                let stats = self.unmatch_locked(match_id, report_id).await?;
                record_match_deleted();
                info!(match_id = %match_id, report_id = %report_id, "Match deleted");
                Ok(stats)
            }
            .await,
        )
    }

    /// Caller must hold the report's run token.
    async fn unmatch_locked(&self, match_id: i64, report_id: i64) -> Result<ReportStats, MatchError> {
        let store = self.store.as_ref();
        let not_found = || MatchError::NotFound(format!("match {} in report {}", match_id, report_id));

        for attempt in 1..=STATS_WRITE_ATTEMPTS {
            let report = self.load_report(report_id).await?;
            let mut matches = self
                .with_retry("all_matches", move || async move {
                    store.all_matches(report_id).await.map_err(MatchError::from)
                })
                .await?;

            let before = matches.len();
            matches.retain(|m| m.match_id != match_id);
            if matches.len() == before {
                return Err(not_found());
            }
            let stats = summarize(&matches)?;

            let stats_ref = &stats;
            let version = report.version;
            let write = self
                .with_retry("delete_match_with_stats", move || async move {
                    store
                        .delete_match_with_stats(match_id, report_id, stats_ref, version)
                        .await
                        .map_err(MatchError::from)
                })
                .await?;

            match write {
                UnmatchWrite::Deleted => return Ok(stats),
                UnmatchWrite::MatchMissing => return Err(not_found()),
                UnmatchWrite::VersionMoved => warn!(
                    report_id = %report_id,
                    attempt = attempt,
                    "Report version moved during unmatch, retrying"
                ),
            }
        }

        Err(MatchError::ReportBusy(report_id))
    }

    // =========================================================================
    // Queries and Recompute
    // =========================================================================

    #[instrument(skip(self, page), fields(report_id = %report_id, page = page.page))]
    pub async fn list_matches(
        &self,
        report_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Match>, MatchError> {
        observe(
            async {
                page.validate()?;
                self.load_report(report_id).await?;
                self.store
                    .fetch_matches(report_id, page)
                    .await
                    .map_err(MatchError::from)
            }
            .await,
        )
    }

    /// Recompute and store a report's statistics from its current matches.
    #[instrument(skip(self), fields(report_id = %report_id))]
    pub async fn recompute_report(&self, report_id: i64) -> Result<ReportStats, MatchError> {
        observe(
            async {
                self.load_report(report_id).await?;
                let _guard = self
                    .locks
                    .acquire(report_id, self.settings.lock_timeout)
                    .await?;
                self.recompute_locked(report_id).await
            }
            .await,
        )
    }

    /// Caller must hold the report's run token.
    async fn recompute_locked(&self, report_id: i64) -> Result<ReportStats, MatchError> {
        let store = self.store.as_ref();

        for attempt in 1..=STATS_WRITE_ATTEMPTS {
            let report = self.load_report(report_id).await?;
            let matches = self
                .with_retry("all_matches", move || async move {
                    store.all_matches(report_id).await.map_err(MatchError::from)
                })
                .await?;
            let stats = summarize(&matches)?;

            let stats_ref = &stats;
            let version = report.version;
            let written = self
                .with_retry("update_report_stats", move || async move {
                    store
                        .update_report_stats(report_id, stats_ref, version)
                        .await
                        .map_err(MatchError::from)
                })
                .await?;
            if written {
                return Ok(stats);
            }

            warn!(
                report_id = %report_id,
                attempt = attempt,
                "Report version moved during recompute, retrying"
            );
        }

        Err(MatchError::ReportBusy(report_id))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load_report(&self, report_id: i64) -> Result<Report, MatchError> {
        let store = self.store.as_ref();
        self.with_retry("get_report", move || async move {
            store.get_report(report_id).await.map_err(MatchError::from)
        })
        .await?
        .ok_or_else(|| MatchError::NotFound(format!("report {}", report_id)))
    }

    async fn load_record(
        &self,
        profile: &EngineProfile,
        side: Side,
        transaction_id: i64,
    ) -> Result<SourceRecord, MatchError> {
        let adapter = profile.adapter(side);
        let raw = self
            .store
            .get_transaction(adapter.source(), transaction_id)
            .await?
            .ok_or_else(|| {
                MatchError::NotFound(format!("side {} transaction {}", side, transaction_id))
            })?;
        adapter.normalize(side, &raw)
    }

    /// Retry transient storage failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, MatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatchError>>,
    {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.settings.retry_max_elapsed),
            ..Default::default()
        };

        retry(policy, || {
            let attempt = call();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        warn!(operation = operation, error = %e, "Transient storage failure");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

fn interrupted(committed: u64, err: MatchError) -> MatchError {
    if committed == 0 {
        err
    } else {
        MatchError::Interrupted {
            committed,
            source: Box::new(err),
        }
    }
}

fn observe<T>(result: Result<T, MatchError>) -> Result<T, MatchError> {
    if let Err(e) = &result {
        record_error(e.kind());
        warn!(kind = e.kind(), error = %e, "Matching operation failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_wraps_only_after_commits() {
        let busy = interrupted(0, MatchError::ReportBusy(1));
        assert!(matches!(busy, MatchError::ReportBusy(1)));

        let partial = interrupted(3, MatchError::ReportBusy(1));
        assert_eq!(partial.committed(), 3);
        assert_eq!(partial.kind(), "interrupted");
    }

    #[test]
    fn default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.commit_batch_size, 200);
        assert_eq!(settings.lock_timeout, Duration::from_secs(30));
        assert_eq!(settings.job_cleanup_interval, Duration::from_secs(300));
    }
}
