//! Common test utilities for matching-service integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use matching_service::engine::{ProfileRegistry, ProfileSettings};
use matching_service::models::{
    AccountScope, LocalRange, Match, NewMatch, Page, PageRequest, RawTransaction, Report,
    ReportStats, Side, TimeRange,
};
use matching_service::services::{
    EngineSettings, InMemoryStore, MatchStore, MatchingService, UnmatchWrite,
};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub const REPORT_ID: i64 = 5;
pub const ACCOUNT_A: &str = "cab-a-1";
pub const ACCOUNT_B: &str = "cab-b-1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,matching_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        commit_batch_size: 200,
        lock_timeout: Duration::from_millis(500),
        retry_max_elapsed: Duration::from_secs(5),
        job_cleanup_interval: Duration::from_secs(300),
    }
}

/// Parse a decimal literal.
pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Wall-clock time on the test day (2024-03-01).
pub fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn utc(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&at(hour, minute))
}

/// The whole test day in UTC.
pub fn test_period() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap(),
    )
    .unwrap()
}

pub fn report(report_id: i64, profile: &str) -> Report {
    Report {
        report_id,
        profile: profile.to_string(),
        period: test_period(),
        scope: vec![
            AccountScope::new(ACCOUNT_A, Side::A),
            AccountScope::new(ACCOUNT_B, Side::B),
        ],
        stats: ReportStats::default(),
        version: 0,
    }
}

/// Transaction with a flat amount column.
pub fn flat_txn(
    id: i64,
    source: &str,
    account: &str,
    recorded_at: NaiveDateTime,
    amount: &str,
) -> RawTransaction {
    RawTransaction {
        transaction_id: id,
        source: source.to_string(),
        account_id: account.to_string(),
        recorded_at,
        amount: Some(dec(amount)),
        payload: json!({}),
    }
}

/// Ledger transaction carrying its amount inside the payload.
pub fn ledger_txn(
    id: i64,
    account: &str,
    recorded_at: NaiveDateTime,
    amount: serde_json::Value,
) -> RawTransaction {
    RawTransaction {
        transaction_id: id,
        source: "ledger".to_string(),
        account_id: account.to_string(),
        recorded_at,
        amount: None,
        payload: json!({ "operation": { "type": "transfer", "amount": amount } }),
    }
}

pub fn side_a(id: i64, recorded_at: NaiveDateTime, amount: &str) -> RawTransaction {
    flat_txn(id, "side_a", ACCOUNT_A, recorded_at, amount)
}

pub fn side_b(id: i64, recorded_at: NaiveDateTime, amount: &str) -> RawTransaction {
    flat_txn(id, "side_b", ACCOUNT_B, recorded_at, amount)
}

/// Test application wrapper over an in-memory store.
pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub service: MatchingService,
}

impl TestApp {
    pub async fn add_report(&self, report: Report) {
        self.store.put_report(report).await;
    }

    pub async fn add_transactions(&self, transactions: Vec<RawTransaction>) {
        for t in transactions {
            self.store.put_transaction(t).await;
        }
    }

    pub async fn matches(&self, report_id: i64) -> Vec<Match> {
        self.store.all_matches(report_id).await.unwrap()
    }

    pub async fn stored_report(&self, report_id: i64) -> Report {
        self.store.get_report(report_id).await.unwrap().unwrap()
    }
}

pub fn builtin_profiles() -> ProfileRegistry {
    ProfileRegistry::from_settings(&ProfileSettings::builtin()).unwrap()
}

/// Spawn a test application with the built-in profiles.
pub fn spawn_app() -> TestApp {
    spawn_app_with(builtin_profiles(), test_settings())
}

pub fn spawn_app_with(profiles: ProfileRegistry, settings: EngineSettings) -> TestApp {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let service = MatchingService::new(store.clone(), profiles, settings);
    TestApp { store, service }
}

/// Store wrapper that injects failures into chosen operations.
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    /// Successful bulk inserts allowed before every later one fails.
    pub bulk_inserts_before_failure: Option<usize>,
    /// Remaining transient failures before bulk inserts succeed again.
    pub transient_failures: AtomicUsize,
    /// Make every stats write look like a concurrent version bump.
    pub stale_version: AtomicBool,
    bulk_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            bulk_inserts_before_failure: None,
            transient_failures: AtomicUsize::new(0),
            stale_version: AtomicBool::new(false),
            bulk_calls: AtomicUsize::new(0),
        }
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchStore for FlakyStore {
    async fn get_report(&self, report_id: i64) -> Result<Option<Report>, AppError> {
        self.inner.get_report(report_id).await
    }

    async fn update_report_stats(
        &self,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        if self.stale_version.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner
            .update_report_stats(report_id, stats, expected_version)
            .await
    }

    async fn get_transaction(
        &self,
        source: &str,
        transaction_id: i64,
    ) -> Result<Option<RawTransaction>, AppError> {
        self.inner.get_transaction(source, transaction_id).await
    }

    async fn fetch_unmatched(
        &self,
        source: &str,
        accounts: &[String],
        range: &LocalRange,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<RawTransaction>, AppError> {
        self.inner
            .fetch_unmatched(source, accounts, range, exclude)
            .await
    }

    async fn matched_transaction_ids(
        &self,
        report_id: i64,
        side: Side,
    ) -> Result<HashSet<i64>, AppError> {
        self.inner.matched_transaction_ids(report_id, side).await
    }

    async fn find_match_by_transaction(
        &self,
        report_id: i64,
        side: Side,
        transaction_id: i64,
    ) -> Result<Option<Match>, AppError> {
        self.inner
            .find_match_by_transaction(report_id, side, transaction_id)
            .await
    }

    async fn bulk_insert_matches(&self, matches: &[NewMatch]) -> Result<u64, AppError> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::ServiceUnavailable);
        }

        if let Some(limit) = self.bulk_inserts_before_failure {
            if call >= limit {
                return Err(AppError::InternalError(anyhow::anyhow!("disk full")));
            }
        }

        self.inner.bulk_insert_matches(matches).await
    }

    async fn insert_match(&self, new_match: &NewMatch) -> Result<Option<Match>, AppError> {
        self.inner.insert_match(new_match).await
    }

    async fn fetch_matches(
        &self,
        report_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Match>, AppError> {
        self.inner.fetch_matches(report_id, page).await
    }

    async fn all_matches(&self, report_id: i64) -> Result<Vec<Match>, AppError> {
        self.inner.all_matches(report_id).await
    }

    async fn delete_match(&self, match_id: i64, report_id: i64) -> Result<bool, AppError> {
        self.inner.delete_match(match_id, report_id).await
    }

    async fn delete_match_with_stats(
        &self,
        match_id: i64,
        report_id: i64,
        stats: &ReportStats,
        expected_version: i64,
    ) -> Result<UnmatchWrite, AppError> {
        if self.stale_version.load(Ordering::SeqCst) {
            return Ok(UnmatchWrite::VersionMoved);
        }
        self.inner
            .delete_match_with_stats(match_id, report_id, stats, expected_version)
            .await
    }
}
