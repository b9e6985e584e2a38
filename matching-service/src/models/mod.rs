//! Domain models for matching-service.

use crate::error::MatchError;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;

// ============================================================================
// Sides and Time Ranges
// ============================================================================

/// One of the two independently captured transaction sources of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "a" | "A" => Some(Self::A),
            "b" | "B" => Some(Self::B),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Inclusive UTC window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, MatchError> {
        if end < start {
            return Err(MatchError::Validation(format!(
                "time range end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Inclusive window expressed in a source's local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl LocalRange {
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }
}

// ============================================================================
// Report Models
// ============================================================================

/// An account whose transactions are eligible for one side of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountScope {
    pub account_id: String,
    pub side: Side,
    pub effective_start: Option<DateTime<Utc>>,
    pub effective_end: Option<DateTime<Utc>>,
}

impl AccountScope {
    pub fn new(account_id: impl Into<String>, side: Side) -> Self {
        Self {
            account_id: account_id.into(),
            side,
            effective_start: None,
            effective_end: None,
        }
    }

    /// Whether a transaction on this account at `ts` falls inside the
    /// account's effective period.
    pub fn admits(&self, ts: DateTime<Utc>) -> bool {
        self.effective_start.is_none_or(|start| ts >= start)
            && self.effective_end.is_none_or(|end| ts <= end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportStats {
    pub total_matches: i64,
    pub total_expense: Decimal,
    pub total_income: Decimal,
    pub total_profit: Decimal,
    pub average_expense: Decimal,
    pub average_income: Decimal,
    pub average_profit: Decimal,
    pub success_rate: Decimal,
    pub total_profit_percentage: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub report_id: i64,
    /// Name of the engine profile the report is reconciled under.
    pub profile: String,
    pub period: TimeRange,
    pub scope: Vec<AccountScope>,
    pub stats: ReportStats,
    /// Optimistic concurrency counter, bumped on every stats write.
    pub version: i64,
}

impl Report {
    pub fn scope_for(&self, side: Side) -> Vec<&AccountScope> {
        self.scope.iter().filter(|s| s.side == side).collect()
    }
}

// ============================================================================
// Source Transaction Models
// ============================================================================

/// A transaction as stored by the ingestion process, before normalization.
///
/// `recorded_at` is the source's local wall-clock time. Depending on the
/// source, the amount lives in `amount` or inside `payload`.
#[derive(Debug, Clone, FromRow)]
pub struct RawTransaction {
    pub transaction_id: i64,
    pub source: String,
    pub account_id: String,
    pub recorded_at: NaiveDateTime,
    pub amount: Option<Decimal>,
    pub payload: serde_json::Value,
}

/// A transaction normalized to UTC with its amount resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRecord {
    pub transaction_id: i64,
    pub side: Side,
    pub account_id: String,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchOrigin {
    Auto,
    Manual,
}

impl MatchOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Financials {
    pub gross_expense: Decimal,
    pub gross_income: Decimal,
    pub gross_profit: Decimal,
    pub profit_percentage: Decimal,
}

/// A match that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMatch {
    pub report_id: i64,
    pub side_a_id: i64,
    pub side_b_id: i64,
    pub time_difference_secs: i64,
    pub financials: Financials,
    pub origin: MatchOrigin,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub match_id: i64,
    pub report_id: i64,
    pub side_a_id: i64,
    pub side_b_id: i64,
    pub time_difference_secs: i64,
    pub gross_expense: Decimal,
    pub gross_income: Decimal,
    pub gross_profit: Decimal,
    pub profit_percentage: Decimal,
    pub origin: MatchOrigin,
    pub created_by: String,
    pub created_utc: DateTime<Utc>,
}

impl Match {
    pub fn transaction_id(&self, side: Side) -> i64 {
        match side {
            Side::A => self.side_a_id,
            Side::B => self.side_b_id,
        }
    }
}

// ============================================================================
// Paging
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchSort {
    #[default]
    CreatedAsc,
    CreatedDesc,
    ProfitAsc,
    ProfitDesc,
    TimeDifferenceAsc,
}

impl MatchSort {
    pub fn order_by(&self) -> &'static str {
        match self {
            Self::CreatedAsc => "match_id ASC",
            Self::CreatedDesc => "match_id DESC",
            Self::ProfitAsc => "gross_profit ASC, match_id ASC",
            Self::ProfitDesc => "gross_profit DESC, match_id ASC",
            Self::TimeDifferenceAsc => "time_difference_secs ASC, match_id ASC",
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort: MatchSort,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: MatchSort::default(),
        }
    }
}

impl PageRequest {
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.page == 0 {
            return Err(MatchError::Validation("page numbers start at 1".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(MatchError::Validation(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.page_size as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn origin_parse_rejects_unknown_values() {
        assert_eq!(MatchOrigin::parse("auto"), Some(MatchOrigin::Auto));
        assert_eq!(MatchOrigin::parse(MatchOrigin::Manual.as_str()), Some(MatchOrigin::Manual));
        assert_eq!(MatchOrigin::parse("imported"), None);
        assert_eq!(MatchOrigin::parse(""), None);
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn time_range_rejects_inverted_bounds() {
        assert!(TimeRange::new(at(10, 0), at(9, 0)).is_err());
        let range = TimeRange::new(at(9, 0), at(10, 0)).unwrap();
        assert!(range.contains(at(9, 0)));
        assert!(range.contains(at(10, 0)));
        assert!(!range.contains(at(10, 1)));
    }

    #[test]
    fn account_scope_respects_effective_period() {
        let mut scope = AccountScope::new("acc-1", Side::A);
        assert!(scope.admits(at(0, 0)));

        scope.effective_start = Some(at(9, 0));
        scope.effective_end = Some(at(17, 0));
        assert!(!scope.admits(at(8, 59)));
        assert!(scope.admits(at(12, 0)));
        assert!(!scope.admits(at(17, 1)));
    }

    #[test]
    fn page_request_bounds() {
        assert!(PageRequest::default().validate().is_ok());
        let zero = PageRequest {
            page: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let huge = PageRequest {
            page_size: MAX_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(huge.validate().is_err());

        let third = PageRequest {
            page: 3,
            page_size: 20,
            sort: MatchSort::ProfitDesc,
        };
        assert_eq!(third.offset(), 40);
    }

    #[test]
    fn side_parsing() {
        assert_eq!(Side::parse("a"), Some(Side::A));
        assert_eq!(Side::parse("B"), Some(Side::B));
        assert_eq!(Side::parse("c"), None);
        assert_eq!(Side::A.to_string(), "A");
    }
}
