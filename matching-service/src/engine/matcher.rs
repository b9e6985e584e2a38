//! Greedy one-to-one matcher.
//!
//! Side A is walked in timestamp order. Each side A record takes the unused
//! side B record within the amount tolerance with the smallest time
//! difference, provided that difference fits the time window. Ties go to the
//! lowest side B transaction id, so a run is reproducible for a given input.
//!
//! The pass is O(|A|·|B|). That is fine for the low thousands of candidates a
//! report window holds; an amount-bucketed index over side B is the natural
//! next step if volumes grow.

use crate::engine::financials::RoleMapping;
use crate::error::MatchError;
use crate::models::{Financials, MatchOrigin, NewMatch, SourceRecord};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchParams {
    pub amount_tolerance: Decimal,
    pub time_window: Duration,
    pub roles: RoleMapping,
}

impl MatchParams {
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.amount_tolerance <= Decimal::ZERO {
            return Err(MatchError::Validation(format!(
                "amount tolerance must be positive, got {}",
                self.amount_tolerance
            )));
        }
        if self.time_window <= Duration::zero() {
            return Err(MatchError::Validation(format!(
                "time window must be positive, got {}s",
                self.time_window.num_seconds()
            )));
        }
        Ok(())
    }
}

/// A proposed pairing with its computed metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pairing {
    pub side_a: SourceRecord,
    pub side_b: SourceRecord,
    pub time_difference_secs: i64,
    pub financials: Financials,
}

impl Pairing {
    pub fn to_new_match(&self, report_id: i64, origin: MatchOrigin, created_by: &str) -> NewMatch {
        NewMatch {
            report_id,
            side_a_id: self.side_a.transaction_id,
            side_b_id: self.side_b.transaction_id,
            time_difference_secs: self.time_difference_secs,
            financials: self.financials,
            origin,
            created_by: created_by.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    pub pairs: Vec<Pairing>,
    pub unmatched_a: Vec<SourceRecord>,
    pub unmatched_b: Vec<SourceRecord>,
}

/// Absolute gap between two timestamps, in milliseconds.
fn gap_millis(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (a - b).num_milliseconds().abs()
}

/// Absolute time difference recorded on a match, in whole seconds.
pub fn time_difference_secs(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    gap_millis(a, b) / 1000
}

/// Absolute amount gap between two normalized records.
pub fn amount_gap(a: &SourceRecord, b: &SourceRecord) -> Decimal {
    (a.amount - b.amount).abs()
}

pub fn greedy_match(
    mut side_a: Vec<SourceRecord>,
    side_b: Vec<SourceRecord>,
    params: &MatchParams,
) -> Result<MatchOutcome, MatchError> {
    params.validate()?;

    side_a.sort_by(|x, y| {
        x.occurred_at
            .cmp(&y.occurred_at)
            .then(x.transaction_id.cmp(&y.transaction_id))
    });

    let window_millis = params.time_window.num_milliseconds();
    let mut used_b = vec![false; side_b.len()];
    let mut pairs = Vec::new();
    let mut unmatched_a = Vec::new();

    for a in side_a {
        // (index into side_b, gap in millis)
        let mut best: Option<(usize, i64)> = None;

        for (idx, b) in side_b.iter().enumerate() {
            if used_b[idx] || amount_gap(&a, b) > params.amount_tolerance {
                continue;
            }

            let gap = gap_millis(a.occurred_at, b.occurred_at);
            if gap > window_millis {
                continue;
            }

            let better = match best {
                None => true,
                Some((best_idx, best_gap)) => {
                    gap < best_gap
                        || (gap == best_gap
                            && b.transaction_id < side_b[best_idx].transaction_id)
                }
            };
            if better {
                best = Some((idx, gap));
            }
        }

        match best {
            Some((idx, _)) => {
                used_b[idx] = true;
                let b = side_b[idx].clone();
                let financials = params.roles.financials(a.amount, b.amount)?;
                pairs.push(Pairing {
                    time_difference_secs: time_difference_secs(a.occurred_at, b.occurred_at),
                    side_a: a,
                    side_b: b,
                    financials,
                });
            }
            None => unmatched_a.push(a),
        }
    }

    let unmatched_b = side_b
        .into_iter()
        .zip(used_b)
        .filter_map(|(b, used)| (!used).then_some(b))
        .collect();

    Ok(MatchOutcome {
        pairs,
        unmatched_a,
        unmatched_b,
    })
}
