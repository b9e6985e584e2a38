//! Report statistics as a pure function of a report's current matches.

use crate::engine::financials::percentage;
use crate::error::MatchError;
use crate::models::{Match, ReportStats};
use rust_decimal::Decimal;

fn checked_sum<'a>(
    field: &str,
    mut values: impl Iterator<Item = &'a Decimal>,
) -> Result<Decimal, MatchError> {
    values.try_fold(Decimal::ZERO, |acc, v| {
        acc.checked_add(*v)
            .ok_or_else(|| MatchError::Computation(format!("{} total overflows", field)))
    })
}

fn average(total: Decimal, count: Decimal) -> Decimal {
    if count.is_zero() {
        Decimal::ZERO
    } else {
        total / count
    }
}

/// Recompute every aggregate field from scratch.
pub fn summarize(matches: &[Match]) -> Result<ReportStats, MatchError> {
    if matches.is_empty() {
        return Ok(ReportStats::default());
    }

    let total_expense = checked_sum("expense", matches.iter().map(|m| &m.gross_expense))?;
    let total_income = checked_sum("income", matches.iter().map(|m| &m.gross_income))?;
    let total_profit = checked_sum("profit", matches.iter().map(|m| &m.gross_profit))?;

    let total_matches = matches.len() as i64;
    let count = Decimal::from(total_matches);
    let profitable = matches
        .iter()
        .filter(|m| m.gross_profit > Decimal::ZERO)
        .count();

    Ok(ReportStats {
        total_matches,
        total_expense,
        total_income,
        total_profit,
        average_expense: average(total_expense, count),
        average_income: average(total_income, count),
        average_profit: average(total_profit, count),
        success_rate: percentage(Decimal::from(profitable as i64), count)?,
        total_profit_percentage: percentage(total_profit, total_expense)?,
    })
}
