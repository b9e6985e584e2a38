//! Per-match financial metrics.

use crate::error::MatchError;
use crate::models::{Financials, Side};
use rust_decimal::Decimal;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Which side of a pairing is the expense and which the income.
///
/// The role assignment belongs to the engine profile, not to the calculator:
/// integrations pair their sources in opposite directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMapping {
    SideAExpense,
    SideBExpense,
}

impl RoleMapping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SideAExpense => "a_expense",
            Self::SideBExpense => "b_expense",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "a_expense" => Some(Self::SideAExpense),
            "b_expense" => Some(Self::SideBExpense),
            _ => None,
        }
    }

    pub fn expense_side(&self) -> Side {
        match self {
            Self::SideAExpense => Side::A,
            Self::SideBExpense => Side::B,
        }
    }

    /// Order a pair's amounts as `(expense, income)`.
    pub fn assign(&self, side_a_amount: Decimal, side_b_amount: Decimal) -> (Decimal, Decimal) {
        match self {
            Self::SideAExpense => (side_a_amount, side_b_amount),
            Self::SideBExpense => (side_b_amount, side_a_amount),
        }
    }

    pub fn financials(
        &self,
        side_a_amount: Decimal,
        side_b_amount: Decimal,
    ) -> Result<Financials, MatchError> {
        let (expense, income) = self.assign(side_a_amount, side_b_amount);
        compute_financials(expense, income)
    }
}

/// Compute gross figures for a pair.
///
/// Inputs are taken by absolute value since sources may record the outgoing
/// leg as a signed debit.
pub fn compute_financials(
    expense_amount: Decimal,
    income_amount: Decimal,
) -> Result<Financials, MatchError> {
    let gross_expense = expense_amount.abs();
    let gross_income = income_amount.abs();
    // Both operands are non-negative, so the difference cannot overflow.
    let gross_profit = gross_income - gross_expense;
    let profit_percentage = percentage(gross_profit, gross_expense)?;

    Ok(Financials {
        gross_expense,
        gross_income,
        gross_profit,
        profit_percentage,
    })
}

/// `numerator / denominator * 100`, or zero when the denominator is zero.
pub(crate) fn percentage(numerator: Decimal, denominator: Decimal) -> Result<Decimal, MatchError> {
    if denominator.is_zero() {
        return Ok(Decimal::ZERO);
    }
    numerator
        .checked_div(denominator)
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .ok_or_else(|| {
            MatchError::Computation(format!(
                "percentage of {} over {} overflows",
                numerator, denominator
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn profit_and_percentage() {
        let f = compute_financials(dec("100.00"), dec("112.50")).unwrap();
        assert_eq!(f.gross_expense, dec("100.00"));
        assert_eq!(f.gross_income, dec("112.50"));
        assert_eq!(f.gross_profit, dec("12.50"));
        assert_eq!(f.profit_percentage, dec("12.5"));
    }

    #[test]
    fn signed_debits_are_taken_by_magnitude() {
        let f = compute_financials(dec("-80"), dec("60")).unwrap();
        assert_eq!(f.gross_expense, dec("80"));
        assert_eq!(f.gross_profit, dec("-20"));
        assert_eq!(f.profit_percentage, dec("-25"));
        assert_eq!(f.gross_profit, f.gross_income - f.gross_expense);
    }

    #[test]
    fn zero_expense_yields_zero_percentage() {
        let f = compute_financials(Decimal::ZERO, dec("15")).unwrap();
        assert_eq!(f.gross_profit, dec("15"));
        assert_eq!(f.profit_percentage, Decimal::ZERO);
    }

    #[test]
    fn role_mapping_swaps_expense_and_income() {
        let a_expense = RoleMapping::SideAExpense
            .financials(dec("100"), dec("110"))
            .unwrap();
        let b_expense = RoleMapping::SideBExpense
            .financials(dec("100"), dec("110"))
            .unwrap();

        assert_eq!(a_expense.gross_profit, dec("10"));
        assert_eq!(b_expense.gross_profit, dec("-10"));
        assert_eq!(RoleMapping::SideBExpense.expense_side(), Side::B);
    }

    #[test]
    fn role_mapping_names_round_trip() {
        for roles in [RoleMapping::SideAExpense, RoleMapping::SideBExpense] {
            assert_eq!(RoleMapping::parse(roles.as_str()), Some(roles));
        }
        assert_eq!(RoleMapping::parse("income_first"), None);
    }

    #[test]
    fn overflowing_percentage_is_a_computation_error() {
        let err = percentage(Decimal::MAX, dec("0.0000000001")).unwrap_err();
        assert!(matches!(err, MatchError::Computation(_)));
    }
}
