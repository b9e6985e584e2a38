//! Source adapters.
//!
//! Each source stores transactions in its own shape: local wall-clock
//! timestamps in a source-specific zone, and the amount either as a flat
//! column or nested inside a structured payload. An adapter resolves both
//! once, so everything downstream works on [`SourceRecord`]s in UTC.
//!
//! The sign convention is part of a source's declared shape as well: the
//! amount on a normalized record is the value the matcher compares.

use crate::error::MatchError;
use crate::models::{LocalRange, RawTransaction, SourceRecord, Side, TimeRange};
use chrono::{FixedOffset, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Largest UTC offset accepted for a source clock.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

/// Normalizes one source's raw transactions.
pub trait SourceAdapter: Send + Sync + fmt::Debug {
    /// Source name under which the ingestion process stores transactions.
    fn source(&self) -> &str;

    /// Offset of the source's wall-clock from UTC.
    fn utc_offset(&self) -> FixedOffset;

    /// How the recorded sign is treated during normalization.
    fn sign(&self) -> AmountSign;

    fn extract_amount(&self, raw: &RawTransaction) -> Result<Decimal, MatchError>;

    fn normalize(&self, side: Side, raw: &RawTransaction) -> Result<SourceRecord, MatchError> {
        if raw.source != self.source() {
            return Err(MatchError::Validation(format!(
                "transaction {} belongs to source '{}', expected '{}'",
                raw.transaction_id,
                raw.source,
                self.source()
            )));
        }

        let amount = self.sign().apply(self.extract_amount(raw)?);
        let occurred_at = self
            .utc_offset()
            .from_local_datetime(&raw.recorded_at)
            .single()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                MatchError::Validation(format!(
                    "transaction {} has an unresolvable local timestamp {}",
                    raw.transaction_id, raw.recorded_at
                ))
            })?;

        Ok(SourceRecord {
            transaction_id: raw.transaction_id,
            side,
            account_id: raw.account_id.clone(),
            occurred_at,
            amount,
        })
    }

    /// Map a UTC window onto this source's local wall-clock.
    fn local_range(&self, range: &TimeRange) -> LocalRange {
        let offset = self.utc_offset();
        LocalRange {
            start: range.start.with_timezone(&offset).naive_local(),
            end: range.end.with_timezone(&offset).naive_local(),
        }
    }
}

/// Sign convention of a source's amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AmountSign {
    /// Outgoing legs may be recorded as signed debits; only the magnitude
    /// is kept. Direction comes from the profile's role mapping.
    #[default]
    Magnitude,
    /// Amounts are kept exactly as recorded.
    AsRecorded,
}

impl AmountSign {
    pub fn apply(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Magnitude => amount.abs(),
            Self::AsRecorded => amount,
        }
    }
}

/// Where a source keeps the transaction amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountLocation {
    /// The flat `amount` column.
    Column,
    /// A JSON pointer into the payload, e.g. `/operation/amount`.
    Payload { pointer: String },
}

/// Declared shape of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub source: String,
    pub utc_offset_minutes: i32,
    pub amount: AmountLocation,
    pub sign: AmountSign,
}

impl SourceSettings {
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.source.trim().is_empty() {
            return Err(MatchError::Configuration("source name must not be empty".into()));
        }
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(MatchError::Configuration(format!(
                "source '{}' has UTC offset {} minutes, outside ±{}",
                self.source, self.utc_offset_minutes, MAX_UTC_OFFSET_MINUTES
            )));
        }
        if let AmountLocation::Payload { pointer } = &self.amount {
            if !pointer.starts_with('/') {
                return Err(MatchError::Configuration(format!(
                    "source '{}' amount pointer '{}' must start with '/'",
                    self.source, pointer
                )));
            }
        }
        Ok(())
    }

    fn offset(&self) -> Result<FixedOffset, MatchError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            MatchError::Configuration(format!(
                "invalid UTC offset for source '{}'",
                self.source
            ))
        })
    }
}

/// Build the adapter declared by `settings`.
pub fn build_adapter(settings: &SourceSettings) -> Result<Arc<dyn SourceAdapter>, MatchError> {
    settings.validate()?;
    let offset = settings.offset()?;
    let adapter: Arc<dyn SourceAdapter> = match &settings.amount {
        AmountLocation::Column => Arc::new(
            FlatAmountAdapter::new(settings.source.clone(), offset).with_sign(settings.sign),
        ),
        AmountLocation::Payload { pointer } => Arc::new(
            NestedAmountAdapter::new(
                settings.source.clone(),
                offset,
                PayloadSchema {
                    amount_pointer: pointer.clone(),
                },
            )
            .with_sign(settings.sign),
        ),
    };
    Ok(adapter)
}

// ============================================================================
// Flat amount column
// ============================================================================

#[derive(Debug, Clone)]
pub struct FlatAmountAdapter {
    source: String,
    offset: FixedOffset,
    sign: AmountSign,
}

impl FlatAmountAdapter {
    pub fn new(source: impl Into<String>, offset: FixedOffset) -> Self {
        Self {
            source: source.into(),
            offset,
            sign: AmountSign::default(),
        }
    }

    pub fn with_sign(mut self, sign: AmountSign) -> Self {
        self.sign = sign;
        self
    }
}

impl SourceAdapter for FlatAmountAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn utc_offset(&self) -> FixedOffset {
        self.offset
    }

    fn sign(&self) -> AmountSign {
        self.sign
    }

    fn extract_amount(&self, raw: &RawTransaction) -> Result<Decimal, MatchError> {
        raw.amount.ok_or_else(|| {
            MatchError::Validation(format!(
                "transaction {} from '{}' has no amount",
                raw.transaction_id, self.source
            ))
        })
    }
}

// ============================================================================
// Amount nested in a structured payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSchema {
    pub amount_pointer: String,
}

#[derive(Debug, Clone)]
pub struct NestedAmountAdapter {
    source: String,
    offset: FixedOffset,
    schema: PayloadSchema,
    sign: AmountSign,
}

impl NestedAmountAdapter {
    pub fn new(source: impl Into<String>, offset: FixedOffset, schema: PayloadSchema) -> Self {
        Self {
            source: source.into(),
            offset,
            schema,
            sign: AmountSign::default(),
        }
    }

    pub fn with_sign(mut self, sign: AmountSign) -> Self {
        self.sign = sign;
        self
    }
}

impl SourceAdapter for NestedAmountAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn utc_offset(&self) -> FixedOffset {
        self.offset
    }

    fn sign(&self) -> AmountSign {
        self.sign
    }

    fn extract_amount(&self, raw: &RawTransaction) -> Result<Decimal, MatchError> {
        let value = raw.payload.pointer(&self.schema.amount_pointer).ok_or_else(|| {
            MatchError::Validation(format!(
                "transaction {} payload has no amount at '{}'",
                raw.transaction_id, self.schema.amount_pointer
            ))
        })?;

        let parsed = match value {
            serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .ok(),
            _ => None,
        };

        parsed.ok_or_else(|| {
            MatchError::Validation(format!(
                "transaction {} payload amount {} at '{}' is not a decimal",
                raw.transaction_id, value, self.schema.amount_pointer
            ))
        })
    }
}
