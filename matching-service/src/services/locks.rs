//! Per-report exclusive run tokens.
//!
//! Auto-match, manual match and unmatch for the same report share one token,
//! so at most one of them mutates a report's matches at a time.

use crate::error::MatchError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = Arc<DashMap<i64, Arc<Mutex<()>>>>;

/// Held for the duration of one mutating operation on a report. Dropping it
/// releases the token and forgets the report's slot once nobody waits on it.
#[derive(Debug)]
pub struct ReportGuard {
    guard: Option<OwnedMutexGuard<()>>,
    report_id: i64,
    slots: Slots,
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the slot, so it survives for them.
        self.slots
            .remove_if(&self.report_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportLocks {
    inner: Slots,
}

impl ReportLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, report_id: i64) -> Arc<Mutex<()>> {
        self.inner.entry(report_id).or_default().clone()
    }

    /// Wait up to `timeout` for the report's token.
    pub async fn acquire(&self, report_id: i64, timeout: Duration) -> Result<ReportGuard, MatchError> {
        let slot = self.slot(report_id);
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| MatchError::ReportBusy(report_id))?;

        Ok(ReportGuard {
            guard: Some(guard),
            report_id,
            slots: self.inner.clone(),
        })
    }

    pub fn is_held(&self, report_id: i64) -> bool {
        self.inner
            .get(&report_id)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Reports that currently have a holder or a waiter.
    pub fn tracked_reports(&self) -> usize {
        self.inner.len()
    }
}
