//! Background auto-match jobs.

use crate::error::MatchError;
use crate::services::matching::{AutoMatchSummary, MatchingService, RunStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed { summary: AutoMatchSummary },
    Cancelled { committed: u64 },
    Failed { message: String, committed: u64 },
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub report_id: i64,
    pub started_utc: DateTime<Utc>,
    pub finished_utc: Option<DateTime<Utc>>,
    pub state: JobState,
}

struct JobEntry {
    report_id: i64,
    started_utc: DateTime<Utc>,
    finished_utc: Arc<OnceCell<DateTime<Utc>>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
}

impl JobEntry {
    fn status(&self, job_id: Uuid) -> JobStatus {
        JobStatus {
            job_id,
            report_id: self.report_id,
            started_utc: self.started_utc,
            finished_utc: self.finished_utc.get().copied(),
            state: self.state.borrow().clone(),
        }
    }
}

/// Runs auto-match passes on the tokio runtime and tracks their outcome.
#[derive(Clone)]
pub struct AutoMatchJobs {
    service: MatchingService,
    jobs: Arc<DashMap<Uuid, JobEntry>>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl AutoMatchJobs {
    pub fn new(service: MatchingService) -> Self {
        Self {
            service,
            jobs: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Start an auto-match run for a report and return its job id.
    pub fn spawn(&self, report_id: i64) -> Uuid {
        let job_id = Uuid::new_v4();
        let cancel = self.shutdown_token.child_token();
        let (state_tx, _) = watch::channel(JobState::Running);
        let state_tx = Arc::new(state_tx);
        let finished_utc = Arc::new(OnceCell::new());

        self.jobs.insert(
            job_id,
            JobEntry {
                report_id,
                started_utc: Utc::now(),
                finished_utc: finished_utc.clone(),
                cancel: cancel.clone(),
                state: state_tx.clone(),
            },
        );

        tracing::info!(job_id = %job_id, report_id = %report_id, "Auto-match job started");

        let service = self.service.clone();
        self.tracker.spawn(async move {
            let state = match service.run_auto_match_cancellable(report_id, &cancel).await {
                Ok(summary) if summary.status == RunStatus::Cancelled => JobState::Cancelled {
                    committed: summary.new_matches,
                },
                Ok(summary) => JobState::Completed { summary },
                Err(e) => JobState::Failed {
                    message: e.to_string(),
                    committed: e.committed(),
                },
            };

            tracing::info!(job_id = %job_id, report_id = %report_id, state = ?state, "Auto-match job finished");
            let _ = finished_utc.set(Utc::now());
            state_tx.send_replace(state);
        });

        job_id
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobStatus, MatchError> {
        self.jobs
            .get(&job_id)
            .map(|entry| entry.status(job_id))
            .ok_or_else(|| MatchError::NotFound(format!("job {}", job_id)))
    }

    /// Wait until the job leaves the running state.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatus, MatchError> {
        let mut rx = self
            .jobs
            .get(&job_id)
            .map(|entry| entry.state.subscribe())
            .ok_or_else(|| MatchError::NotFound(format!("job {}", job_id)))?;

        // The sender lives in the map entry, so the channel cannot close first.
        let _ = rx.wait_for(|state| !state.is_running()).await;
        self.status(job_id)
    }

    /// Ask a running job to stop after its current commit batch.
    pub fn cancel(&self, job_id: Uuid) -> Result<bool, MatchError> {
        let entry = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| MatchError::NotFound(format!("job {}", job_id)))?;

        if !entry.state.borrow().is_running() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(job_id = %job_id, report_id = %entry.report_id, "Auto-match job cancellation requested");
        Ok(true)
    }

    /// Drop finished jobs from the registry. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        self.clear_finished_before(Utc::now())
    }

    /// Drop jobs that finished at or before `cutoff`.
    pub fn clear_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| match entry.finished_utc.get() {
            Some(finished) => *finished > cutoff,
            None => true,
        });
        before - self.jobs.len()
    }

    /// Every `every`, forget jobs that finished more than `every` ago.
    /// Stops on [`shutdown`](Self::shutdown).
    pub fn spawn_cleanup(&self, every: Duration) {
        let jobs = self.clone();
        let retention = chrono::Duration::from_std(every).unwrap_or(chrono::Duration::MAX);

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = jobs.shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            .checked_sub_signed(retention)
                            .unwrap_or(DateTime::<Utc>::MIN_UTC);
                        let removed = jobs.clear_finished_before(cutoff);
                        if removed > 0 {
                            tracing::debug!(removed = removed, "Cleared finished auto-match jobs");
                        }
                    }
                }
            }
        });
    }

    /// Cancel every running job and wait for all of them to stop.
    pub async fn shutdown(&self) {
        tracing::info!(jobs = self.jobs.len(), "Cancelling auto-match jobs");
        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Auto-match jobs stopped");
    }
}
