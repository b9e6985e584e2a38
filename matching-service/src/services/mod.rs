//! Services module for matching-service.

pub mod database;
pub mod jobs;
pub mod locks;
pub mod matching;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use jobs::{AutoMatchJobs, JobState, JobStatus};
pub use locks::{ReportGuard, ReportLocks};
pub use matching::{
    AutoMatchSummary, EngineSettings, ManualMatch, MatchingService, RunStatus, AUTO_MATCH_ACTOR,
};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use store::{MatchStore, UnmatchWrite};
