//! Matching engine: candidate selection, the greedy matcher, per-match
//! financials and report aggregation.

pub mod aggregator;
pub mod candidates;
pub mod financials;
pub mod matcher;
pub mod profile;

pub use aggregator::summarize;
pub use candidates::{CandidateFinder, CandidateSet};
pub use financials::{compute_financials, RoleMapping};
pub use matcher::{greedy_match, MatchOutcome, MatchParams, Pairing};
pub use profile::{EngineProfile, ProfileRegistry, ProfileSettings};
