//! Matching Service - two-source transaction matching and report reconciliation.

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use error::MatchError;
