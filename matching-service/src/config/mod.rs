//! Configuration module for matching-service.

use crate::engine::ProfileSettings;
use crate::services::EngineSettings;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub profiles: Vec<ProfileSettings>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let lookup = |key: &str| env::var(key).ok();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "matching-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            engine: engine_settings(lookup)?,
            profiles: profile_settings(lookup)?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", key, raw))
        }),
    }
}

/// Engine settings from `MATCH_*` variables.
pub fn engine_settings(lookup: impl Fn(&str) -> Option<String>) -> Result<EngineSettings, AppError> {
    let defaults = EngineSettings::default();

    let commit_batch_size = parse_var::<usize>(&lookup, "MATCH_COMMIT_BATCH_SIZE")?
        .unwrap_or(defaults.commit_batch_size);
    if commit_batch_size == 0 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "MATCH_COMMIT_BATCH_SIZE must be at least 1"
        )));
    }

    let job_cleanup_interval = parse_var::<u64>(&lookup, "MATCH_JOB_CLEANUP_INTERVAL_SECS")?
        .map(Duration::from_secs)
        .unwrap_or(defaults.job_cleanup_interval);
    if job_cleanup_interval.is_zero() {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "MATCH_JOB_CLEANUP_INTERVAL_SECS must be at least 1"
        )));
    }

    Ok(EngineSettings {
        commit_batch_size,
        lock_timeout: parse_var::<u64>(&lookup, "MATCH_LOCK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_timeout),
        retry_max_elapsed: parse_var::<u64>(&lookup, "MATCH_STORAGE_RETRY_MAX_ELAPSED_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry_max_elapsed),
        job_cleanup_interval,
    })
}

/// Built-in profiles with `MATCH_PROFILE_<NAME>_*` overrides applied.
pub fn profile_settings(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<ProfileSettings>, AppError> {
    let mut profiles = ProfileSettings::builtin();

    for profile in &mut profiles {
        let prefix = format!("MATCH_PROFILE_{}", profile.name.to_uppercase());

        if let Some(tolerance) =
            parse_var::<Decimal>(&lookup, &format!("{}_AMOUNT_TOLERANCE", prefix))?
        {
            profile.amount_tolerance = tolerance;
        }
        if let Some(window) = parse_var::<i64>(&lookup, &format!("{}_TIME_WINDOW_SECS", prefix))? {
            profile.time_window_secs = window;
        }
        if let Some(offset) =
            parse_var::<i32>(&lookup, &format!("{}_SIDE_A_UTC_OFFSET_MINUTES", prefix))?
        {
            profile.side_a.utc_offset_minutes = offset;
        }
        if let Some(offset) =
            parse_var::<i32>(&lookup, &format!("{}_SIDE_B_UTC_OFFSET_MINUTES", prefix))?
        {
            profile.side_b.utc_offset_minutes = offset;
        }
    }

    Ok(profiles)
}
