//! Application startup and lifecycle management.

use crate::config::MatchingConfig;
use crate::engine::ProfileRegistry;
use crate::services::{get_metrics, init_metrics, AutoMatchJobs, Database, MatchingService};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MatchingConfig,
    pub db: Arc<Database>,
    pub matching: MatchingService,
    pub jobs: AutoMatchJobs,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
    profiles: Vec<String>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "matching-service",
                    "version": env!("CARGO_PKG_VERSION"),
                    "profiles": state.profiles
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "matching-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MatchingConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Build engine profiles before touching the database
        let profiles = ProfileRegistry::from_settings(&config.profiles).map_err(|e| {
            tracing::error!(error = %e, "Invalid engine profile configuration");
            AppError::ConfigError(anyhow::anyhow!("{}", e))
        })?;
        tracing::info!(profiles = ?profiles.names(), "Engine profiles loaded");

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let matching = MatchingService::new(db.clone(), profiles, config.engine.clone());
        let jobs = AutoMatchJobs::new(matching.clone());
        jobs.spawn_cleanup(config.engine.job_cleanup_interval);

        // Bind HTTP listener
        let http_addr = config.common.http_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Matching service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                db,
                matching,
                jobs,
            },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// The matching engine for in-process callers.
    pub fn matching(&self) -> &MatchingService {
        &self.state.matching
    }

    pub fn jobs(&self) -> &AutoMatchJobs {
        &self.state.jobs
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
            profiles: self
                .state
                .matching
                .profiles()
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        tracing::info!(
            service = "matching-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        if let Err(e) = axum::serve(self.http_listener, http_router).await {
            tracing::error!(error = %e, "HTTP server error");
            self.state.jobs.shutdown().await;
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }

        Ok(())
    }
}
