//! Application startup and lifecycle management.

use crate::config::RecurringConfig;
use crate::matching::{AccountTransitionMatcher, Matcher, MissedSweep};
use crate::services::{
    get_metrics, init_metrics, Database, ExperimentGate, HttpNotifier, HttpScheduleInference,
    ReplicaGate,
};
use crate::workers::{EventHandler, SweepCron};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: RecurringConfig,
    pub db: Arc<Database>,
    pub events: Arc<EventHandler>,
    pub sweep: Arc<MissedSweep>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
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
                    "service": "recurring-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "recurring-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Inbound bank connection update. `425` asks the publisher to redeliver.
async fn bank_connection_updated(State(events): State<Arc<EventHandler>>, body: Bytes) -> Response {
    match events.handle_payload(&body, Utc::now()).await {
        Ok(summary) => (StatusCode::ACCEPTED, Json(summary)).into_response(),
        Err(AppError::TooEarly {
            reason,
            retry_after_secs,
        }) => {
            tracing::info!(reason = %reason, "Deferring bank connection update");
            let retry_after = retry_after_secs.unwrap_or(1).to_string();
            (
                StatusCode::TOO_EARLY,
                [(header::RETRY_AFTER, retry_after)],
                Json(json!({ "error": reason })),
            )
                .into_response()
        }
        Err(AppError::BadRequest(e)) => {
            tracing::warn!(error = %e, "Malformed bank connection update");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to handle bank connection update");
            let status = if e.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RecurringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: RecurringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: RecurringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.replica_url.as_deref(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let inference = Arc::new(HttpScheduleInference::new(
            &config.inference_service.url,
            config.inference_service.timeout,
        )?);
        let notifier = Arc::new(HttpNotifier::new(
            &config.notification_service.url,
            config.notification_service.timeout,
        )?);
        let experiment = Arc::new(ExperimentGate::new(
            config.experiment.name.clone(),
            config.experiment.treatment_percent,
            config.experiment.rate_limit_attempts,
            config.experiment.rate_limit_window_seconds,
        ));

        let matcher = Arc::new(Matcher::new(
            db.clone(),
            db.clone(),
            inference,
            db.clone(),
            config.matching.clone(),
        ));
        let transition = Arc::new(AccountTransitionMatcher::new(
            db.clone(),
            db.clone(),
            experiment,
            config.matching.clone(),
        ));
        let events = Arc::new(EventHandler::new(
            matcher,
            transition,
            notifier.clone(),
            db.clone(),
            ReplicaGate::new(config.replica.detection_max_staleness),
        ));
        let sweep = Arc::new(MissedSweep::new(
            db.clone(),
            db.clone(),
            notifier,
            config.matching.clone(),
            config.sweep.clone(),
        ));

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Recurring service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                db,
                events,
                sweep,
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

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let health_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .with_state(health_state);

        let events_router = Router::new()
            .route("/v1/events/bank-connection", post(bank_connection_updated))
            .with_state(self.state.events.clone());

        let http_router = health_router
            .merge(events_router)
            .layer(TraceLayer::new_for_http());

        let cron = SweepCron::new(self.state.sweep.clone(), self.state.config.sweep.interval);
        let shutdown: CancellationToken = cron.shutdown_token();
        let cron_handle = tokio::spawn(cron.start());

        tracing::info!(
            service = "recurring-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router).await;

        shutdown.cancel();
        if let Err(e) = cron_handle.await {
            tracing::warn!(error = %e, "Missed-lifecycle cron task ended abnormally");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
