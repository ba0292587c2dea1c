//! HTTP trigger endpoint.
//!
//! A single entry point for the external scheduler: an authenticated
//! request runs the full batch and returns the aggregated summary. The
//! server owns no timer; cadence lives entirely with the caller.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET\|POST` | `/cron/process` | Run the batch (bearer shared secret) |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Authentication
//!
//! `/cron/process` requires `Authorization: Bearer <secret>` matching the
//! `CRON_SECRET` environment variable; mismatch is a 401. Errors follow
//! `{ "error": { "code": "...", "message": "..." } }`.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::classify::{self, Classifier};
use crate::config::Config;
use crate::db;
use crate::pipeline::{self, BatchSummary, GoogleSessionFactory, SessionFactory};

/// Shared application state passed to route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    factory: Arc<dyn SessionFactory>,
    classifier: Arc<dyn Classifier>,
    cron_secret: Arc<String>,
}

/// Start the trigger server. Binds to `[server].bind` and serves until
/// the process is terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let cron_secret =
        std::env::var("CRON_SECRET").context("CRON_SECRET environment variable not set")?;

    let pool = db::connect(config).await?;
    let classifier: Arc<dyn Classifier> = Arc::from(classify::create_classifier(&config.classifier)?);
    let factory: Arc<dyn SessionFactory> = Arc::new(GoogleSessionFactory::new(config.clone()));

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        factory,
        classifier,
        cron_secret: Arc::new(cron_secret),
    };

    let app = Router::new()
        .route("/cron/process", get(handle_cron).post(handle_cron))
        .route("/health", get(handle_health))
        .with_state(state);

    let bind_addr = &config.server.bind;
    tracing::info!(bind = %bind_addr, "trigger server listening");
    println!("Trigger server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: "invalid or missing bearer token".to_string(),
    }
}

fn batch_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "batch_failed".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET|POST /cron/process ============

#[derive(Serialize)]
struct CronResponse {
    success: bool,
    #[serde(flatten)]
    summary: BatchSummary,
    timestamp: String,
}

async fn handle_cron(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronResponse>, AppError> {
    let expected = format!("Bearer {}", state.cron_secret);
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented != expected {
        return Err(unauthorized());
    }

    let summary = pipeline::run_all(
        &state.pool,
        &state.config,
        state.factory.as_ref(),
        state.classifier.as_ref(),
    )
    .await
    .map_err(|e| batch_error(format!("{:#}", e)))?;

    Ok(Json(CronResponse {
        success: true,
        summary,
        timestamp: Utc::now().to_rfc3339(),
    }))
}
