use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, API_KEY_HEADER};
use crate::db::{Plot, StoredReading};
use crate::ingest::{self, IngestOutcome, ReadingResponse};
use crate::irrigation::evaluate;
use crate::state::SharedState;
use crate::stats::{self, SummaryReport};

const DEFAULT_READINGS_LIMIT: i64 = 100;
const MAX_READINGS_LIMIT: i64 = 1000;
const DEFAULT_SUMMARY_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Missing => AppError::Unauthorized("missing API key"),
            AuthError::Invalid => AppError::Unauthorized("invalid API key"),
            AuthError::WrongPlot => AppError::Forbidden("API key is not valid for this plot"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(e) => {
                error!("request failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let msg = match &self {
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/readings", get(list_readings).post(create_reading))
        .route("/readings/", get(list_readings).post(create_reading))
        .route("/sensors", get(list_sensors))
        .route("/sensors/", get(list_sensors))
        .route("/stats/summary", get(summary))
        .fallback(not_found)
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Backend running" }))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let activity = state.activity.read().await;
    Json(activity.to_status(state.alerter.enabled()))
}

async fn not_found() -> AppError {
    AppError::NotFound("route".to_string())
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReadingRequest {
    #[serde(alias = "sensor_id")]
    pub plot_id: Uuid,
    pub moisture: i64,
    pub light: i64,
}

async fn create_reading(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<ReadingRequest>, JsonRejection>,
) -> ApiResult<IngestOutcome> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let plot_id = req.plot_id.hyphenated().to_string();

    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = state.api_keys.authorize(presented, &plot_id) {
        warn!(zone = %plot_id, reason = ?e, "rejected reading");
        return Err(e.into());
    }

    match ingest::ingest(&state, &plot_id, req.moisture, req.light).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state
                .activity
                .write()
                .await
                .record_error(format!("{plot_id}: {e:#}"));
            Err(AppError::Internal(e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    limit: Option<i64>,
}

async fn list_readings(
    State(state): State<SharedState>,
    query: Result<Query<ReadingsQuery>, QueryRejection>,
) -> ApiResult<Vec<ReadingResponse>> {
    let Query(q) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);

    let rows = state.db.recent_readings(limit).await?;
    let readings = rows
        .into_iter()
        .map(reading_view)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(readings))
}

fn reading_view(r: StoredReading) -> anyhow::Result<ReadingResponse> {
    let created_at = OffsetDateTime::from_unix_timestamp(r.created_ts)
        .with_context(|| format!("reading {} has a bad timestamp", r.reading_id))?;
    Ok(ReadingResponse {
        evaluation: evaluate(r.moisture, r.ideal_moisture),
        id: r.reading_id,
        plot_id: r.plot_id,
        moisture: r.moisture,
        light: r.light,
        created_at,
    })
}

async fn list_sensors(State(state): State<SharedState>) -> ApiResult<Vec<Plot>> {
    Ok(Json(state.db.load_plots().await?))
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    days: Option<i64>,
}

async fn summary(
    State(state): State<SharedState>,
    query: Result<Query<SummaryQuery>, QueryRejection>,
) -> ApiResult<SummaryReport> {
    let Query(q) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let days = q.days.unwrap_or(DEFAULT_SUMMARY_DAYS);
    let today = OffsetDateTime::now_utc().date();
    Ok(Json(stats::summarize(&state.db, days, today).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("http server error")
}

// ===========================================================================
// Tests
// ===========================================================================
