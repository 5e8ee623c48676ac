use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::aggregator::DailyRollup;
use crate::db::Store;
use crate::error::AppError;
use crate::export::{CoinLatest, Exporter, Index};
use crate::types::RunAudit;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub exporter: Exporter,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/index", get(get_index))
        .route("/api/coins/:id/latest", get(get_coin_latest))
        .route("/api/coins/:id/daily", get(get_coin_daily))
        .route("/api/runs", get(get_runs))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_index(State(state): State<ApiState>) -> Result<Json<Index>, AppError> {
    let now = Utc::now();
    let coins = state.exporter.collect(now).await?;
    Ok(Json(state.exporter.index(&coins, now)))
}

async fn get_coin_latest(
    State(state): State<ApiState>,
    Path(coin_id): Path<String>,
) -> Result<Json<CoinLatest>, AppError> {
    let view = state
        .exporter
        .coin_view(&coin_id, Utc::now())
        .await?
        .ok_or(AppError::NoData)?;
    Ok(Json(view.latest))
}

async fn get_coin_daily(
    State(state): State<ApiState>,
    Path(coin_id): Path<String>,
) -> Result<Json<Vec<DailyRollup>>, AppError> {
    let daily = state.exporter.coin_daily(&coin_id, Utc::now()).await?;
    if daily.is_empty() {
        return Err(AppError::NoData);
    }
    Ok(Json(daily))
}

async fn get_runs(
    State(state): State<ApiState>,
    Query(params): Query<RunsQuery>,
) -> Result<Json<Vec<RunAudit>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 500);
    Ok(Json(state.store.recent_runs(limit).await?))
}
