use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::{error::ApiError, response::ApiResponse};
use crate::engine::{AppState, UpdateMode, UpdateOutcome};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/forecast/update", post(update_forecast))
        .route("/forecast/force_update", post(force_update_forecast))
        .route("/forecast/clear", post(clear_forecast))
        .route("/forecast/query", get(query_forecast))
        .route("/forecast/day/:offset", get(get_day))
        .route("/forecast/energy", get(get_energy))
        .route("/sensors", get(get_sensors))
        .route("/dampening", get(get_dampening).put(set_dampening))
        .route("/hard_limit", axum::routing::put(set_hard_limit).delete(remove_hard_limit))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn get_status(State(st): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(st.engine.status().await)
}

fn outcome_response(outcome: UpdateOutcome) -> Response {
    match &outcome {
        UpdateOutcome::Completed(report) if !report.success => {
            let message = format!("{} site(s) failed", report.failed.len());
            ApiResponse::upstream_failure(outcome, message).into_response()
        }
        _ => ApiResponse::success(outcome).into_response(),
    }
}

pub async fn update_forecast(State(st): State<AppState>) -> Result<Response, ApiError> {
    let outcome = st.engine.update_forecast(UpdateMode::Scheduled).await?;
    Ok(outcome_response(outcome))
}

pub async fn force_update_forecast(State(st): State<AppState>) -> Result<Response, ApiError> {
    let outcome = st.engine.update_forecast(UpdateMode::Forced).await?;
    Ok(outcome_response(outcome))
}

pub async fn clear_forecast(State(st): State<AppState>) -> Result<Response, ApiError> {
    let outcome = st.engine.clear_and_refetch().await?;
    Ok(outcome_response(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub site: Option<String>,
    #[serde(default)]
    pub undampened: bool,
}

pub async fn query_forecast(
    State(st): State<AppState>,
    Query(q): Query<ForecastQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = st
        .engine
        .query_forecast_data(q.start, q.end, q.site.as_deref(), q.undampened)
        .await?;
    Ok(ApiResponse::success(records))
}

pub async fn get_day(State(st): State<AppState>, Path(offset): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    if !(-730..=7).contains(&offset) {
        return Err(ApiError::BadRequest(format!("day offset {offset} is out of range")));
    }
    Ok(ApiResponse::success(st.engine.day(offset).await))
}

pub async fn get_energy(State(st): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(st.engine.energy_wh_hours().await)
}

pub async fn get_sensors(State(st): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(st.engine.sensors().await)
}

#[derive(Debug, Deserialize)]
pub struct SiteQuery {
    pub site: Option<String>,
}

pub async fn get_dampening(
    State(st): State<AppState>,
    Query(q): Query<SiteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ApiResponse::success(st.engine.get_dampening(q.site.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
pub struct DampeningRequest {
    /// 24 or 48 comma separated factors
    pub factors: String,
    pub site: Option<String>,
}

pub async fn set_dampening(
    State(st): State<AppState>,
    Json(req): Json<DampeningRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine.set_dampening(&req.factors, req.site.as_deref()).await?;
    Ok(ApiResponse::success(st.engine.get_dampening(req.site.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
pub struct HardLimitRequest {
    /// kW, comma separated per API key
    pub hard_limit: String,
}

pub async fn set_hard_limit(
    State(st): State<AppState>,
    Json(req): Json<HardLimitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine.set_hard_limit(&req.hard_limit).await?;
    Ok(ApiResponse::success(st.engine.options().await.hard_limit.to_string()))
}

pub async fn remove_hard_limit(State(st): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    st.engine.remove_hard_limit().await?;
    Ok(ApiResponse::success(st.engine.options().await.hard_limit.to_string()))
}
