use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::{Datelike, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, ok};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateParams {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Deserialize)]
pub struct FutureParams {
    pub months: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    #[serde(rename = "retentionMonths")]
    pub retention_months: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerParams {
    #[serde(rename = "confirmAll", default)]
    pub confirm_all: bool,
}

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let partitions = state.partitions.list().await?;
    Ok(ok(json!({ "count": partitions.len(), "partitions": partitions })))
}

pub async fn info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.partitions.info(&name).await?))
}

pub async fn health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.partitions.info(&name).await?;
    Ok(ok(json!({
        "name": info.name,
        "health": info.health,
        "size_mb": info.size_mb,
        "thresholds": {
            "warning_mb": state.config.partition.warning_mb,
            "critical_mb": state.config.partition.critical_mb,
            "emergency_mb": state.config.partition.emergency_mb,
        },
    })))
}

pub async fn metrics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.partitions.metrics(&name).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=12).contains(&params.month) {
        return Err(ApiError::bad_request(format!("bad month {}", params.month)));
    }
    if !(2000..=2100).contains(&params.year) {
        return Err(ApiError::bad_request(format!("bad year {}", params.year)));
    }
    let name = state.partitions.create_month(params.year, params.month).await?;
    Ok(ok(json!({ "created": name })))
}

pub async fn create_current(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now().naive_utc();
    match state.partitions.ensure_month(now.year(), now.month()).await? {
        Some(name) => Ok(ok(json!({ "created": name }))),
        None => Ok(ok(json!({ "created": null, "reason": "already covered" }))),
    }
}

pub async fn create_future(
    State(state): State<AppState>,
    Query(params): Query<FutureParams>,
) -> Result<impl IntoResponse, ApiError> {
    let months = params.months.unwrap_or(state.config.partition.future_months);
    let now = Utc::now().naive_utc();
    let (mut year, mut month) = (now.year(), now.month());
    let mut created = Vec::new();
    for _ in 0..=months {
        if let Some(name) = state.partitions.ensure_month(year, month).await? {
            created.push(name);
        }
        (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    }
    Ok(ok(json!({ "created": created })))
}

pub async fn optimize(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.partitions.optimize(&name).await?;
    Ok(ok(json!({ "optimized": name })))
}

pub async fn analyze(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.partitions.analyze(&name).await?;
    Ok(ok(json!({ "analyzed": name })))
}

pub async fn maintenance(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let actions = state.partitions.maintenance().await?;
    Ok(ok(json!({ "actions": actions })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    state.partitions.drop_partition(&name, params.force).await?;
    Ok(ok(json!({ "dropped": name, "forced": params.force })))
}

pub async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .partitions
        .cleanup(params.retention_months, true)
        .await?;
    Ok(ok(report))
}

pub async fn scheduler_config(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.scheduler.config())
}

pub async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.scheduler.status())
}

pub async fn scheduler_trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<TriggerParams>,
) -> Result<impl IntoResponse, ApiError> {
    match state.scheduler.trigger(&name, params.confirm_all).await {
        Some(runs) => {
            let report: Vec<_> = runs
                .into_iter()
                .map(|(duty, run)| json!({ "duty": duty, "run": run }))
                .collect();
            Ok(ok(json!({ "triggered": report })))
        }
        None => Err(ApiError::not_found(format!("unknown duty {name}"))),
    }
}
