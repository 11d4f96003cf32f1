use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;

use super::{ApiError, ok};
use crate::AppState;
use crate::error::BrokerError;

/// Can the broker pool carry `n` devices right now?
pub async fn capacity(
    State(state): State<AppState>,
    Path(n): Path<usize>,
) -> Result<impl IntoResponse, ApiError> {
    match state.pool.can_serve(n) {
        Ok(can_serve) => Ok(ok(json!({
            "requested": n,
            "can_serve": can_serve,
            "pool": state.pool.stats(),
        }))),
        Err(e @ BrokerError::PoolExhausted) => Err(ApiError::unavailable(e.to_string())),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.scheduler.full_snapshot())
}

pub async fn scale_up(
    State(state): State<AppState>,
    Path(target): Path<usize>,
) -> Result<impl IntoResponse, ApiError> {
    let added = state.pool.force_scale(target);
    Ok(ok(json!({
        "target": target,
        "added": added,
        "pool": state.pool.stats(),
    })))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    super::health::report(State(state)).await
}
