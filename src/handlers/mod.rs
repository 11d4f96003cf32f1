pub mod capacity;
pub mod health;
pub mod partitions;
pub mod vehicle;
pub mod ws;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{PartitionError, PersistenceError, ValidationError};

/// Success envelope shared by every admin endpoint.
pub fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({
        "success": true,
        "error": null,
        "timestamp": chrono::Utc::now().naive_utc(),
        "data": data,
    }))
}

/// Failure envelope carrying the HTTP status picked by the error kind.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.1,
            "timestamp": chrono::Utc::now().naive_utc(),
        }));
        (self.0, body).into_response()
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self(StatusCode::SERVICE_UNAVAILABLE, msg.into())
    }

    /// 413 with a pointer at the streaming endpoint, per the oversized-
    /// dataset contract.
    pub fn payload_too_large(count: i64, stream_hint: &str) -> Self {
        Self(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("result set of {count} rows exceeds the limit; use {stream_hint}"),
        )
    }
}

impl From<PartitionError> for ApiError {
    fn from(e: PartitionError) -> Self {
        ApiError(e.status_code(), e.to_string())
    }
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError(StatusCode::BAD_REQUEST, e.to_string())
    }
}
