use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use chrono::{NaiveDate, NaiveDateTime};
use futures_util::{Stream, StreamExt};
use geoutils::Location;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, ok};
use crate::AppState;
use crate::error::PersistenceError;
use crate::ingest::InboundMessage;
use crate::models::sample::{LocationSample, OwnerRefs, TIMESTAMP_FORMAT, sample_from_value};
use crate::store::{HistoryRow, LastLocationRow};

/// Unqualified history requests refuse beyond this many rows.
const DIRECT_CAP: i64 = 20_000;
/// Paginated and chunked requests cap here.
const CHUNKED_CAP: i64 = 50_000;

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "maxRecords")]
    pub max_records: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LiveLocationParams {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
}

struct TimeRange {
    from: NaiveDateTime,
    to: NaiveDateTime,
}

impl RangeParams {
    fn resolve(&self) -> Result<TimeRange, ApiError> {
        let from = match &self.from {
            Some(s) => parse_time(s)?,
            // Epoch midnight.
            None => NaiveDateTime::default(),
        };
        let to = match &self.to {
            Some(s) => parse_time(s)?,
            None => NaiveDate::from_ymd_opt(9999, 12, 31)
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
                .unwrap_or_default(),
        };
        if from > to {
            return Err(ApiError::bad_request("from is after to"));
        }
        Ok(TimeRange { from, to })
    }
}

/// The device clock is wall time with no zone; accept the wire format and
/// the ISO variant.
fn parse_time(s: &str) -> Result<NaiveDateTime, ApiError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
        .map_err(|_| ApiError::bad_request(format!("unparseable time {s:?}")))
}

pub async fn history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let range = params.resolve()?;
    let limit = params.max_records.unwrap_or(DIRECT_CAP).clamp(1, DIRECT_CAP);

    if params.max_records.is_none() {
        let count = state
            .store
            .count_history(&device_id, range.from, range.to)
            .await?;
        if count > DIRECT_CAP {
            return Err(ApiError::payload_too_large(
                count,
                &format!("/api/vehicle/history/{device_id}/stream"),
            ));
        }
    }

    let records = state
        .store
        .fetch_history(&device_id, range.from, range.to, limit)
        .await?;
    Ok(ok(json!({ "count": records.len(), "records": records })))
}

pub async fn history_stats(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let range = params.resolve()?;
    let stats = state
        .store
        .history_stats(&device_id, range.from, range.to)
        .await?;
    Ok(ok(stats))
}

pub async fn history_paginated(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let range = params.resolve()?;
    let limit = params.max_records.unwrap_or(CHUNKED_CAP).clamp(1, CHUNKED_CAP);
    let records = state
        .store
        .fetch_history(&device_id, range.from, range.to, limit)
        .await?;
    let capped = records.len() as i64 == limit;
    Ok(ok(json!({
        "count": records.len(),
        "capped": capped,
        "records": records,
    })))
}

pub async fn history_stream(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    let range = params.resolve()?;
    let stream = state.store.stream_history(device_id, range.from, range.to);
    Ok(ndjson(stream.map(|item| item.map(row_line))))
}

pub async fn history_chunked(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    let range = params.resolve()?;
    let limit = params.max_records.unwrap_or(CHUNKED_CAP).clamp(1, CHUNKED_CAP) as usize;
    let stream = state
        .store
        .stream_history(device_id, range.from, range.to)
        .take(limit);
    Ok(ndjson(stream.map(|item| item.map(row_line))))
}

/// Straight-line distance over the range, streamed leg by leg.
pub async fn distance_stream(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    let range = params.resolve()?;
    let stream = state.store.stream_history(device_id, range.from, range.to);

    let legs = stream.scan(
        (None::<Location>, 0.0f64),
        |state, item| {
            let (prev, total) = state;
            let out = item.map(|row| {
                let mut leg_m = 0.0;
                if let (Some(lat), Some(lon)) = (row.latitude, row.longitude) {
                    let here = Location::new(lat, lon);
                    if let Some(last) = prev.as_ref() {
                        // Haversine; falls back to 0 on degenerate inputs.
                        leg_m = here.distance_to(last).map(|d| d.meters()).unwrap_or(0.0);
                    }
                    *prev = Some(here);
                }
                *total += leg_m;
                let line = json!({
                    "recorded_at": row.recorded_at,
                    "latitude": row.latitude,
                    "longitude": row.longitude,
                    "leg_m": leg_m,
                    "total_m": *total,
                });
                Bytes::from(format!("{line}\n"))
            });
            std::future::ready(Some(out))
        },
    );
    Ok(ndjson(legs))
}

pub async fn latest_location(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sample) = state.cache.get(&device_id) {
        return Ok(ok(json!({ "source": "cache", "location": sample })));
    }
    match state.store.fetch_last_location(&device_id).await? {
        Some(row) => {
            // Warm the cache for the next lookup.
            state.cache.update(&last_row_to_sample(&row));
            Ok(ok(json!({ "source": "store", "location": row })))
        }
        None => Err(ApiError::not_found(format!(
            "no location recorded for device {device_id}"
        ))),
    }
}

/// Inject a synthetic live report through the normal pipeline: it is
/// enriched, deduplicated, persisted and broadcast like any broker sample.
pub async fn live_location(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<LiveLocationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = json!({
        "deviceID": device_id,
        "timestamp": chrono::Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string(),
        "latitude": params.latitude,
        "longitude": params.longitude,
        "speed": params.speed,
        "status": "N1",
    });
    inject(&state, &device_id, payload).await?;
    Ok(ok(json!({ "queued": true, "device_id": device_id })))
}

pub async fn gps_upsert(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let sample = sample_from_value(&body)?;
    inject(&state, &sample.device_id, body).await?;
    Ok(ok(json!({ "queued": 1 })))
}

pub async fn gps_batch_upsert(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<Vec<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty batch"));
    }
    let mut samples = Vec::with_capacity(body.len());
    for (i, object) in body.iter().enumerate() {
        let sample = sample_from_value(object)
            .map_err(|e| ApiError::bad_request(format!("record {i}: {e}")))?;
        samples.push(sample);
    }
    let queued = samples.len();
    for (sample, object) in samples.into_iter().zip(body) {
        inject(&state, &sample.device_id, object).await?;
    }
    Ok(ok(json!({ "queued": queued })))
}

async fn inject(state: &AppState, device_id: &str, payload: Value) -> Result<(), ApiError> {
    let message = InboundMessage {
        topic: format!("api/gps/{device_id}"),
        payload: payload.to_string(),
    };
    if state.ingest.inject(message).await {
        Ok(())
    } else {
        Err(ApiError::unavailable("ingest pipeline is shutting down"))
    }
}

fn row_line(row: HistoryRow) -> Bytes {
    let mut line = serde_json::to_string(&row).unwrap_or_default();
    line.push('\n');
    Bytes::from(line)
}

fn ndjson<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, PersistenceError>> + Send + 'static,
{
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn last_row_to_sample(row: &LastLocationRow) -> LocationSample {
    LocationSample {
        latitude: row.latitude,
        longitude: row.longitude,
        speed: row.speed,
        course: row.course.clone(),
        ignition: row.ignition,
        vehicle_status: row.vehicle_status.clone(),
        gsm_strength: row.gsm_strength.clone(),
        sequence_no: row.sequence_no.clone(),
        panic: row.panic,
        owners: OwnerRefs {
            dealer_id: row.dealer_id,
            admin_id: row.admin_id,
            client_id: row.client_id,
            user_id: row.user_id,
            superadmin_id: row.superadmin_id,
        },
        ..LocationSample::new(row.device_id.clone(), row.recorded_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_forms_accepted() {
        assert!(parse_time("2025-07-09 08:15:31").is_ok());
        assert!(parse_time("2025-07-09T08:15:31").is_ok());
        assert!(parse_time("2025-07-09").is_ok());
        assert!(parse_time("09/07/2025").is_err());
    }

    #[test]
    fn range_defaults_are_open() {
        let params = RangeParams {
            from: None,
            to: None,
            max_records: None,
        };
        let range = params.resolve().unwrap();
        assert!(range.from < range.to);

        let inverted = RangeParams {
            from: Some("2025-07-10".into()),
            to: Some("2025-07-09".into()),
            max_records: None,
        };
        assert!(inverted.resolve().is_err());
    }
}
