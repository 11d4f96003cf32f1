use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::metrics::read_host_stats;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct Probe {
    name: &'static str,
    healthy: bool,
    detail: Value,
}

/// Aggregate probe report. 503 when any probe fails so load balancers can
/// rotate the instance out.
pub async fn report(State(state): State<AppState>) -> Response {
    let cfg = &state.config.health;
    let mut probes = Vec::new();

    let pool = state.pool.stats();
    probes.push(Probe {
        name: "broker-pool",
        healthy: pool.active >= 1 && pool.capacity >= state.config.pool.expected_devices,
        detail: json!({
            "active": pool.active,
            "total": pool.total,
            "capacity": pool.capacity,
            "expected_devices": state.config.pool.expected_devices,
        }),
    });

    let (size, idle) = state.store.pool_stats();
    let total = state.config.database.max_connections;
    let active = size.saturating_sub(idle as u32);
    probes.push(Probe {
        name: "datastore-pool",
        healthy: active < total.saturating_sub(1) && total >= cfg.db_min_conns,
        detail: json!({ "active": active, "open": size, "max": total }),
    });

    let host = read_host_stats();
    probes.push(Probe {
        name: "memory",
        healthy: host
            .mem_used_pct
            .map(|pct| pct <= cfg.mem_threshold_pct as f64)
            .unwrap_or(true),
        detail: json!({ "used_pct": host.mem_used_pct, "threshold_pct": cfg.mem_threshold_pct }),
    });
    probes.push(Probe {
        name: "cpu",
        healthy: host
            .load_per_core
            .map(|load| load * 100.0 <= cfg.cpu_threshold_pct as f64)
            .unwrap_or(true),
        detail: json!({ "load_per_core": host.load_per_core, "threshold_pct": cfg.cpu_threshold_pct }),
    });

    let depth = state.batch.depth();
    let success_rate = state.metrics.save_success_rate();
    probes.push(Probe {
        name: "batch-engine",
        healthy: depth < state.batch.max_queue() && success_rate >= cfg.batch_success_pct as f64,
        detail: json!({
            "queue_depth": depth,
            "queue_max": state.batch.max_queue(),
            "success_rate_pct": success_rate,
        }),
    });

    let cache = state.cache.stats();
    probes.push(Probe {
        name: "cache",
        healthy: cache.hit_rate_pct >= state.config.cache.min_hit_ratio_pct as f64,
        detail: json!(cache),
    });

    let healthy = probes.iter().all(|p| p.healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "success": healthy,
        "error": Value::Null,
        "timestamp": chrono::Utc::now().naive_utc(),
        "data": { "healthy": healthy, "probes": probes },
    }));
    (status, body).into_response()
}
