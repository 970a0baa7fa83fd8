// ABOUTME: Liveness endpoint
// ABOUTME: Reports service name, version and current time

use super::response::ApiResponse;
use axum::response::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub async fn health_check() -> Json<ApiResponse<Value>> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(ApiResponse::success(json!({
        "status": "healthy",
        "timestamp": timestamp,
        "version": env!("CARGO_PKG_VERSION"),
        "service": "boxyard",
    })))
}
