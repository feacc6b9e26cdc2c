//! Health Check API
//!
//! Liveness endpoint for monitoring and the frontend's backend probe.

use super::AppState;
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Service name reported by the health endpoint
pub const SERVICE_NAME: &str = "flow-backend";

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// Timestamp (ISO 8601)
    pub timestamp: String,
}

/// Returns 200 OK while the process is serving requests
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
