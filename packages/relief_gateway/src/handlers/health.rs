use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::app::AppState;
use crate::lifecycle::LifecycleState;
use crate::metrics::{ConnectionMetrics, MemoryStats, MetricsSnapshot};
use crate::ws::protocol::now_rfc3339;

/// Body of `GET /`.
#[derive(Debug, Serialize)]
pub struct ServiceDescriptor {
    pub message: String,
    pub version: String,
    pub endpoints: BTreeMap<String, String>,
    pub websocket: String,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
    /// Seconds since startup
    pub uptime: f64,
    pub memory: MemoryStats,
    pub allowed_origins: Vec<String>,
    pub connections: ConnectionMetrics,
    pub lifecycle: LifecycleState,
    pub origin_rejections: u64,
    pub metrics: MetricsSnapshot,
}

/// Service descriptor - lists the mounted prefixes
pub async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ServiceDescriptor {
        message: "Disaster relief coordination gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: state.routes.endpoints(),
        websocket: "/ws".to_string(),
    })
}

/// Health check endpoint - returns gateway status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    Json(HealthStatus {
        status: "ok".to_string(),
        timestamp: now_rfc3339(),
        uptime: state.metrics.uptime_secs(),
        memory: MemoryStats::sample(),
        allowed_origins: state.policy.allow_list().to_vec(),
        connections: metrics.connections.clone(),
        lifecycle: state.lifecycle.state(),
        origin_rejections: state.policy.rejections(),
        metrics,
    })
}
