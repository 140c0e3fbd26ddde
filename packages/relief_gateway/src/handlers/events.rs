//! Handler sets owned by the gateway itself: event publishing for
//! out-of-process services and the live session listing.

use axum::{
    Extension, Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broadcaster::{EventBroadcaster, GatewayEvent};
use crate::error::{GatewayError, Result};
use crate::middleware::DecodedBody;
use crate::registry::{ConnectionRegistry, Session};

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub event: String,
    pub delivered: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub count: usize,
    pub sessions: Vec<Session>,
}

/// Handler set for `/api/events`.
pub fn events_router(broadcaster: EventBroadcaster) -> Router {
    Router::new()
        .route("/", post(publish_event))
        .with_state(broadcaster)
}

/// Handler set for `/api/sessions`.
pub fn sessions_router(registry: Arc<ConnectionRegistry>) -> Router {
    Router::new()
        .route("/", get(list_sessions))
        .with_state(registry)
}

/// POST /api/events - publish one event to every connected session
async fn publish_event(
    State(broadcaster): State<EventBroadcaster>,
    body: Option<Extension<DecodedBody>>,
) -> Result<Json<PublishResponse>> {
    let Some(Extension(DecodedBody(value))) = body else {
        return Err(GatewayError::BadRequest(
            "expected a JSON body with an \"event\" field".into(),
        ));
    };
    let request: PublishRequest = serde_json::from_value(value)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid publish request: {}", e)))?;

    let event = GatewayEvent::from_parts(&request.event, request.data);
    let report = broadcaster.publish(event)?;
    Ok(Json(PublishResponse {
        event: request.event,
        delivered: report.delivered,
        skipped: report.skipped,
    }))
}

/// GET /api/sessions - snapshot of live sessions, oldest first
async fn list_sessions(State(registry): State<Arc<ConnectionRegistry>>) -> Json<SessionList> {
    let sessions = registry.list();
    Json(SessionList {
        count: sessions.len(),
        sessions,
    })
}
