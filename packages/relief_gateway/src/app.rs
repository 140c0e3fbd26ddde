//! Shared application state and router assembly.

use axum::{
    Router,
    extract::Request,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, TraceLayer};
use tracing::Level;

use crate::broadcaster::EventBroadcaster;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::handlers;
use crate::lifecycle::LifecycleController;
use crate::metrics::GatewayMetrics;
use crate::middleware::{self, RequestMakeSpan};
use crate::origin::{self, OriginPolicy};
use crate::registry::ConnectionRegistry;
use crate::router::{self, RouteTable};
use crate::ws;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub policy: Arc<OriginPolicy>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: EventBroadcaster,
    pub metrics: Arc<GatewayMetrics>,
    pub lifecycle: Arc<LifecycleController>,
    pub routes: Arc<RouteTable>,
}

impl AppState {
    /// Wire up the gateway core with an empty route table.
    pub fn new(config: GatewayConfig) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let policy = Arc::new(OriginPolicy::new(config.allowed_origins.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            policy.clone(),
            metrics.clone(),
            config.websocket.send_channel_capacity,
        ));
        let broadcaster = EventBroadcaster::new(registry.clone(), metrics.clone());
        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            config.grace_period,
        ));

        Self {
            config: Arc::new(config),
            policy,
            registry,
            broadcaster,
            metrics,
            lifecycle,
            routes: Arc::new(RouteTable::new()),
        }
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = Arc::new(routes);
        self
    }
}

/// Gateway-owned handler sets plus a detached placeholder for every platform
/// service module.
pub fn default_routes(state: &AppState) -> Result<RouteTable> {
    let mut routes = RouteTable::new();
    routes.register(
        "events",
        "/api/events",
        handlers::events_router(state.broadcaster.clone()),
    )?;
    routes.register(
        "sessions",
        "/api/sessions",
        handlers::sessions_router(state.registry.clone()),
    )?;
    for (name, prefix) in handlers::DOMAIN_MODULES {
        routes.register(*name, *prefix, handlers::detached(name))?;
    }
    Ok(routes)
}

/// Assemble the full request pipeline around the built-in endpoints and the
/// prefix dispatcher.
///
/// Layers are listed innermost first; the last one added runs first.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ws", get(ws::websocket_handler))
        .fallback(router::dispatch)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(from_fn_with_state(state.clone(), middleware::error_envelope))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestMakeSpan)
                .on_request(DefaultOnRequest::new().level(Level::INFO)),
        )
        .layer(from_fn_with_state(state.clone(), middleware::decode_body))
        .layer(origin::cors_layer(state.policy.clone()))
        .layer(from_fn_with_state(state.clone(), middleware::origin_gate))
        .with_state(state)
}

async fn method_not_allowed(request: Request) -> Response {
    GatewayError::MethodNotAllowed {
        method: request.method().to_string(),
    }
    .into_response()
}
