use axum::Router;
use axum::response::Response;

use crate::app::{AppState, build_router, default_routes};
use crate::config::{FileConfig, GatewayConfig};

/// Default configuration on a loopback ephemeral port, independent of the
/// process environment.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::from_file(&FileConfig::default()).expect("default config");
    config.listen_addr = "127.0.0.1:0".parse().expect("loopback addr");
    config
}

/// Build a fully-wired `AppState` with the default route table.
pub fn test_app_state() -> AppState {
    state_with_routes(test_config())
}

pub fn state_with_routes(config: GatewayConfig) -> AppState {
    let state = AppState::new(config);
    let routes = default_routes(&state).expect("default routes");
    state.with_routes(routes)
}

/// The assembled router for `state`, keeping its route table.
pub fn test_router(state: AppState) -> Router {
    build_router(state)
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json body")
}
