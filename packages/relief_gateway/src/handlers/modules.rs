use axum::{Json, Router, http::StatusCode, response::IntoResponse};

/// Platform service modules and the prefixes they are mounted on.
pub const DOMAIN_MODULES: &[(&str, &str)] = &[
    ("disasters", "/api/disasters"),
    ("social_media", "/api/social-media"),
    ("resources", "/api/resources"),
    ("verification", "/api/verification"),
    ("geocoding", "/api/geocoding"),
    ("reports", "/api/reports"),
    ("updates", "/api/updates"),
];

/// Placeholder handler set for a module that has not been attached yet.
/// Every request under its prefix gets a 503.
pub fn detached(name: &str) -> Router {
    let name = name.to_string();
    Router::new().fallback(move || {
        let name = name.clone();
        async move {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "service module not attached",
                    "module": name,
                })),
            )
                .into_response()
        }
    })
}
