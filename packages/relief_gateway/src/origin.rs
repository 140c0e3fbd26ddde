//! Origin Policy
//!
//! Decides whether a request or handshake origin is admissible. The allow-list
//! is fixed at construction; comparison is exact and case-sensitive.

use axum::http::{HeaderName, HeaderValue, Method, header};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// Pass-through identity header forwarded to handler sets.
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

/// Methods accepted at the gateway layer.
pub const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

#[derive(Debug)]
pub struct OriginPolicy {
    allow_list: Vec<String>,
    rejections: AtomicU64,
}

impl OriginPolicy {
    pub fn new(allow_list: Vec<String>) -> Self {
        Self {
            allow_list,
            rejections: AtomicU64::new(0),
        }
    }

    /// Absent origins (server-to-server callers) are always admitted.
    /// Rejections are logged and counted; they never error.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        if self.allow_list.iter().any(|allowed| allowed == origin) {
            return true;
        }
        self.rejections.fetch_add(1, Ordering::Relaxed);
        warn!(origin = %origin, "Rejected request from disallowed origin");
        false
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    /// Number of rejected origins since startup.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// CORS response headers for admitted origins.
///
/// Disallowed origins are already turned away by the origin gate, so the
/// predicate only decides whether to echo `Access-Control-Allow-Origin`.
pub fn cors_layer(policy: Arc<OriginPolicy>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts| {
                origin
                    .to_str()
                    .map(|o| policy.allow_list().iter().any(|allowed| allowed == o))
                    .unwrap_or(false)
            },
        ))
        .allow_methods(ALLOWED_METHODS.to_vec())
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, USER_ID_HEADER])
        .allow_credentials(true)
}
