//! Route bindings
//!
//! Maps URL prefixes onto independently built handler sets. Matching is
//! segment-aware: `/api/reports` matches `/api/reports` and
//! `/api/reports/7`, never `/api/reportsx`. When two prefixes match, the
//! longest wins. The matched prefix is stripped before the request reaches
//! the handler set, the query string is kept.

use axum::{
    Json, Router,
    body::HttpBody,
    extract::{Request, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::collections::BTreeMap;
use tower::ServiceExt;

use crate::app::AppState;
use crate::error::{GatewayError, Result};

/// Paths served by the gateway itself; no binding may claim them.
pub const RESERVED_PATHS: &[&str] = &["/", "/health", "/ws"];

/// One prefix and the handler set mounted on it.
#[derive(Clone)]
pub struct RouteBinding {
    pub name: String,
    pub prefix: String,
    pub handlers: Router,
}

impl std::fmt::Debug for RouteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBinding")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RouteBinding {
    fn matches(&self, path: &str) -> bool {
        path == self.prefix
            || path
                .strip_prefix(self.prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Prefix table, fixed once the gateway starts accepting.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    bindings: Vec<RouteBinding>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `handlers` under `prefix`.
    ///
    /// The prefix must start with `/`, must not end with `/`, must not be a
    /// built-in path, and must not repeat an existing prefix or name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        prefix: impl Into<String>,
        handlers: Router,
    ) -> Result<()> {
        let name = name.into();
        let prefix = prefix.into();

        if name.trim().is_empty() {
            return Err(GatewayError::InvalidRoute("binding name is empty".into()));
        }
        if !prefix.starts_with('/') || prefix.len() < 2 {
            return Err(GatewayError::InvalidRoute(format!(
                "prefix {prefix:?} must start with '/' and name a path"
            )));
        }
        if prefix.ends_with('/') {
            return Err(GatewayError::InvalidRoute(format!(
                "prefix {prefix:?} must not end with '/'"
            )));
        }
        if prefix.contains(['?', '#']) {
            return Err(GatewayError::InvalidRoute(format!(
                "prefix {prefix:?} must be a bare path"
            )));
        }
        if RESERVED_PATHS.contains(&prefix.as_str()) {
            return Err(GatewayError::InvalidRoute(format!(
                "prefix {prefix:?} is served by the gateway"
            )));
        }
        if let Some(existing) = self
            .bindings
            .iter()
            .find(|b| b.prefix == prefix || b.name == name)
        {
            return Err(GatewayError::InvalidRoute(format!(
                "{name} at {prefix} collides with {} at {}",
                existing.name, existing.prefix
            )));
        }

        self.bindings.push(RouteBinding {
            name,
            prefix,
            handlers,
        });
        Ok(())
    }

    /// Longest-prefix match. Returns the binding and the path left after
    /// stripping its prefix (always starting with `/`).
    pub fn resolve<'a>(&'a self, path: &'a str) -> Option<(&'a RouteBinding, &'a str)> {
        let binding = self
            .bindings
            .iter()
            .filter(|b| b.matches(path))
            .max_by_key(|b| b.prefix.len())?;
        let rest = &path[binding.prefix.len()..];
        Some((binding, if rest.is_empty() { "/" } else { rest }))
    }

    pub fn bindings(&self) -> &[RouteBinding] {
        &self.bindings
    }

    /// Binding name to prefix, for the service descriptor.
    pub fn endpoints(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .map(|b| (b.name.clone(), b.prefix.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Upper bound on a plain-text rejection body carried into a JSON error.
const MAX_REJECTION_BYTES: usize = 4 * 1024;

/// Fallback for everything the built-in routes don't serve: delegate to the
/// matching binding or answer with a structured 404.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().to_string();
    let Some((binding, rest)) = state.routes.resolve(&path) else {
        return GatewayError::NotFound { method, path }.into_response();
    };

    let (mut parts, body) = request.into_parts();
    let rewritten = match parts.uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    };
    parts.uri = match rewritten.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            return GatewayError::BadRequest(format!("Invalid request path: {e}")).into_response();
        }
    };

    let response = match binding
        .handlers
        .clone()
        .oneshot(Request::from_parts(parts, body))
        .await
    {
        Ok(response) => response,
        Err(never) => match never {},
    };
    json_client_error(response, method, path).await
}

/// Rewrite a handler set's non-JSON 4xx as a JSON error.
///
/// An empty 404 or 405 is the handler set's own routing miss and gets the
/// same body the gateway uses, echoing the original path. Other plain-text
/// rejections (extractor failures) keep their status and message.
async fn json_client_error(response: Response, method: String, path: String) -> Response {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !status.is_client_error() || is_json {
        return response;
    }

    let empty = response.body().size_hint().exact() == Some(0);
    match status {
        StatusCode::NOT_FOUND if empty => GatewayError::NotFound { method, path }.into_response(),
        StatusCode::METHOD_NOT_ALLOWED if empty => {
            let allow = response.headers().get(header::ALLOW).cloned();
            let mut rewritten = GatewayError::MethodNotAllowed { method }.into_response();
            if let Some(allow) = allow {
                rewritten.headers_mut().insert(header::ALLOW, allow);
            }
            rewritten
        }
        _ => {
            let message = match axum::body::to_bytes(response.into_body(), MAX_REJECTION_BYTES).await {
                Ok(bytes) if !bytes.is_empty() => String::from_utf8_lossy(&bytes).into_owned(),
                _ => status
                    .canonical_reason()
                    .unwrap_or("Request rejected")
                    .to_string(),
            };
            (
                status,
                Json(serde_json::json!({
                    "error": message,
                    "status": status.as_u16(),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn table(prefixes: &[(&str, &str)]) -> RouteTable {
        let mut table = RouteTable::new();
        for (name, prefix) in prefixes {
            table.register(*name, *prefix, Router::new()).unwrap();
        }
        table
    }

    #[test]
    fn resolve_is_segment_aware() {
        let table = table(&[("reports", "/api/reports")]);

        let (binding, rest) = table.resolve("/api/reports").unwrap();
        assert_eq!(binding.name, "reports");
        assert_eq!(rest, "/");

        let (_, rest) = table.resolve("/api/reports/7").unwrap();
        assert_eq!(rest, "/7");

        let (_, rest) = table.resolve("/api/reports/").unwrap();
        assert_eq!(rest, "/");

        assert!(table.resolve("/api/reportsx").is_none());
        assert!(table.resolve("/api").is_none());
    }

    #[test]
    fn resolve_prefers_longest_prefix() {
        let table = table(&[("api", "/api"), ("updates", "/api/updates")]);

        let (binding, rest) = table.resolve("/api/updates/official").unwrap();
        assert_eq!(binding.name, "updates");
        assert_eq!(rest, "/official");

        let (binding, rest) = table.resolve("/api/other").unwrap();
        assert_eq!(binding.name, "api");
        assert_eq!(rest, "/other");
    }

    #[test]
    fn register_rejects_bad_prefixes() {
        let mut table = RouteTable::new();
        for prefix in ["", "/", "api", "/api/", "/health", "/ws", "/api?x=1"] {
            assert!(
                matches!(
                    table.register("m", prefix, Router::new()),
                    Err(GatewayError::InvalidRoute(_))
                ),
                "{prefix:?} should be rejected"
            );
        }
        assert!(table.is_empty());
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut table = table(&[("geocoding", "/api/geocoding")]);
        assert!(table.register("geo", "/api/geocoding", Router::new()).is_err());
        assert!(table.register("geocoding", "/api/geo", Router::new()).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn endpoints_list_every_binding() {
        let table = table(&[("resources", "/api/resources"), ("updates", "/api/updates")]);
        let endpoints = table.endpoints();
        assert_eq!(endpoints.get("resources").unwrap(), "/api/resources");
        assert_eq!(endpoints.get("updates").unwrap(), "/api/updates");
    }

    #[tokio::test]
    async fn binding_router_sees_stripped_path() {
        let handlers = Router::new()
            .route("/", get(|| async { "root" }))
            .route(
                "/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move { id }),
            );
        let mut table = RouteTable::new();
        table.register("reports", "/api/reports", handlers).unwrap();

        let (binding, rest) = table.resolve("/api/reports/42").unwrap();
        let request = axum::http::Request::builder()
            .uri(rest)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = binding.handlers.clone().oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"42");
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn plain_rejections_become_json() {
        let response = json_client_error(
            (StatusCode::NOT_FOUND, "no such report").into_response(),
            "GET".into(),
            "/api/reports/9".into(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = json_body(response).await;
        assert_eq!(json["error"], "no such report");
        assert_eq!(json["status"], 404);

        let response = json_client_error(
            StatusCode::UNPROCESSABLE_ENTITY.into_response(),
            "POST".into(),
            "/api/reports".into(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["error"], "Unprocessable Entity");
    }

    #[tokio::test]
    async fn empty_routing_miss_echoes_original_path() {
        let response = json_client_error(
            StatusCode::NOT_FOUND.into_response(),
            "GET".into(),
            "/api/reports/9/extra".into(),
        )
        .await;
        let json = json_body(response).await;
        assert_eq!(json["error"], "Route not found");
        assert_eq!(json["path"], "/api/reports/9/extra");
    }

    #[tokio::test]
    async fn json_and_success_responses_pass_through() {
        let response = json_client_error(
            (
                StatusCode::CONFLICT,
                axum::Json(serde_json::json!({ "error": "already claimed" })),
            )
                .into_response(),
            "PUT".into(),
            "/api/resources/3".into(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await, serde_json::json!({ "error": "already claimed" }));

        let response =
            json_client_error("ok".into_response(), "GET".into(), "/api/resources".into()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
