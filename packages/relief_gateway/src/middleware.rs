//! Request pipeline middleware
//!
//! Applied in order for every plain request: origin gate, CORS headers, body
//! decoding, request span, error envelope, panic guard. The router assembles
//! them in [`crate::app::build_router`].

use axum::{
    Form, Json,
    body::Body,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request, State},
    http::{HeaderMap, Method, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use tower_http::trace::MakeSpan;
use tracing::{error, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{FailureContext, GatewayError};
use crate::origin::{ALLOWED_METHODS, USER_ID_HEADER};

/// Who sent a request, as seen by logging and error reporting.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub origin: Option<String>,
    pub client_addr: Option<SocketAddr>,
    /// Value of the `x-user-id` header, if the client sent one
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn capture<B>(request: &axum::http::Request<B>) -> Self {
        Self::from_pieces(
            request.method(),
            request.uri().path(),
            request.headers(),
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        )
    }

    fn from_pieces(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        client_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            method: method.clone(),
            path: path.to_string(),
            origin: header_string(headers, header::ORIGIN.as_str()),
            client_addr,
            user_id: header_string(headers, USER_ID_HEADER.as_str()),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_pieces(
            &parts.method,
            parts.uri.path(),
            &parts.headers,
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Non-UTF-8 header values are kept lossily so they still fail the
/// allow-list comparison instead of disappearing.
fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

// =============================================================================
// Origin gate
// =============================================================================

/// Reject disallowed methods and origins before anything else runs.
pub async fn origin_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !ALLOWED_METHODS.contains(request.method()) {
        return GatewayError::MethodNotAllowed {
            method: request.method().to_string(),
        }
        .into_response();
    }

    let origin = header_string(request.headers(), header::ORIGIN.as_str());
    if !state.policy.is_allowed(origin.as_deref()) {
        return GatewayError::AdmissionDenied {
            origin: origin.unwrap_or_default(),
        }
        .into_response();
    }

    next.run(request).await
}

// =============================================================================
// Body decoding
// =============================================================================

/// A request body decoded by [`decode_body`], available to route modules as
/// an extension. The raw bytes stay on the request as well.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody(pub serde_json::Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Form,
}

fn body_kind(headers: &HeaderMap) -> Option<BodyKind> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime == "application/json" || mime.ends_with("+json") {
        Some(BodyKind::Json)
    } else if mime == "application/x-www-form-urlencoded" {
        Some(BodyKind::Form)
    } else {
        None
    }
}

/// Buffer JSON and form bodies up to the configured limit and decode them.
///
/// Other content types pass through untouched.
pub async fn decode_body(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(kind) = body_kind(request.headers()) else {
        return next.run(request).await;
    };
    let limit = state.config.body_limit_bytes;

    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > limit) {
        return GatewayError::PayloadTooLarge { limit }.into_response();
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) if exceeded_limit(&e) => {
            warn!(limit, "Request body over limit");
            return GatewayError::PayloadTooLarge { limit }.into_response();
        }
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return GatewayError::BadRequest(format!("Failed to read request body: {}", e))
                .into_response();
        }
    };

    if !bytes.is_empty() {
        let decoded = match kind {
            BodyKind::Json => serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| GatewayError::BadRequest(format!("Malformed JSON body: {}", e))),
            BodyKind::Form => decode_form(bytes.clone()).await,
        };
        match decoded {
            Ok(value) => {
                parts.extensions.insert(DecodedBody(value));
            }
            Err(err) => return err.into_response(),
        }
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn exceeded_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

async fn decode_form(bytes: axum::body::Bytes) -> Result<serde_json::Value, GatewayError> {
    let request = axum::http::Request::builder()
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|rejection| {
            GatewayError::BadRequest(format!("Malformed form body: {}", rejection.body_text()))
        })?;

    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        map.insert(key, serde_json::Value::String(value));
    }
    Ok(serde_json::Value::Object(map))
}

// =============================================================================
// Request span
// =============================================================================

/// Span maker that tags each request with a fresh request ID and the
/// caller's origin, address and user ID.
#[derive(Clone)]
pub struct RequestMakeSpan;

impl<B> MakeSpan<B> for RequestMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let ctx = RequestContext::capture(request);
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            origin = ctx.origin.as_deref().unwrap_or("-"),
            client_addr = %ctx.client_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
        )
    }
}

// =============================================================================
// Error envelope
// =============================================================================

/// Log handler failures with request context and, in development mode, add
/// the failure detail to the response body.
pub async fn error_envelope(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::capture(&request);
    let response = next.run(request).await;

    let Some(failure) = response.extensions().get::<FailureContext>().cloned() else {
        return response;
    };
    let status = response.status();
    state.metrics.handler_failed();
    error!(
        method = %ctx.method,
        path = %ctx.path,
        origin = ctx.origin.as_deref().unwrap_or("-"),
        client_addr = %ctx.client_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
        status = status.as_u16(),
        detail = failure.detail.as_deref().unwrap_or("-"),
        "Handler failed: {}",
        failure.message
    );

    if !state.config.mode.is_development() {
        return response;
    }
    let Some(detail) = failure.detail else {
        return response;
    };
    let mut response = (
        status,
        Json(serde_json::json!({
            "error": failure.message,
            "status": status.as_u16(),
            "detail": detail,
        })),
    )
        .into_response();
    response.extensions_mut().insert(FailureContext {
        message: failure.message,
        detail: Some(detail),
    });
    response
}

// =============================================================================
// Panic guard
// =============================================================================

/// Turn a panicking handler into a 500 handler failure.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    GatewayError::handler(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        .with_detail(format!("panic: {}", detail))
        .into_response()
}
