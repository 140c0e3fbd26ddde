//! Gateway error taxonomy and its JSON rendering.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

/// Errors produced at the gateway boundary.
///
/// Every variant renders as a JSON body with at least an `error` field.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Origin is not in the allow-list.
    #[error("Not allowed by CORS")]
    AdmissionDenied { origin: String },

    /// Malformed input (body, event payload, query).
    #[error("{0}")]
    BadRequest(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// No built-in endpoint or route binding matched.
    #[error("Route not found")]
    NotFound { method: String, path: String },

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: String },

    /// Failure raised by a delegated handler set.
    #[error("{message}")]
    HandlerFailure {
        status: Option<StatusCode>,
        message: String,
        detail: Option<String>,
    },

    /// The registry is draining and refuses new sessions.
    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid route binding: {0}")]
    InvalidRoute(String),

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Context attached to the extensions of a `HandlerFailure` response.
///
/// The error envelope middleware reads it to log the failure with request
/// context and to decide whether `detail` is exposed to the client.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub message: String,
    pub detail: Option<String>,
}

impl GatewayError {
    /// Build a handler failure carrying an explicit status code.
    pub fn handler(status: StatusCode, message: impl Into<String>) -> Self {
        GatewayError::HandlerFailure {
            status: Some(status),
            message: message.into(),
            detail: None,
        }
    }

    /// Build a handler failure without a status code (rendered as 500).
    pub fn internal(message: impl Into<String>, detail: Option<String>) -> Self {
        GatewayError::HandlerFailure {
            status: None,
            message: message.into(),
            detail,
        }
    }

    /// Attach a detail string to a handler failure; other variants are unchanged.
    pub fn with_detail(self, detail: impl Into<String>) -> Self {
        match self {
            GatewayError::HandlerFailure {
                status, message, ..
            } => GatewayError::HandlerFailure {
                status,
                message,
                detail: Some(detail.into()),
            },
            other => other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AdmissionDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) | GatewayError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::HandlerFailure { status, .. } => {
                status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRoute(_) | GatewayError::BindFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::internal(err.to_string(), Some(format!("{err:?}")))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        match self {
            GatewayError::AdmissionDenied { origin } => (
                status,
                Json(serde_json::json!({ "error": message, "origin": origin })),
            )
                .into_response(),
            GatewayError::NotFound { method, path } => (
                status,
                Json(serde_json::json!({
                    "error": message,
                    "method": method,
                    "path": path,
                })),
            )
                .into_response(),
            GatewayError::MethodNotAllowed { method } => (
                status,
                Json(serde_json::json!({ "error": message, "method": method })),
            )
                .into_response(),
            GatewayError::HandlerFailure { detail, .. } => {
                // Detail stays out of the body; the envelope adds it back in
                // development mode.
                let mut response = (
                    status,
                    Json(serde_json::json!({
                        "error": message,
                        "status": status.as_u16(),
                    })),
                )
                    .into_response();
                response
                    .extensions_mut()
                    .insert(FailureContext { message, detail });
                response
            }
            _ => (status, Json(serde_json::json!({ "error": message }))).into_response(),
        }
    }
}
