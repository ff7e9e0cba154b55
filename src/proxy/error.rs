//! Request-path error type rendered in the Prometheus API error format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Error returned to clients before (or instead of) contacting the upstream.
///
/// The body matches what the upstream would produce:
/// `{"status":"error","errorType":"prometheus-api","error":"..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Internal(msg) => tracing::error!(error = %msg, "request failed"),
            ApiError::BadGateway(msg) => tracing::warn!(error = %msg, "upstream failure"),
            _ => tracing::debug!(error = %self, code = status.as_u16(), "request rejected"),
        }
        let body = serde_json::json!({
            "status": "error",
            "errorType": "prometheus-api",
            "error": human_friendly(&self.to_string()),
        });
        (status, Json(body)).into_response()
    }
}

/// Capitalize the first letter and terminate with a period, so raw error
/// chains read as sentences in client-facing responses.
fn human_friendly(msg: &str) -> String {
    let mut chars = msg.chars();
    let mut out = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => return String::new(),
    };
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}
