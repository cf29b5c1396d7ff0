//! Crate-wide error types.
//!
//! The store layer returns tagged errors so the transaction wrapper knows
//! what to retry; the HTTP boundary translates everything into the
//! `{"error": "...", "message": "..."}` shape described by the proxy's
//! external interface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Errors a `Store` write path can return. The transaction wrapper is the
/// only place that inspects `RetryableConflict` and decides to retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("retryable conflict: {0}")]
    RetryableConflict(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::RetryableConflict(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

/// Errors surfaced at the HTTP boundary, both for the proxy surface and the
/// admin JSON API. Each variant carries its own status code per the
/// specification's user-visible failure table.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad or missing token")]
    Unauthorized,
    #[error("model or cost cap exceeded")]
    Forbidden(String),
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("login rate limited, retry in {0}s")]
    TooManyRequests(u64),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("all upstreams failed: last_status={last_status}")]
    AllUpstreamsFailed { last_status: u16 },
    #[error("no channel available")]
    NoChannelAvailable,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("not found".into()),
            StoreError::RetryableConflict(m) | StoreError::Fatal(m) => ApiError::Internal(m),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::AllUpstreamsFailed { last_status } = self {
            let body = json!({ "error": "all upstreams failed", "last_status": last_status });
            return (StatusCode::BAD_GATEWAY, Json(body)).into_response();
        }

        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.clone()),
            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                self.to_string(),
            ),
            ApiError::TooManyRequests(secs) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("too many login attempts, retry in {secs}s"),
            ),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ApiError::AllUpstreamsFailed { .. } => unreachable!(),
            ApiError::NoChannelAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no_channel_available",
                self.to_string(),
            ),
            ApiError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting_down",
                self.to_string(),
            ),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m.clone()),
        };

        let body = json!({ "error": code, "message": message });
        (status, Json(body)).into_response()
    }
}
