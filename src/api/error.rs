//! Mapping from gateway errors to HTTP responses.
//!
//! Callers only learn what to do next (`reconnect`, `retry_later`). Breaker
//! state, limiter windows and retry counts stay internal.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;
use tracing::error;

use crate::error::GatewayError;
use crate::identity::IdentityError;

/// Error response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Application error types for the integration endpoints
#[derive(Debug, PartialEq)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    /// Stored authorization is gone; the user must reconnect the provider.
    Reconnect(String),
    RateLimited(Duration),
    /// Provider temporarily unreachable from the gateway.
    RetryLater(String),
    BadGateway(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, action, retry_after) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            AppError::Reconnect(msg) => (StatusCode::UNAUTHORIZED, msg, Some("reconnect"), None),
            AppError::RateLimited(wait) => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
                Some("retry_later"),
                Some(retry_after_seconds(wait)),
            ),
            AppError::RetryLater(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg, Some("retry_later"), None)
            }
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None, None),
        };

        let body = Json(ErrorResponse {
            error,
            action,
            retry_after_seconds: retry_after,
        });

        let mut response = (status, body).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_seconds(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::AuthenticationRequired { provider, .. } => {
                AppError::Reconnect(format!("{} connection must be re-authorized", provider))
            }
            GatewayError::RateLimited { retry_after } => AppError::RateLimited(retry_after),
            GatewayError::CircuitOpen { provider }
            | GatewayError::ProviderUnavailable { provider, .. } => {
                AppError::RetryLater(format!("{} is temporarily unavailable", provider))
            }
            GatewayError::Transient(_) | GatewayError::DeadlineExceeded => {
                AppError::RetryLater("Provider is temporarily unavailable".to_string())
            }
            GatewayError::InvalidState
            | GatewayError::InvalidRequest(_)
            | GatewayError::UnsupportedProvider(_) => AppError::BadRequest(err.to_string()),
            GatewayError::InvalidSignature => AppError::Unauthorized(err.to_string()),
            GatewayError::InvalidResponse(_) | GatewayError::ProviderRejected { .. } => {
                AppError::BadGateway(err.to_string())
            }
            GatewayError::NotConfigured { .. } => AppError::ServerError(err.to_string()),
            GatewayError::Storage(detail) => {
                error!(error = %detail, "Credential storage failure");
                AppError::ServerError("Credential storage unavailable".to_string())
            }
        }
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}
