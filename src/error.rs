//! Error taxonomy surfaced by the gateway to the rest of the application.
//!
//! Variants are chosen by what the caller must do next: re-authorize
//! ([`GatewayError::AuthenticationRequired`]), back off
//! ([`GatewayError::RateLimited`], [`GatewayError::CircuitOpen`],
//! [`GatewayError::ProviderUnavailable`]) or give up
//! ([`GatewayError::InvalidResponse`], security rejections). Raw HTTP client
//! errors never appear here.

use std::time::Duration;
use thiserror::Error;

use crate::provider::Provider;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// The organization must re-run the OAuth flow for this provider.
    #[error("{provider} authorization required: {reason}")]
    AuthenticationRequired { provider: Provider, reason: String },

    /// Provider quota exhausted; retry after the hint.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Provider is failing and calls are short-circuited.
    #[error("{provider} is temporarily unavailable")]
    CircuitOpen { provider: Provider },

    /// Retries against 5xx or network errors were exhausted.
    #[error("{provider} unavailable after {attempts} attempts")]
    ProviderUnavailable { provider: Provider, attempts: u32 },

    /// Provider returned a payload the gateway does not accept.
    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),

    /// Provider refused the request itself (non-auth 4xx).
    #[error("request rejected by provider ({status}): {detail}")]
    ProviderRejected { status: u16, detail: String },

    /// The caller's request is malformed (bad account id, date range, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown, expired or already-consumed OAuth state parameter.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// Webhook signature did not verify.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Temporary failure outside the data path (e.g. token endpoint down).
    #[error("transient error: {0}")]
    Transient(String),

    /// The caller's deadline elapsed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// App credentials for the provider are missing from configuration.
    #[error("{provider} integration is not configured")]
    NotConfigured { provider: Provider },

    /// Credential storage failure. The message never contains token material.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// True for errors the caller should retry later rather than surface as a
    /// hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::CircuitOpen { .. }
                | GatewayError::ProviderUnavailable { .. }
                | GatewayError::Transient(_)
                | GatewayError::DeadlineExceeded
        )
    }

    pub(crate) fn auth_required(provider: Provider, reason: impl Into<String>) -> Self {
        GatewayError::AuthenticationRequired {
            provider,
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        GatewayError::Storage(crate::sanitize::sanitize_message(&format!("{:#}", err)))
    }
}
