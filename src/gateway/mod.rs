//! Provider Gateway: the single entry point for outbound ad-platform calls.
//!
//! Every call runs under one deadline and goes through, in order:
//!
//! 1. [`TokenManager::get_valid_token`] (refreshing if close to expiry)
//! 2. the [`CircuitBreaker`] for the provider
//! 3. the [`RateLimiter`] window for the key
//! 4. [`ProviderClient::execute`]
//!
//! The response is then classified. A 401 carrying an auth error triggers
//! exactly one refresh and retry, 429 feeds the limiter and surfaces
//! `RateLimited`, 5xx and network errors count against the breaker and are
//! retried with jittered backoff while the deadline allows, and 2xx bodies are
//! decoded into [`ApiResponse`]. Retry, backoff and breaker logic lives here
//! and nowhere else.

pub mod schema;

pub use schema::{AdAccount, ApiResponse, Campaign, InsightRow};

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::circuit_breaker::{CallPermit, CircuitBreaker};
use crate::config::{CallConfig, RateLimitConfig};
use crate::error::GatewayError;
use crate::provider::{ApiRequest, Provider, ProviderClient, ProviderUsage, RawResponse};
use crate::rate_limit::RateLimiter;
use crate::sanitize::sanitize_message;
use crate::token::{AccessToken, TokenManager};

/// Meta OAuthException codes for invalid or expired sessions.
const META_AUTH_CODES: [i64; 2] = [102, 190];

pub struct ProviderGateway {
    tokens: TokenManager,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    client: Arc<dyn ProviderClient>,
    config: CallConfig,
    max_wait: Duration,
    default_retry_after: Duration,
}

/// What to do after one attempt.
enum Attempt {
    Done(Result<ApiResponse, GatewayError>),
    AuthRejected,
    Retryable(String),
}

impl ProviderGateway {
    pub fn new(
        tokens: TokenManager,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        client: Arc<dyn ProviderClient>,
        config: CallConfig,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        Self {
            tokens,
            limiter,
            breaker,
            client,
            config,
            max_wait: rate_limit.max_wait(),
            default_retry_after: rate_limit.default_retry_after(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Executes `request` under the configured call deadline.
    pub async fn call(
        &self,
        organization_id: &str,
        provider: Provider,
        request: &ApiRequest,
    ) -> Result<ApiResponse, GatewayError> {
        self.call_with_deadline(organization_id, provider, request, self.config.call_deadline())
            .await
    }

    /// Executes `request`, giving up with `DeadlineExceeded` after `budget`.
    pub async fn call_with_deadline(
        &self,
        organization_id: &str,
        provider: Provider,
        request: &ApiRequest,
        budget: Duration,
    ) -> Result<ApiResponse, GatewayError> {
        request.validate()?;
        let deadline = Instant::now() + budget;

        match tokio::time::timeout_at(
            deadline,
            self.call_until(organization_id, provider, request, deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    organization_id = %organization_id,
                    provider = %provider,
                    operation = request.operation(),
                    "Provider call deadline exceeded"
                );
                Err(GatewayError::DeadlineExceeded)
            }
        }
    }

    async fn call_until(
        &self,
        organization_id: &str,
        provider: Provider,
        request: &ApiRequest,
        deadline: Instant,
    ) -> Result<ApiResponse, GatewayError> {
        let mut token = self.tokens.get_valid_token(organization_id, provider).await?;
        let breaker_key = self.breaker.key(organization_id, provider);
        let max_attempts = self.config.max_attempts.max(1);
        let mut failures = 0u32;
        let mut refreshed = false;

        loop {
            let permit = self.breaker.acquire(&breaker_key)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.limiter
                .acquire_blocking(organization_id, provider, self.max_wait.min(remaining))
                .await?;

            debug!(
                organization_id = %organization_id,
                provider = %provider,
                operation = request.operation(),
                attempt = failures + 1,
                "Calling provider"
            );

            let attempt = match self.client.execute(provider, token.as_str(), request).await {
                Ok(response) => self.classify(organization_id, provider, request, response, permit),
                Err(e) => {
                    permit.failure();
                    Attempt::Retryable(e.to_string())
                }
            };

            match attempt {
                Attempt::Done(result) => return result,
                Attempt::AuthRejected if !refreshed => {
                    debug!(
                        organization_id = %organization_id,
                        provider = %provider,
                        "Access token rejected, refreshing once"
                    );
                    refreshed = true;
                    token = self
                        .refresh_rejected(organization_id, provider, &token)
                        .await?;
                }
                Attempt::AuthRejected => {
                    warn!(
                        organization_id = %organization_id,
                        provider = %provider,
                        "Refreshed token rejected again"
                    );
                    return Err(GatewayError::auth_required(provider, "access token rejected"));
                }
                Attempt::Retryable(reason) => {
                    failures += 1;
                    if failures >= max_attempts {
                        warn!(
                            organization_id = %organization_id,
                            provider = %provider,
                            attempts = failures,
                            reason = %sanitize_message(&reason),
                            "Provider unavailable, giving up"
                        );
                        return Err(GatewayError::ProviderUnavailable {
                            provider,
                            attempts: failures,
                        });
                    }

                    let delay = self.backoff_delay(failures);
                    if Instant::now() + delay >= deadline {
                        return Err(GatewayError::ProviderUnavailable {
                            provider,
                            attempts: failures,
                        });
                    }
                    warn!(
                        organization_id = %organization_id,
                        provider = %provider,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %sanitize_message(&reason),
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn refresh_rejected(
        &self,
        organization_id: &str,
        provider: Provider,
        rejected: &AccessToken,
    ) -> Result<AccessToken, GatewayError> {
        self.tokens
            .refresh_after_rejection(organization_id, provider, rejected)
            .await
    }

    fn classify(
        &self,
        organization_id: &str,
        provider: Provider,
        request: &ApiRequest,
        response: RawResponse,
        permit: CallPermit,
    ) -> Attempt {
        let usage = ProviderUsage::from_response(&response);

        match response.status {
            200..=299 => {
                permit.success();
                self.limiter.record_usage(organization_id, provider, &usage);
                Attempt::Done(schema::parse_response(provider, request, &response.body))
            }
            429 => {
                permit.neutral();
                let retry_after = usage.retry_after.unwrap_or(self.default_retry_after);
                let usage = ProviderUsage {
                    retry_after: Some(retry_after),
                    ..usage
                };
                self.limiter.record_usage(organization_id, provider, &usage);
                warn!(
                    organization_id = %organization_id,
                    provider = %provider,
                    retry_after_secs = retry_after.as_secs(),
                    "Provider rate limited the call"
                );
                Attempt::Done(Err(GatewayError::RateLimited { retry_after }))
            }
            500..=599 => {
                permit.failure();
                Attempt::Retryable(format!("status {}", response.status))
            }
            status => {
                permit.neutral();
                self.limiter.record_usage(organization_id, provider, &usage);
                if is_auth_rejection(&response) {
                    return Attempt::AuthRejected;
                }
                Attempt::Done(Err(GatewayError::ProviderRejected {
                    status,
                    detail: error_detail(&response),
                }))
            }
        }
    }

    /// Full-jitter exponential backoff: uniform in `[0, min(max, base * 2^(n-1))]`.
    fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = self
            .config
            .backoff_base()
            .saturating_mul(1u32 << failures.saturating_sub(1).min(20));
        let ceiling = exp.min(self.config.backoff_max()).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// True when the provider rejected the access token itself, as opposed to
/// the request. Meta reports expired sessions as 400 or 401 with
/// OAuthException codes 102/190.
fn is_auth_rejection(response: &RawResponse) -> bool {
    if !matches!(response.status, 400 | 401 | 403) {
        return false;
    }
    if response.status == 401
        && response
            .header("www-authenticate")
            .is_some_and(|v| v.contains("invalid_token"))
    {
        return true;
    }

    let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
        return false;
    };
    let error = body.get("error");

    // Meta: {"error": {"type": "OAuthException", "code": 190}}
    let meta_code = error.and_then(|e| e.get("code")).and_then(Value::as_i64);
    if meta_code.is_some_and(|code| META_AUTH_CODES.contains(&code)) {
        return true;
    }
    let meta_type = error.and_then(|e| e.get("type")).and_then(Value::as_str);
    if response.status == 401 && meta_type == Some("OAuthException") {
        return true;
    }

    // Google: {"error": {"status": "UNAUTHENTICATED"}} or {"error": "invalid_token"}
    let google_status = error.and_then(|e| e.get("status")).and_then(Value::as_str);
    if response.status == 401 && google_status == Some("UNAUTHENTICATED") {
        return true;
    }
    error.and_then(Value::as_str) == Some("invalid_token")
}

/// Provider error message with anything token-like removed.
fn error_detail(response: &RawResponse) -> String {
    let message = serde_json::from_slice::<Value>(&response.body)
        .ok()
        .and_then(|body| {
            body.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| response.body_text());
    sanitize_message(&message)
}

#[cfg(test)]
mod tests;
