//! Deterministic in-process provider.
//!
//! Issues tokens named `fake-access-<n>` / `fake-refresh-<n>`, answers data
//! requests with small canned payloads in each provider's response shape, and
//! can be scripted per call. Selected with `gateway.client = "fake"` for local
//! development; the test suites drive it directly.

use super::{
    ApiRequest, Provider, ProviderClient, RawResponse, TokenEndpointError, TokenGrant,
    TransportError,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3_600;

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<RawResponse, TransportError>>,
    refresh_results: VecDeque<Result<TokenGrant, TokenEndpointError>>,
    exchange_error: Option<TokenEndpointError>,
    refresh_error: Option<TokenEndpointError>,
    refresh_delay: Duration,
    executed_tokens: Vec<String>,
    refresh_credentials: Vec<String>,
}

pub struct FakeProviderClient {
    script: Mutex<Script>,
    token_lifetime_secs: i64,
    issued: AtomicU32,
    exchange_calls: AtomicU32,
    refresh_calls: AtomicU32,
    execute_calls: AtomicU32,
}

impl Default for FakeProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProviderClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            token_lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
            issued: AtomicU32::new(0),
            exchange_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
            execute_calls: AtomicU32::new(0),
        }
    }

    /// Lifetime reported as `expires_in` on issued tokens.
    pub fn with_token_lifetime(mut self, seconds: i64) -> Self {
        self.token_lifetime_secs = seconds;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of the next `execute` call.
    pub fn push_response(&self, response: RawResponse) {
        self.script().responses.push_back(Ok(response));
    }

    pub fn push_transport_error(&self, error: TransportError) {
        self.script().responses.push_back(Err(error));
    }

    /// Queues the outcome of the next `refresh_token` call.
    pub fn push_refresh_result(&self, result: Result<TokenGrant, TokenEndpointError>) {
        self.script().refresh_results.push_back(result);
    }

    /// Every refresh fails with `error` until cleared.
    pub fn set_refresh_error(&self, error: Option<TokenEndpointError>) {
        self.script().refresh_error = error;
    }

    /// Every code exchange fails with `error` until cleared.
    pub fn set_exchange_error(&self, error: Option<TokenEndpointError>) {
        self.script().exchange_error = error;
    }

    /// Simulated token endpoint latency for refreshes.
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.script().refresh_delay = delay;
    }

    pub fn exchange_calls(&self) -> u32 {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> u32 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Refresh credentials presented to `refresh_token`, in call order.
    pub fn refresh_credentials(&self) -> Vec<String> {
        self.script().refresh_credentials.clone()
    }

    /// Access tokens presented to `execute`, in call order.
    pub fn executed_tokens(&self) -> Vec<String> {
        self.script().executed_tokens.clone()
    }

    fn issue(&self, with_refresh: bool) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("fake-access-{}", n),
            refresh_token: with_refresh.then(|| format!("fake-refresh-{}", n)),
            expires_in: Some(self.token_lifetime_secs),
            scopes: Vec::new(),
            ad_account_id: Some("1234567890".to_string()),
            business_id: None,
        }
    }
}

/// Canned 200 payload in the provider's own response shape.
fn canned_response(provider: Provider, request: &ApiRequest) -> RawResponse {
    let body = match (provider, request) {
        (Provider::Meta, ApiRequest::ListAdAccounts) => json!({
            "data": [{ "id": "act_1234567890", "name": "Fake Ad Account", "currency": "USD" }]
        }),
        (Provider::Meta, ApiRequest::ListCampaigns { .. }) => json!({
            "data": [{ "id": "120200000000001", "name": "Spring Drive", "status": "ACTIVE" }]
        }),
        (Provider::Meta, ApiRequest::GetInsights { since, .. }) => json!({
            "data": [{
                "date_start": since, "spend": "12.50", "impressions": "1000", "clicks": "25"
            }]
        }),
        (Provider::GoogleAds, ApiRequest::ListAdAccounts) => json!({
            "resourceNames": ["customers/1234567890"]
        }),
        (Provider::GoogleAds, ApiRequest::ListCampaigns { .. }) => json!({
            "results": [{
                "campaign": { "id": "9000000001", "name": "Spring Drive", "status": "ENABLED" }
            }]
        }),
        (Provider::GoogleAds, ApiRequest::GetInsights { since, .. }) => json!({
            "results": [{
                "segments": { "date": since },
                "metrics": { "costMicros": "12500000", "impressions": "1000", "clicks": "25" }
            }]
        }),
    };
    RawResponse::new(200, body.to_string()).with_header("content-type", "application/json")
}

#[async_trait]
impl ProviderClient for FakeProviderClient {
    async fn exchange_code(
        &self,
        _provider: Provider,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let scripted_error = self.script().exchange_error.clone();
        if let Some(error) = scripted_error {
            return Err(error);
        }
        if code.is_empty() {
            return Err(TokenEndpointError::InvalidGrant("empty code".to_string()));
        }
        Ok(self.issue(true))
    }

    async fn refresh_token(
        &self,
        _provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, scripted, sticky) = {
            let mut script = self.script();
            script.refresh_credentials.push(refresh_token.to_string());
            (
                script.refresh_delay,
                script.refresh_results.pop_front(),
                script.refresh_error.clone(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = scripted {
            return result;
        }
        if let Some(error) = sticky {
            return Err(error);
        }
        Ok(self.issue(false))
    }

    async fn execute(
        &self,
        provider: Provider,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<RawResponse, TransportError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut script = self.script();
            script.executed_tokens.push(access_token.to_string());
            script.responses.pop_front()
        };
        scripted.unwrap_or_else(|| Ok(canned_response(provider, request)))
    }
}
