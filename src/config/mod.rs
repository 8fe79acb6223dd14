use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::provider::{Provider, ProviderEndpoints};

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub gateway: CallConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Externally reachable base URL, used to build OAuth redirect URIs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Application UI page the OAuth callback redirects back to
    #[serde(default = "default_ui_redirect_url")]
    pub ui_redirect_url: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ui_redirect_url() -> String {
    "http://localhost:3000/settings/integrations".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            public_base_url: default_public_base_url(),
            ui_redirect_url: default_ui_redirect_url(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "credentials.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// OAuth state configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long a state parameter stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// How often expired states are purged (seconds)
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

/// Token lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Refresh this long before expiry (seconds)
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,
    /// Upper bound for one refresh exchange (seconds)
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,
    /// Lifetime assumed when a provider omits `expires_in` (seconds)
    #[serde(default = "default_token_lifetime")]
    pub default_lifetime_seconds: i64,
}

fn default_refresh_skew() -> i64 {
    60
}

fn default_refresh_timeout() -> u64 {
    15
}

fn default_token_lifetime() -> i64 {
    60 * 24 * 60 * 60 // Meta long-lived tokens: 60 days
}

impl TokenConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_skew_seconds: default_refresh_skew(),
            refresh_timeout_seconds: default_refresh_timeout(),
            default_lifetime_seconds: default_token_lifetime(),
        }
    }
}

/// Whose quota a rate-limit window tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One window per (organization, provider)
    Organization,
    /// One window per provider, shared by every organization on the same
    /// developer app
    App,
}

impl std::str::FromStr for RateLimitScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "organization" => Ok(RateLimitScope::Organization),
            "app" => Ok(RateLimitScope::App),
            other => anyhow::bail!("Unknown rate limit scope '{}'", other),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_scope")]
    pub scope: RateLimitScope,
    /// Longest a call waits for quota before failing (milliseconds)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Default `Retry-After` when a provider 429 carries none (seconds)
    #[serde(default = "default_retry_after")]
    pub default_retry_after_seconds: u64,
}

fn default_rate_limit_scope() -> RateLimitScope {
    RateLimitScope::Organization
}

fn default_max_wait_ms() -> u64 {
    2_000
}

fn default_retry_after() -> u64 {
    60
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            scope: default_rate_limit_scope(),
            max_wait_ms: default_max_wait_ms(),
            default_retry_after_seconds: default_retry_after(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive failures must fall within this window to open the circuit
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window_seconds: u64,
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_seconds: u64,
    /// Cap for the doubled reset timeout after failed trials
    #[serde(default = "default_max_reset_timeout")]
    pub max_reset_timeout_seconds: u64,
    /// Track one circuit per (provider, organization) instead of per provider
    #[serde(default)]
    pub per_organization: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_evaluation_window() -> u64 {
    60
}

fn default_reset_timeout() -> u64 {
    60
}

fn default_max_reset_timeout() -> u64 {
    600
}

impl CircuitBreakerConfig {
    pub fn evaluation_window(&self) -> Duration {
        Duration::from_secs(self.evaluation_window_seconds)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }

    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.max_reset_timeout_seconds)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            evaluation_window_seconds: default_evaluation_window(),
            reset_timeout_seconds: default_reset_timeout(),
            max_reset_timeout_seconds: default_max_reset_timeout(),
            per_organization: false,
        }
    }
}

/// Which [`ProviderClient`](crate::provider::ProviderClient) is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    Http,
    Fake,
}

/// Outbound call policy
#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    /// Overall budget for one gateway call, retries included (seconds)
    #[serde(default = "default_call_deadline")]
    pub call_deadline_seconds: u64,
    /// Attempts against 5xx/network failures, first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Per-request timeout of the HTTP client (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_client_mode")]
    pub client: ClientMode,
}

fn default_call_deadline() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_http_timeout() -> u64 {
    8
}

fn default_client_mode() -> ClientMode {
    ClientMode::Http
}

impl CallConfig {
    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            call_deadline_seconds: default_call_deadline(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            http_timeout_seconds: default_http_timeout(),
            client: default_client_mode(),
        }
    }
}

/// Per-provider app credentials, endpoint overrides and quota
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub meta: ProviderSettings,
    #[serde(default)]
    pub google_ads: ProviderSettings,
}

#[derive(Clone, Default, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Shared secret for signed deauthorization webhooks
    #[serde(default)]
    pub webhook_secret: String,
    /// Google Ads developer token (sent as `developer-token`)
    #[serde(default)]
    pub developer_token: Option<String>,
    /// Google Ads manager account (sent as `login-customer-id`)
    #[serde(default)]
    pub login_customer_id: Option<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Calls admitted per quota window (provider default when unset)
    #[serde(default)]
    pub quota_capacity: Option<u32>,
    #[serde(default)]
    pub quota_window_seconds: Option<u64>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("developer_token", &self.developer_token.as_ref().map(|_| "[REDACTED]"))
            .field("login_customer_id", &self.login_customer_id)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("api_base_url", &self.api_base_url)
            .field("quota_capacity", &self.quota_capacity)
            .field("quota_window_seconds", &self.quota_window_seconds)
            .finish()
    }
}

/// Documented provider quotas as (calls, window seconds).
fn default_quota(provider: Provider) -> (u32, u64) {
    match provider {
        // Meta standard access: 200 calls per hour per user
        Provider::Meta => (200, 3_600),
        // Google Ads basic access: 15,000 operations per day
        Provider::GoogleAds => (15_000, 86_400),
    }
}

impl ProvidersConfig {
    pub fn settings(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Meta => &self.meta,
            Provider::GoogleAds => &self.google_ads,
        }
    }

    fn settings_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::Meta => &mut self.meta,
            Provider::GoogleAds => &mut self.google_ads,
        }
    }

    /// Provider endpoints with configured overrides applied.
    pub fn endpoints(&self, provider: Provider) -> ProviderEndpoints {
        let settings = self.settings(provider);
        let mut endpoints = provider.default_endpoints();
        if let Some(url) = &settings.authorize_url {
            endpoints.authorize_url = url.clone();
        }
        if let Some(url) = &settings.token_url {
            endpoints.token_url = url.clone();
        }
        if let Some(url) = &settings.api_base_url {
            endpoints.api_base_url = url.clone();
        }
        if let Some(scopes) = &settings.scopes {
            endpoints.scopes = scopes.clone();
        }
        endpoints
    }

    /// (capacity, window) for the provider's rate-limit window.
    pub fn quota(&self, provider: Provider) -> (u32, Duration) {
        let settings = self.settings(provider);
        let (default_capacity, default_window) = default_quota(provider);
        (
            settings.quota_capacity.unwrap_or(default_capacity).max(1),
            Duration::from_secs(settings.quota_window_seconds.unwrap_or(default_window).max(1)),
        )
    }
}

impl GatewayConfig {
    /// Apply `ADGATE_*` environment overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ADGATE_BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Ok(v) = std::env::var("ADGATE_PUBLIC_BASE_URL") {
            self.server.public_base_url = v;
        }
        if let Ok(v) = std::env::var("ADGATE_UI_REDIRECT_URL") {
            self.server.ui_redirect_url = v;
        }
        if let Ok(v) = std::env::var("ADGATE_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Ok(v) = std::env::var("ADGATE_RATE_LIMIT_SCOPE") {
            match v.parse() {
                Ok(scope) => self.rate_limit.scope = scope,
                Err(e) => tracing::warn!(error = %e, "Ignoring ADGATE_RATE_LIMIT_SCOPE"),
            }
        }
        if let Ok(v) = std::env::var("ADGATE_PROVIDER_CLIENT") {
            match v.as_str() {
                "http" => self.gateway.client = ClientMode::Http,
                "fake" => self.gateway.client = ClientMode::Fake,
                other => tracing::warn!(value = %other, "Ignoring ADGATE_PROVIDER_CLIENT"),
            }
        }

        for provider in Provider::ALL {
            let prefix = format!("ADGATE_{}", provider.as_str().to_uppercase());
            let settings = self.providers.settings_mut(provider);
            if let Ok(v) = std::env::var(format!("{}_CLIENT_ID", prefix)) {
                settings.client_id = v;
            }
            if let Ok(v) = std::env::var(format!("{}_CLIENT_SECRET", prefix)) {
                settings.client_secret = v;
            }
            if let Ok(v) = std::env::var(format!("{}_WEBHOOK_SECRET", prefix)) {
                settings.webhook_secret = v;
            }
            if let Ok(v) = std::env::var(format!("{}_DEVELOPER_TOKEN", prefix)) {
                settings.developer_token = Some(v);
            }
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<GatewayConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<GatewayConfig> {
    toml::from_str(contents).context("Failed to parse config")
}
