//! Ad-platform providers and the client seam the gateway talks through.
//!
//! The gateway never speaks HTTP itself. It depends on [`ProviderClient`],
//! which has two implementations:
//!
//! - [`HttpProviderClient`] - real reqwest client against Meta Graph API and
//!   Google Ads REST
//! - [`FakeProviderClient`] - deterministic in-process provider, scripted per
//!   call, used for local development and tests
//!
//! Which one is wired in is decided once in `main` from configuration.

mod fake;
mod http;
pub mod usage;

pub use fake::FakeProviderClient;
pub use http::HttpProviderClient;
pub use usage::{ProviderUsage, MAX_RETRY_HINT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::GatewayError;

/// Supported ad platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Meta,
    GoogleAds,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Meta, Provider::GoogleAds];

    /// Stable identifier used in URLs, the database and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Meta => "meta",
            Provider::GoogleAds => "google_ads",
        }
    }

    /// Default OAuth and API endpoints for this provider.
    pub fn default_endpoints(&self) -> ProviderEndpoints {
        match self {
            Provider::Meta => ProviderEndpoints {
                authorize_url: "https://www.facebook.com/v19.0/dialog/oauth".to_string(),
                token_url: "https://graph.facebook.com/v19.0/oauth/access_token".to_string(),
                api_base_url: "https://graph.facebook.com/v19.0".to_string(),
                scopes: vec![
                    "ads_read".to_string(),
                    "ads_management".to_string(),
                    "business_management".to_string(),
                ],
            },
            Provider::GoogleAds => ProviderEndpoints {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                api_base_url: "https://googleads.googleapis.com/v16".to_string(),
                scopes: vec!["https://www.googleapis.com/auth/adwords".to_string()],
            },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta" => Ok(Provider::Meta),
            "google_ads" | "google-ads" => Ok(Provider::GoogleAds),
            other => Err(GatewayError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// OAuth and API endpoints for one provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub scopes: Vec<String>,
}

/// Token grant returned by a provider token endpoint.
///
/// Holds plaintext tokens; only ever lives in memory on the way to the vault.
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds as reported by the provider.
    pub expires_in: Option<i64>,
    /// Granted scopes, when the provider reports them.
    pub scopes: Vec<String>,
    pub ad_account_id: Option<String>,
    pub business_id: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Data requests the gateway knows how to issue and validate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ApiRequest {
    ListAdAccounts,
    ListCampaigns {
        account_id: String,
    },
    GetInsights {
        account_id: String,
        /// Inclusive start date, `YYYY-MM-DD`
        since: String,
        /// Inclusive end date, `YYYY-MM-DD`
        until: String,
    },
}

impl ApiRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            ApiRequest::ListAdAccounts => "list_ad_accounts",
            ApiRequest::ListCampaigns { .. } => "list_campaigns",
            ApiRequest::GetInsights { .. } => "get_insights",
        }
    }

    /// Rejects identifiers that could escape their URL path segment and
    /// malformed date ranges before anything is sent.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match self {
            ApiRequest::ListAdAccounts => Ok(()),
            ApiRequest::ListCampaigns { account_id } => validate_account_id(account_id),
            ApiRequest::GetInsights {
                account_id,
                since,
                until,
            } => {
                validate_account_id(account_id)?;
                let since = parse_date(since)?;
                let until = parse_date(until)?;
                if since > until {
                    return Err(GatewayError::InvalidRequest(
                        "'since' must not be after 'until'".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_account_id(account_id: &str) -> Result<(), GatewayError> {
    let valid = !account_id.is_empty()
        && account_id.len() <= 64
        && account_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!(
            "invalid account id '{}'",
            account_id.escape_default()
        )))
    }
}

fn parse_date(value: &str) -> Result<chrono::NaiveDate, GatewayError> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| GatewayError::InvalidRequest(format!("invalid date '{}'", value.escape_default())))
}

/// Raw provider response before classification.
///
/// Header names are lowercased.
#[derive(Clone, Debug, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure to get any HTTP response at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Token endpoint failures, split by whether re-authorization is needed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenEndpointError {
    /// The grant (code or refresh token) is invalid, expired or revoked.
    #[error("grant rejected by provider: {0}")]
    InvalidGrant(String),
    /// Network failure, timeout, 5xx or throttling at the token endpoint.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),
    /// The token endpoint answered 2xx with an unusable body.
    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// Outbound interface to an ad platform.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Exchanges an authorization code for tokens (`authorization_code` grant).
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError>;

    /// Obtains a fresh access token from a refresh credential.
    async fn refresh_token(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, TokenEndpointError>;

    /// Executes a data request with the given access token.
    async fn execute(
        &self,
        provider: Provider,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<RawResponse, TransportError>;
}
