//! reqwest-backed provider client.
//!
//! Handles token exchange/refresh against provider token endpoints and maps
//! [`ApiRequest`]s onto Meta Graph API and Google Ads REST calls. Errors are
//! reduced to [`TransportError`] / [`TokenEndpointError`] here; reqwest types
//! never leave this module.

use super::{
    ApiRequest, Provider, ProviderClient, RawResponse, TokenEndpointError, TokenGrant,
    TransportError,
};
use crate::config::ProvidersConfig;
use crate::sanitize::sanitize_message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space-separated granted scopes (Google)
    #[serde(default)]
    scope: Option<String>,
}

/// Meta OAuthException error codes that signal a temporary condition.
const META_TRANSIENT_CODES: [i64; 5] = [1, 2, 4, 17, 341];

pub struct HttpProviderClient {
    http: reqwest::Client,
    providers: ProvidersConfig,
}

impl HttpProviderClient {
    pub fn new(providers: ProvidersConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, providers })
    }

    async fn post_token_form(
        &self,
        provider: Provider,
        form: HashMap<&str, &str>,
    ) -> Result<TokenGrant, TokenEndpointError> {
        let token_url = self.providers.endpoints(provider).token_url;
        debug!(provider = %provider, grant_type = form.get("grant_type").copied().unwrap_or(""), "Calling token endpoint");

        let response = self
            .http
            .post(&token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Unavailable(transport_error(e).to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Unavailable(transport_error(e).to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_token_error(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| TokenEndpointError::Malformed(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(TokenEndpointError::Malformed(
                "empty access_token".to_string(),
            ));
        }

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_in: token.expires_in,
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            ad_account_id: None,
            business_id: None,
        })
    }

    fn build_request(
        &self,
        provider: Provider,
        access_token: &str,
        request: &ApiRequest,
    ) -> reqwest::RequestBuilder {
        let base = self.providers.endpoints(provider).api_base_url;
        let builder = match provider {
            Provider::Meta => self.meta_request(&base, request),
            Provider::GoogleAds => self.google_request(&base, request),
        };
        builder
            .bearer_auth(access_token)
            .header("Accept", "application/json")
    }

    fn meta_request(&self, base: &str, request: &ApiRequest) -> reqwest::RequestBuilder {
        match request {
            ApiRequest::ListAdAccounts => self
                .http
                .get(format!("{}/me/adaccounts", base))
                .query(&[("fields", "id,name,account_status,currency")]),
            ApiRequest::ListCampaigns { account_id } => self
                .http
                .get(format!("{}/{}/campaigns", base, meta_account(account_id)))
                .query(&[("fields", "id,name,status,objective")]),
            ApiRequest::GetInsights {
                account_id,
                since,
                until,
            } => {
                let time_range = json!({ "since": since, "until": until }).to_string();
                self.http
                    .get(format!("{}/{}/insights", base, meta_account(account_id)))
                    .query(&[
                        ("fields", "spend,impressions,clicks,date_start,date_stop"),
                        ("time_increment", "1"),
                        ("time_range", time_range.as_str()),
                    ])
            }
        }
    }

    fn google_request(&self, base: &str, request: &ApiRequest) -> reqwest::RequestBuilder {
        let settings = self.providers.settings(Provider::GoogleAds);
        let builder = match request {
            ApiRequest::ListAdAccounts => self
                .http
                .get(format!("{}/customers:listAccessibleCustomers", base)),
            ApiRequest::ListCampaigns { account_id } => self
                .http
                .post(format!("{}/customers/{}/googleAds:search", base, account_id))
                .json(&json!({
                    "query": "SELECT campaign.id, campaign.name, campaign.status FROM campaign"
                })),
            ApiRequest::GetInsights {
                account_id,
                since,
                until,
            } => self
                .http
                .post(format!("{}/customers/{}/googleAds:search", base, account_id))
                .json(&json!({
                    "query": format!(
                        "SELECT segments.date, metrics.cost_micros, metrics.impressions, metrics.clicks \
                         FROM customer WHERE segments.date BETWEEN '{}' AND '{}'",
                        since, until
                    )
                })),
        };

        let builder = match &settings.developer_token {
            Some(token) => builder.header("developer-token", token),
            None => builder,
        };
        match &settings.login_customer_id {
            Some(id) => builder.header("login-customer-id", id),
            None => builder,
        }
    }
}

/// Meta ad account ids are addressed as `act_<id>`.
fn meta_account(account_id: &str) -> String {
    if account_id.starts_with("act_") {
        account_id.to_string()
    } else {
        format!("act_{}", account_id)
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(sanitize_message(&err.to_string()))
    } else {
        TransportError::Other(sanitize_message(&err.to_string()))
    }
}

/// Splits token endpoint failures into "re-authorize" and "try later".
fn classify_token_error(status: u16, body: &str) -> TokenEndpointError {
    let detail = format!("status {}: {}", status, sanitize_message(body));

    if status == 429 || status >= 500 {
        return TokenEndpointError::Unavailable(detail);
    }

    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let meta_code = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64);
    if meta_code.is_some_and(|code| META_TRANSIENT_CODES.contains(&code)) {
        return TokenEndpointError::Unavailable(detail);
    }

    let google_error = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str);
    if google_error == Some("temporarily_unavailable") {
        return TokenEndpointError::Unavailable(detail);
    }

    TokenEndpointError::InvalidGrant(detail)
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        let settings = self.providers.settings(provider);
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", settings.client_id.as_str());
        form.insert("client_secret", settings.client_secret.as_str());

        self.post_token_form(provider, form).await
    }

    async fn refresh_token(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        let settings = self.providers.settings(provider);
        let mut form = HashMap::new();
        match provider {
            // Meta has no refresh tokens; long-lived tokens are re-exchanged.
            Provider::Meta => {
                form.insert("grant_type", "fb_exchange_token");
                form.insert("fb_exchange_token", refresh_token);
            }
            Provider::GoogleAds => {
                form.insert("grant_type", "refresh_token");
                form.insert("refresh_token", refresh_token);
            }
        }
        form.insert("client_id", settings.client_id.as_str());
        form.insert("client_secret", settings.client_secret.as_str());

        self.post_token_form(provider, form).await
    }

    async fn execute(
        &self,
        provider: Provider,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<RawResponse, TransportError> {
        debug!(provider = %provider, operation = request.operation(), "Sending provider request");

        let response = self
            .build_request(provider, access_token, request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(transport_error)?.to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
