//! OAuth 2.0 authorization code flow for ad-platform connections.
//!
//! 1. UI calls `POST /integrations/:provider/auth/start`
//! 2. [`OAuthFlowController::start_authorization`] issues a single-use state
//!    and returns the provider's consent URL
//! 3. The user authorizes on the provider's site
//! 4. Provider redirects to `/integrations/:provider/auth/callback`
//! 5. [`OAuthFlowController::handle_callback`] consumes the state, exchanges the
//!    code and stores the encrypted credential through the token manager

mod state_manager;

pub use state_manager::{run_purge_loop, PendingAuthorization, StateManager};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ProvidersConfig;
use crate::credentials::ConnectionSummary;
use crate::error::GatewayError;
use crate::provider::{Provider, ProviderClient, TokenEndpointError};
use crate::sanitize::sanitize_message;
use crate::token::TokenManager;

pub struct OAuthFlowController {
    states: StateManager,
    tokens: TokenManager,
    client: Arc<dyn ProviderClient>,
    providers: ProvidersConfig,
    public_base_url: String,
}

impl OAuthFlowController {
    pub fn new(
        states: StateManager,
        tokens: TokenManager,
        client: Arc<dyn ProviderClient>,
        providers: ProvidersConfig,
        public_base_url: &str,
    ) -> Self {
        Self {
            states,
            tokens,
            client,
            providers,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    /// Callback URL registered with the provider (must match between start
    /// and exchange).
    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!(
            "{}/integrations/{}/auth/callback",
            self.public_base_url, provider
        )
    }

    /// Builds the provider consent URL for `organization_id`.
    pub fn start_authorization(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<String, GatewayError> {
        let settings = self.providers.settings(provider);
        if settings.client_id.is_empty() {
            error!(provider = %provider, "OAuth client id not configured");
            return Err(GatewayError::NotConfigured { provider });
        }

        let state = self.states.issue(organization_id, provider);
        let url = build_authorization_url(
            provider,
            &self.providers.endpoints(provider).authorize_url,
            &self.providers.endpoints(provider).scopes,
            &settings.client_id,
            &self.redirect_uri(provider),
            &state,
        );

        info!(
            organization_id = %organization_id,
            provider = %provider,
            "Authorization started"
        );
        Ok(url)
    }

    /// Completes the flow for a provider redirect.
    ///
    /// The state is consumed before anything else; an unknown, expired, reused
    /// or foreign state fails with `InvalidState` and no code exchange happens.
    pub async fn handle_callback(
        &self,
        provider: Provider,
        code: &str,
        state: &str,
    ) -> Result<ConnectionSummary, GatewayError> {
        let entry = self.states.take(state).ok_or_else(|| {
            warn!(provider = %provider, "Invalid or expired OAuth state");
            GatewayError::InvalidState
        })?;

        if entry.provider != provider {
            warn!(
                expected = %entry.provider,
                actual = %provider,
                "OAuth state issued for a different provider"
            );
            return Err(GatewayError::InvalidState);
        }
        if code.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "missing authorization code".to_string(),
            ));
        }

        let organization_id = entry.organization_id;
        debug!(
            organization_id = %organization_id,
            provider = %provider,
            "Exchanging authorization code"
        );

        let grant = self
            .client
            .exchange_code(provider, code, &self.redirect_uri(provider))
            .await
            .map_err(|e| {
                error!(
                    organization_id = %organization_id,
                    provider = %provider,
                    error = %sanitize_message(&e.to_string()),
                    "Code exchange failed"
                );
                match e {
                    TokenEndpointError::InvalidGrant(_) => {
                        GatewayError::auth_required(provider, "authorization code rejected")
                    }
                    TokenEndpointError::Unavailable(detail) => {
                        GatewayError::Transient(sanitize_message(&detail))
                    }
                    TokenEndpointError::Malformed(detail) => {
                        GatewayError::InvalidResponse(sanitize_message(&detail))
                    }
                }
            })?;

        let record = self.tokens.store(&organization_id, provider, &grant)?;

        info!(
            organization_id = %organization_id,
            provider = %provider,
            has_refresh_token = grant.refresh_token.is_some(),
            "Provider connected"
        );
        Ok(ConnectionSummary::from(&record))
    }
}

/// Build authorization URL with state and redirect_uri
fn build_authorization_url(
    provider: Provider,
    authorize_url: &str,
    scopes: &[String],
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> String {
    // Meta accepts comma-separated scopes, Google space-separated
    let scopes = match provider {
        Provider::Meta => scopes.join(","),
        Provider::GoogleAds => scopes.join(" "),
    };
    let mut url = format!(
        "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
        authorize_url,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(state)
    );
    if provider == Provider::GoogleAds {
        // Offline access is what yields a refresh token
        url.push_str("&access_type=offline&prompt=consent");
    }
    url
}
