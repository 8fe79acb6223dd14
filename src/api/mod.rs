//! HTTP API
//!
//! Routers for the integration endpoints used by the application UI and the
//! provider webhooks, plus a health check.

mod error;
pub mod integrations;
pub mod webhooks;

pub use error::AppError;
pub use integrations::create_integrations_router;
pub use webhooks::create_webhook_router;

use axum::{
    http::{header, Method},
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::GatewayConfig;
use crate::credentials::{CredentialStore, Vault};
use crate::gateway::ProviderGateway;
use crate::identity::ORGANIZATION_HEADER;
use crate::oauth::{OAuthFlowController, StateManager};
use crate::provider::{Provider, ProviderClient};
use crate::rate_limit::RateLimiter;
use crate::token::TokenManager;
use crate::webhook::DeauthorizationHandler;

/// Shared application state for all routers
pub struct AppState {
    pub oauth: OAuthFlowController,
    pub tokens: TokenManager,
    pub gateway: ProviderGateway,
    pub deauthorization: DeauthorizationHandler,
    pub ui_redirect_url: String,
}

impl AppState {
    /// Wire every component from configuration around one credential store
    /// and one provider client.
    pub fn new(
        config: &GatewayConfig,
        store: Arc<CredentialStore>,
        vault: Vault,
        client: Arc<dyn ProviderClient>,
    ) -> Self {
        let tokens = TokenManager::new(store, vault, client.clone(), config.token.clone());
        let limiter = Arc::new(RateLimiter::from_config(
            &config.rate_limit,
            &config.providers,
        ));
        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));

        let gateway = ProviderGateway::new(
            tokens.clone(),
            limiter,
            breaker,
            client.clone(),
            config.gateway.clone(),
            &config.rate_limit,
        );
        let oauth = OAuthFlowController::new(
            StateManager::new(config.oauth.state_ttl_seconds),
            tokens.clone(),
            client,
            config.providers.clone(),
            &config.server.public_base_url,
        );
        let deauthorization = DeauthorizationHandler::new(tokens.clone(), config.providers.clone());

        Self {
            oauth,
            tokens,
            gateway,
            deauthorization,
            ui_redirect_url: config.server.ui_redirect_url.clone(),
        }
    }

    /// 303 back to the UI with the outcome of an OAuth callback.
    pub(crate) fn ui_redirect(&self, provider: Provider, outcome: Result<(), &str>) -> Redirect {
        let separator = if self.ui_redirect_url.contains('?') { '&' } else { '?' };
        let query = match outcome {
            Ok(()) => format!("status=connected&provider={}", provider),
            Err(reason) => format!(
                "status=error&provider={}&reason={}",
                provider,
                urlencoding::encode(reason)
            ),
        };
        Redirect::to(&format!("{}{}{}", self.ui_redirect_url, separator, query))
    }
}

/// Create the full API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(ORGANIZATION_HEADER)]);

    Router::new()
        .route("/health", get(health))
        .merge(create_integrations_router(state.clone()))
        .merge(create_webhook_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
