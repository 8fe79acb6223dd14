//! Integration endpoints used by the application UI.
//!
//! Every route except the OAuth callback requires the `X-Organization-Id`
//! header. The callback is reached through a browser redirect from the
//! provider, so the organization comes from the consumed state instead.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{AppError, AppState};
use crate::error::GatewayError;
use crate::gateway::ApiResponse;
use crate::identity::extract_organization_id;
use crate::provider::{ApiRequest, Provider};
use crate::token::ConnectionStatus;

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InsightsQuery {
    since: Option<String>,
    until: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStartResponse {
    authorization_url: String,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    disconnected: bool,
}

/// Create integrations API router
pub fn create_integrations_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/integrations/:provider/auth/start", post(auth_start))
        .route("/integrations/:provider/auth/callback", get(auth_callback))
        .route("/integrations/:provider/status", get(connection_status))
        .route("/integrations/:provider/disconnect", post(disconnect))
        .route("/integrations/:provider/ad-accounts", get(list_ad_accounts))
        .route(
            "/integrations/:provider/accounts/:account_id/campaigns",
            get(list_campaigns),
        )
        .route(
            "/integrations/:provider/accounts/:account_id/insights",
            get(get_insights),
        )
        .with_state(state)
}

fn parse_provider(value: &str) -> Result<Provider, AppError> {
    value.parse::<Provider>().map_err(AppError::from)
}

/// POST /integrations/:provider/auth/start
async fn auth_start(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AuthStartResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    let authorization_url = state.oauth.start_authorization(&organization_id, provider)?;
    Ok(Json(AuthStartResponse { authorization_url }))
}

/// GET /integrations/:provider/auth/callback
///
/// Always answers with a 303 back to the UI; the outcome travels in the
/// `status` and `reason` query parameters.
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Redirect, AppError> {
    let provider = parse_provider(&provider)?;
    debug!(provider = %provider, "OAuth callback received");

    if let Some(error) = callback.error {
        let reason = provider_error_reason(&error);
        warn!(provider = %provider, reason, "Authorization declined by provider");
        return Ok(state.ui_redirect(provider, Err(reason)));
    }

    let (Some(code), Some(csrf_state)) = (callback.code, callback.state) else {
        warn!(provider = %provider, "OAuth callback missing code or state");
        return Ok(state.ui_redirect(provider, Err("invalid_request")));
    };

    match state.oauth.handle_callback(provider, &code, &csrf_state).await {
        Ok(summary) => {
            info!(
                organization_id = %summary.organization_id,
                provider = %provider,
                "OAuth callback completed"
            );
            Ok(state.ui_redirect(provider, Ok(())))
        }
        Err(e) => Ok(state.ui_redirect(provider, Err(callback_failure_reason(&e)))),
    }
}

/// GET /integrations/:provider/status
async fn connection_status(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ConnectionStatus>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    Ok(Json(state.tokens.status(&organization_id, provider)?))
}

/// POST /integrations/:provider/disconnect
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    let disconnected = state.tokens.revoke(&organization_id, provider)?;
    Ok(Json(DisconnectResponse { disconnected }))
}

/// GET /integrations/:provider/ad-accounts
async fn list_ad_accounts(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    let response = state
        .gateway
        .call(&organization_id, provider, &ApiRequest::ListAdAccounts)
        .await?;
    Ok(Json(response))
}

/// GET /integrations/:provider/accounts/:account_id/campaigns
async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Path((provider, account_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    let response = state
        .gateway
        .call(
            &organization_id,
            provider,
            &ApiRequest::ListCampaigns { account_id },
        )
        .await?;
    Ok(Json(response))
}

/// GET /integrations/:provider/accounts/:account_id/insights?since=&until=
async fn get_insights(
    State(state): State<Arc<AppState>>,
    Path((provider, account_id)): Path<(String, String)>,
    Query(query): Query<InsightsQuery>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let organization_id = extract_organization_id(&headers)?;

    let (Some(since), Some(until)) = (query.since, query.until) else {
        return Err(AppError::BadRequest(
            "'since' and 'until' query parameters are required".to_string(),
        ));
    };

    let request = ApiRequest::GetInsights {
        account_id,
        since,
        until,
    };
    let response = state.gateway.call(&organization_id, provider, &request).await?;
    Ok(Json(response))
}

/// Reason code passed back to the UI for a failed callback.
fn callback_failure_reason(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::InvalidState => "invalid_state",
        GatewayError::InvalidRequest(_) => "invalid_request",
        GatewayError::AuthenticationRequired { .. } => "authorization_rejected",
        GatewayError::NotConfigured { .. } => "not_configured",
        e if e.is_transient() => "provider_unavailable",
        _ => "connection_failed",
    }
}

/// Provider-sent `error` values are echoed only when they are one of the
/// standard OAuth error codes.
fn provider_error_reason(error: &str) -> &'static str {
    match error {
        "access_denied" => "access_denied",
        "invalid_scope" => "invalid_scope",
        "server_error" | "temporarily_unavailable" => "provider_unavailable",
        _ => "authorization_failed",
    }
}
