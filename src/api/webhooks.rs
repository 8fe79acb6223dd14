//! Provider webhook endpoints.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use serde::Serialize;
use std::sync::Arc;

use super::{AppError, AppState};
use crate::provider::Provider;
use crate::webhook::SIGNATURE_HEADER;

#[derive(Serialize)]
pub struct DeauthorizeResponse {
    received: bool,
    revoked: bool,
}

/// Create webhook router
pub fn create_webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/:provider/deauthorize", post(deauthorize))
        .with_state(state)
}

/// POST /webhooks/:provider/deauthorize
///
/// The body is read as raw bytes; the signature covers them exactly.
async fn deauthorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DeauthorizeResponse>, AppError> {
    let provider: Provider = provider.parse()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let revoked = state
        .deauthorization
        .handle(provider, &body, signature)?;

    Ok(Json(DeauthorizeResponse {
        received: true,
        revoked,
    }))
}
