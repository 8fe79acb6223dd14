//! Signed deauthorization webhooks.
//!
//! Providers notify us when a user removes the app. The notification is only
//! trusted after its HMAC-SHA256 signature (`X-Hub-Signature-256: sha256=<hex>`)
//! verifies against the provider's webhook secret. The payload is not parsed
//! before that.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProvidersConfig;
use crate::error::GatewayError;
use crate::provider::Provider;
use crate::token::TokenManager;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    /// Missing, malformed or non-matching signature, or no secret configured.
    #[error("invalid webhook signature")]
    InvalidSignature,
    /// Signature verified but the body is not a deauthorization notice.
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

impl From<SecurityError> for GatewayError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::InvalidSignature => GatewayError::InvalidSignature,
            SecurityError::MalformedPayload(detail) => GatewayError::InvalidRequest(detail),
        }
    }
}

/// Verified deauthorization request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeauthorizationNotice {
    /// Organization whose connection must be dropped. Meta calls this `user_id`.
    #[serde(alias = "user_id")]
    pub organization_id: String,
    #[serde(default)]
    pub issued_at: Option<i64>,
}

/// Verifies `signature_header` over the raw `payload` and decodes it.
///
/// Pure function: no I/O, no side effects.
pub fn verify_deauthorization(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<DeauthorizationNotice, SecurityError> {
    if secret.is_empty() {
        return Err(SecurityError::InvalidSignature);
    }

    let provided = signature_header
        .map(str::trim)
        .and_then(|header| header.strip_prefix(SIGNATURE_PREFIX))
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(SecurityError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SecurityError::InvalidSignature)?;
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if !bool::from(expected.as_slice().ct_eq(&provided)) {
        return Err(SecurityError::InvalidSignature);
    }

    let notice: DeauthorizationNotice = serde_json::from_slice(payload)
        .map_err(|e| SecurityError::MalformedPayload(e.to_string()))?;
    if notice.organization_id.trim().is_empty() {
        return Err(SecurityError::MalformedPayload(
            "empty organization id".to_string(),
        ));
    }
    Ok(notice)
}

/// `sha256=<hex>` signature for `payload`, as a provider would send it.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

pub struct DeauthorizationHandler {
    tokens: TokenManager,
    providers: ProvidersConfig,
}

impl DeauthorizationHandler {
    pub fn new(tokens: TokenManager, providers: ProvidersConfig) -> Self {
        Self { tokens, providers }
    }

    /// Revokes the organization's credential if, and only if, the signature
    /// verifies. Returns whether a credential was revoked.
    pub fn handle(
        &self,
        provider: Provider,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let secret = &self.providers.settings(provider).webhook_secret;
        let notice = verify_deauthorization(payload, signature_header, secret).map_err(|e| {
            warn!(provider = %provider, error = %e, "Rejected deauthorization webhook");
            e
        })?;

        let revoked = self.tokens.revoke(&notice.organization_id, provider)?;
        info!(
            organization_id = %notice.organization_id,
            provider = %provider,
            revoked,
            "Deauthorization processed"
        );
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderSettings, TokenConfig};
    use crate::credentials::{CredentialStore, Vault};
    use crate::provider::{FakeProviderClient, TokenGrant};
    use std::sync::Arc;

    const SECRET: &str = "webhook-secret";
    const PAYLOAD: &[u8] = br#"{"organization_id":"org-1","issued_at":1700000000}"#;

    fn handler() -> (DeauthorizationHandler, TokenManager) {
        let tokens = TokenManager::new(
            Arc::new(CredentialStore::new(":memory:").unwrap()),
            Vault::from_key_bytes(&[5u8; 32]).unwrap(),
            Arc::new(FakeProviderClient::new()),
            TokenConfig::default(),
        );
        tokens
            .store(
                "org-1",
                Provider::Meta,
                &TokenGrant {
                    access_token: "EAAtoken".to_string(),
                    refresh_token: None,
                    expires_in: Some(3600),
                    scopes: vec![],
                    ad_account_id: None,
                    business_id: None,
                },
            )
            .unwrap();

        let providers = ProvidersConfig {
            meta: ProviderSettings {
                webhook_secret: SECRET.to_string(),
                ..Default::default()
            },
            google_ads: ProviderSettings::default(),
        };
        (DeauthorizationHandler::new(tokens.clone(), providers), tokens)
    }

    #[test]
    fn test_valid_signature_verifies() {
        let signature = sign_payload(PAYLOAD, SECRET);
        let notice = verify_deauthorization(PAYLOAD, Some(&signature), SECRET).unwrap();
        assert_eq!(notice.organization_id, "org-1");
        assert_eq!(notice.issued_at, Some(1_700_000_000));
    }

    #[test]
    fn test_meta_user_id_alias() {
        let payload = br#"{"user_id":"org-9"}"#;
        let signature = sign_payload(payload, SECRET);
        let notice = verify_deauthorization(payload, Some(&signature), SECRET).unwrap();
        assert_eq!(notice.organization_id, "org-9");
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign_payload(b"The quick brown fox jumps over the lazy dog", "key");
        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let valid = sign_payload(PAYLOAD, SECRET);
        let wrong_secret = sign_payload(PAYLOAD, "other-secret");
        let tampered: &[u8] = br#"{"organization_id":"org-2","issued_at":1700000000}"#;
        let bare_hex = valid.trim_start_matches(SIGNATURE_PREFIX).to_string();

        let cases: Vec<(&[u8], Option<&str>, &str)> = vec![
            (PAYLOAD, None, SECRET),
            (PAYLOAD, Some(""), SECRET),
            (PAYLOAD, Some("sha256=zz"), SECRET),
            (PAYLOAD, Some("sha256="), SECRET),
            (PAYLOAD, Some(bare_hex.as_str()), SECRET),
            (PAYLOAD, Some(wrong_secret.as_str()), SECRET),
            (tampered, Some(valid.as_str()), SECRET),
            (PAYLOAD, Some(valid.as_str()), ""),
        ];

        for (payload, header, secret) in cases {
            assert_eq!(
                verify_deauthorization(payload, header, secret),
                Err(SecurityError::InvalidSignature),
                "accepted header {:?}",
                header
            );
        }
    }

    #[test]
    fn test_malformed_payload_after_valid_signature() {
        let payload = b"not json";
        let signature = sign_payload(payload, SECRET);
        assert!(matches!(
            verify_deauthorization(payload, Some(&signature), SECRET),
            Err(SecurityError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_handler_revokes_on_valid_signature() {
        let (handler, tokens) = handler();
        let signature = sign_payload(PAYLOAD, SECRET);

        assert!(handler.handle(Provider::Meta, PAYLOAD, Some(&signature)).unwrap());
        assert!(!tokens.status("org-1", Provider::Meta).unwrap().connected);

        // Duplicate deliveries are harmless
        assert!(!handler.handle(Provider::Meta, PAYLOAD, Some(&signature)).unwrap());
    }

    #[test]
    fn test_handler_never_revokes_on_bad_signature() {
        let (handler, tokens) = handler();
        let forged = sign_payload(PAYLOAD, "attacker-secret");

        let err = handler
            .handle(Provider::Meta, PAYLOAD, Some(&forged))
            .unwrap_err();
        assert_eq!(err, GatewayError::InvalidSignature);
        assert!(tokens.status("org-1", Provider::Meta).unwrap().connected);
    }

    #[test]
    fn test_handler_fails_closed_without_secret() {
        let (handler, _) = handler();
        // No webhook secret configured for Google Ads
        let signature = sign_payload(PAYLOAD, "");
        assert_eq!(
            handler.handle(Provider::GoogleAds, PAYLOAD, Some(&signature)),
            Err(GatewayError::InvalidSignature)
        );
    }
}
