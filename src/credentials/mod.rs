//! Encrypted credential records for provider OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenManager                       │
//! │  - lifecycle: store/refresh/revoke       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Vault                              │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per token                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (SQLite)           │
//! │  - Ciphertext only                       │
//! │  - One active record per org/provider    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - The store never sees plaintext tokens
//! - Superseded and revoked records have their ciphertext cleared
//! - The master key lives in memory only

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

mod encryption;
mod storage;

pub use encryption::{validate_key, Vault, VaultError};
pub use storage::CredentialStore;

use crate::provider::Provider;

/// Identifies the credential slot of one organization at one provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub organization_id: String,
    pub provider: Provider,
}

impl CredentialKey {
    pub fn new(organization_id: &str, provider: Provider) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            provider,
        }
    }
}

/// Persisted credential record. Token fields hold vault ciphertext.
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    pub id: i64,
    pub organization_id: String,
    pub provider: Provider,
    pub access_token_ciphertext: Option<String>,
    pub refresh_token_ciphertext: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    pub ad_account_id: Option<String>,
    pub business_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// The provider account this credential is bound to, if known.
    pub fn account_id(&self) -> Option<&str> {
        self.ad_account_id
            .as_deref()
            .or(self.business_id.as_deref())
    }
}

/// Values for a record about to be inserted as the active one.
#[derive(Clone, Debug)]
pub struct NewCredential {
    pub organization_id: String,
    pub provider: Provider,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    pub ad_account_id: Option<String>,
    pub business_id: Option<String>,
}

/// Token-free view of a connection, safe to return to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub organization_id: String,
    pub provider: Provider,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl From<&CredentialRecord> for ConnectionSummary {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            organization_id: record.organization_id.clone(),
            provider: record.provider,
            expires_at: record.expires_at,
            scopes: record.scopes.clone(),
            account_id: record.account_id().map(str::to_string),
        }
    }
}
