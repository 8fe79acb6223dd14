//! Token lifecycle: store, hand out, refresh and revoke provider credentials.
//!
//! Refreshes are single-flight per (organization, provider). The first caller
//! that needs a refresh spawns it as a task; everyone else awaits the same
//! shared result. Waiters can be dropped or time out without cancelling the
//! refresh itself, so a slow token endpoint never leaves a half-written record.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::TokenConfig;
use crate::credentials::{
    CredentialKey, CredentialRecord, CredentialStore, NewCredential, Vault,
};
use crate::error::GatewayError;
use crate::provider::{Provider, ProviderClient, TokenEndpointError, TokenGrant};
use crate::sanitize::sanitize_message;

/// Decrypted access token handed to the gateway for one call.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Connection state reported to the UI. Never carries token material.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
    pub account_id: Option<String>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            connected: false,
            expires_at: None,
            scopes: BTreeSet::new(),
            account_id: None,
        }
    }
}

/// Why a refresh was requested. Decides whether the refresh can be skipped
/// because someone else already replaced the token.
#[derive(Clone, Debug)]
enum RefreshTrigger {
    /// Token is inside the refresh skew.
    Expiring,
    /// Provider rejected this access token.
    Rejected(String),
    /// Explicit refresh request.
    Forced,
}

type RefreshResult = Result<AccessToken, GatewayError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// A running refresh. The entry lives exactly as long as its task.
struct InFlight {
    generation: u64,
    refresh: SharedRefresh,
}

/// Removes the in-flight entry when the refresh task ends, including by
/// panic, so a finished result is never handed to a later caller.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: CredentialKey,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .remove_if(&self.key, |_, entry| entry.generation == self.generation);
    }
}

struct Inner {
    store: Arc<CredentialStore>,
    vault: Vault,
    client: Arc<dyn ProviderClient>,
    config: TokenConfig,
    in_flight: DashMap<CredentialKey, InFlight>,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<CredentialStore>,
        vault: Vault,
        client: Arc<dyn ProviderClient>,
        config: TokenConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                vault,
                client,
                config,
                in_flight: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a usable access token, refreshing first if it is about to expire.
    pub async fn get_valid_token(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<AccessToken, GatewayError> {
        let record = self.inner.active_record(organization_id, provider)?;
        if !self.inner.needs_refresh(&record) {
            return self.inner.decrypt_access(&record);
        }

        debug!(
            organization_id = %organization_id,
            provider = %provider,
            expires_at = %record.expires_at,
            "Access token expiring, refreshing"
        );
        self.join_refresh(CredentialKey::new(organization_id, provider), RefreshTrigger::Expiring)
            .await
    }

    /// Refreshes the credential now, joining a refresh already in flight.
    pub async fn refresh(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<AccessToken, GatewayError> {
        self.join_refresh(CredentialKey::new(organization_id, provider), RefreshTrigger::Forced)
            .await
    }

    /// Refresh after the provider answered 401 for `rejected`.
    ///
    /// Returns the current token without a network call if it already differs
    /// from the rejected one.
    pub async fn refresh_after_rejection(
        &self,
        organization_id: &str,
        provider: Provider,
        rejected: &AccessToken,
    ) -> Result<AccessToken, GatewayError> {
        self.join_refresh(
            CredentialKey::new(organization_id, provider),
            RefreshTrigger::Rejected(rejected.value.clone()),
        )
        .await
    }

    /// Encrypts and persists a fresh grant as the active credential.
    pub fn store(
        &self,
        organization_id: &str,
        provider: Provider,
        grant: &TokenGrant,
    ) -> Result<CredentialRecord, GatewayError> {
        let credential = self.inner.new_credential(organization_id, provider, grant, None)?;
        let record = self
            .inner
            .store
            .insert_active(&credential)
            .map_err(GatewayError::storage)?;

        info!(
            organization_id = %organization_id,
            provider = %provider,
            expires_at = %record.expires_at,
            "Credential stored"
        );
        Ok(record)
    }

    /// Deactivates the credential. Returns false if there was none.
    pub fn revoke(&self, organization_id: &str, provider: Provider) -> Result<bool, GatewayError> {
        let revoked = self
            .inner
            .store
            .deactivate(organization_id, provider)
            .map_err(GatewayError::storage)?;

        if revoked {
            info!(organization_id = %organization_id, provider = %provider, "Credential revoked");
        } else {
            debug!(organization_id = %organization_id, provider = %provider, "No credential to revoke");
        }
        Ok(revoked)
    }

    pub fn status(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<ConnectionStatus, GatewayError> {
        let record = self
            .inner
            .store
            .active(organization_id, provider)
            .map_err(GatewayError::storage)?;

        Ok(match record {
            Some(record) => ConnectionStatus {
                connected: true,
                expires_at: Some(record.expires_at),
                account_id: record.account_id().map(str::to_string),
                scopes: record.scopes,
            },
            None => ConnectionStatus::disconnected(),
        })
    }

    async fn join_refresh(&self, key: CredentialKey, trigger: RefreshTrigger) -> RefreshResult {
        let shared = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(
                    organization_id = %key.organization_id,
                    provider = %key.provider,
                    "Joining in-flight refresh"
                );
                entry.get().refresh.clone()
            }
            Entry::Vacant(entry) => {
                let in_flight = self.spawn_refresh(key.clone(), trigger);
                let refresh = in_flight.refresh.clone();
                entry.insert(in_flight);
                refresh
            }
        };
        shared.await
    }

    /// Starts a refresh task. Must be called while holding the vacant entry
    /// for `key`, which the task removes when it finishes.
    fn spawn_refresh(&self, key: CredentialKey, trigger: RefreshTrigger) -> InFlight {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            generation,
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            inner.run_refresh(key, trigger).await
        });

        let refresh = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(GatewayError::Transient(format!("refresh task failed: {}", e))),
            }
        }
        .boxed()
        .shared();
        InFlight {
            generation,
            refresh,
        }
    }

    #[cfg(test)]
    fn refreshes_in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl Inner {
    fn active_record(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<CredentialRecord, GatewayError> {
        self.store
            .active(organization_id, provider)
            .map_err(GatewayError::storage)?
            .ok_or_else(|| GatewayError::auth_required(provider, "not connected"))
    }

    fn needs_refresh(&self, record: &CredentialRecord) -> bool {
        Utc::now() >= record.expires_at - ChronoDuration::seconds(self.config.refresh_skew_seconds)
    }

    fn decrypt_access(&self, record: &CredentialRecord) -> Result<AccessToken, GatewayError> {
        let value = record
            .access_token_ciphertext
            .as_deref()
            .ok_or_else(|| GatewayError::auth_required(record.provider, "credential cleared"))
            .and_then(|ciphertext| self.decrypt(record, ciphertext))?;

        Ok(AccessToken {
            value,
            expires_at: record.expires_at,
        })
    }

    /// A record that cannot be decrypted is unusable: deactivate it and ask
    /// the organization to reconnect.
    fn decrypt(&self, record: &CredentialRecord, ciphertext: &str) -> Result<String, GatewayError> {
        self.vault.decrypt(ciphertext).map_err(|e| {
            error!(
                organization_id = %record.organization_id,
                provider = %record.provider,
                error = %e,
                "Stored credential could not be decrypted, deactivating"
            );
            if let Err(e) = self.store.deactivate_record(record.id) {
                error!(error = %sanitize_message(&format!("{:#}", e)), "Failed to deactivate credential");
            }
            GatewayError::auth_required(record.provider, "stored credential unreadable")
        })
    }

    fn new_credential(
        &self,
        organization_id: &str,
        provider: Provider,
        grant: &TokenGrant,
        previous: Option<&CredentialRecord>,
    ) -> Result<NewCredential, GatewayError> {
        let encrypt = |plaintext: &str| {
            self.vault
                .encrypt(plaintext)
                .map_err(|e| GatewayError::Storage(e.to_string()))
        };

        let access_token_ciphertext = encrypt(&grant.access_token)?;
        let refresh_token_ciphertext = match &grant.refresh_token {
            Some(refresh) => Some(encrypt(refresh)?),
            // Meta long-lived tokens are refreshed by exchanging the token itself
            None if provider == Provider::Meta => Some(encrypt(&grant.access_token)?),
            None => previous.and_then(|p| p.refresh_token_ciphertext.clone()),
        };

        let lifetime = grant
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.default_lifetime_seconds);

        let scopes: BTreeSet<String> = if grant.scopes.is_empty() {
            previous.map(|p| p.scopes.clone()).unwrap_or_default()
        } else {
            grant.scopes.iter().cloned().collect()
        };

        Ok(NewCredential {
            organization_id: organization_id.to_string(),
            provider,
            access_token_ciphertext,
            refresh_token_ciphertext,
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
            scopes,
            ad_account_id: grant
                .ad_account_id
                .clone()
                .or_else(|| previous.and_then(|p| p.ad_account_id.clone())),
            business_id: grant
                .business_id
                .clone()
                .or_else(|| previous.and_then(|p| p.business_id.clone())),
        })
    }

    async fn run_refresh(&self, key: CredentialKey, trigger: RefreshTrigger) -> RefreshResult {
        match tokio::time::timeout(self.config.refresh_timeout(), self.refresh_once(&key, trigger))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    organization_id = %key.organization_id,
                    provider = %key.provider,
                    timeout_secs = self.config.refresh_timeout_seconds,
                    "Token refresh timed out"
                );
                Err(GatewayError::Transient("token refresh timed out".to_string()))
            }
        }
    }

    async fn refresh_once(&self, key: &CredentialKey, trigger: RefreshTrigger) -> RefreshResult {
        let organization_id = key.organization_id.as_str();
        let provider = key.provider;
        let record = self.active_record(organization_id, provider)?;

        match &trigger {
            RefreshTrigger::Expiring if !self.needs_refresh(&record) => {
                debug!(organization_id = %organization_id, provider = %provider, "Token already refreshed");
                return self.decrypt_access(&record);
            }
            RefreshTrigger::Rejected(rejected) => {
                let current = self.decrypt_access(&record)?;
                if current.value != *rejected {
                    debug!(organization_id = %organization_id, provider = %provider, "Rejected token already replaced");
                    return Ok(current);
                }
            }
            _ => {}
        }

        let refresh_credential = match record.refresh_token_ciphertext.as_deref() {
            Some(ciphertext) => self.decrypt(&record, ciphertext)?,
            None => {
                self.deactivate_after_failure(&record);
                return Err(GatewayError::auth_required(provider, "no refresh credential"));
            }
        };

        let grant = match self.client.refresh_token(provider, &refresh_credential).await {
            Ok(grant) => grant,
            Err(TokenEndpointError::InvalidGrant(detail)) => {
                error!(
                    organization_id = %organization_id,
                    provider = %provider,
                    detail = %sanitize_message(&detail),
                    "Refresh token rejected, deactivating credential"
                );
                self.deactivate_after_failure(&record);
                return Err(GatewayError::auth_required(provider, "refresh token rejected"));
            }
            Err(e) => {
                warn!(
                    organization_id = %organization_id,
                    provider = %provider,
                    error = %sanitize_message(&e.to_string()),
                    "Token refresh failed, keeping credential"
                );
                return Err(GatewayError::Transient(sanitize_message(&e.to_string())));
            }
        };

        let credential = self.new_credential(organization_id, provider, &grant, Some(&record))?;
        let replaced = self
            .store
            .supersede(record.id, &credential)
            .map_err(GatewayError::storage)?;

        match replaced {
            Some(new_record) => {
                info!(
                    organization_id = %organization_id,
                    provider = %provider,
                    expires_at = %new_record.expires_at,
                    "Token refreshed"
                );
                Ok(AccessToken {
                    value: grant.access_token,
                    expires_at: new_record.expires_at,
                })
            }
            None => {
                // Reconnected or revoked while the refresh was running
                let current = self.active_record(organization_id, provider)?;
                self.decrypt_access(&current)
            }
        }
    }

    fn deactivate_after_failure(&self, record: &CredentialRecord) {
        if let Err(e) = self.store.deactivate_record(record.id) {
            error!(
                organization_id = %record.organization_id,
                provider = %record.provider,
                error = %sanitize_message(&format!("{:#}", e)),
                "Failed to deactivate credential"
            );
        }
    }
}
