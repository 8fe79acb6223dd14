//! Pending OAuth authorizations, keyed by the `state` nonce sent to the provider.
//!
//! A nonce is issued when an organization starts connecting a provider and
//! is removed on first lookup, so a replayed callback never finds it. The
//! controller checks that the callback arrived on the same provider.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::provider::Provider;

/// Who started an authorization, and when.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAuthorization {
    pub organization_id: String,
    pub provider: Provider,
    pub issued_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StateManager {
    pending: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
    ttl: Duration,
}

impl StateManager {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingAuthorization>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, entry: &PendingAuthorization, now: DateTime<Utc>) -> bool {
        now - entry.issued_at <= self.ttl
    }

    /// Issues a fresh nonce for `organization_id` connecting `provider`.
    pub fn issue(&self, organization_id: &str, provider: Provider) -> String {
        let nonce = Uuid::new_v4().to_string();
        self.pending().insert(
            nonce.clone(),
            PendingAuthorization {
                organization_id: organization_id.to_string(),
                provider,
                issued_at: Utc::now(),
            },
        );
        nonce
    }

    /// Removes `nonce` and returns its authorization if it had not expired.
    pub fn take(&self, nonce: &str) -> Option<PendingAuthorization> {
        let entry = self.pending().remove(nonce)?;
        self.is_live(&entry, Utc::now()).then_some(entry)
    }

    /// Drops expired nonces. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, entry| self.is_live(entry, now));
        before - pending.len()
    }

    pub fn outstanding(&self) -> usize {
        self.pending().len()
    }
}

/// Purges expired nonces every `interval_seconds`, forever.
pub async fn run_purge_loop(manager: StateManager, interval_seconds: u64) {
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        ticker.tick().await;
        let removed = manager.purge_expired();
        if removed > 0 {
            tracing::debug!(
                removed,
                outstanding = manager.outstanding(),
                "Purged expired OAuth authorizations"
            );
        }
    }
}
