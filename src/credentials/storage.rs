//! Credential record persistence using SQLite.
//!
//! Stores vault ciphertext only. Replacing a record is one transaction that
//! deactivates the previous row and inserts the new one, so readers always see
//! either the old or the new record.

use super::{CredentialRecord, NewCredential};
use crate::provider::Provider;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Inactive rows kept per (organization, provider) for auditing. Older ones
/// are deleted whenever a new record is written.
const RETAINED_INACTIVE_RECORDS: i64 = 5;

/// Credential store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credential_records (
///     id INTEGER PRIMARY KEY,
///     organization_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token_ciphertext TEXT,     -- NULL once deactivated
///     refresh_token_ciphertext TEXT,    -- NULL once deactivated
///     expires_at TEXT NOT NULL,         -- RFC 3339
///     scopes TEXT NOT NULL,             -- JSON array
///     ad_account_id TEXT,
///     business_id TEXT,
///     is_active INTEGER NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// -- at most one active record per (organization_id, provider)
/// CREATE UNIQUE INDEX idx_active_credential
///     ON credential_records(organization_id, provider) WHERE is_active = 1;
/// ```
///
/// Inactive rows are pruned to the newest few per key on every write.
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex; statements are short and never span
///   network I/O
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = r#"
    id, organization_id, provider,
    access_token_ciphertext, refresh_token_ciphertext,
    expires_at, scopes, ad_account_id, business_id,
    is_active, created_at, updated_at
"#;

impl CredentialStore {
    /// Creates or opens a credential store. Use `":memory:"` for tests.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credential_records (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token_ciphertext TEXT,
                refresh_token_ciphertext TEXT,
                expires_at TEXT NOT NULL,
                scopes TEXT NOT NULL,
                ad_account_id TEXT,
                business_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_active_credential
                ON credential_records(organization_id, provider) WHERE is_active = 1;
            "#,
        )
        .context("Failed to create credential_records schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }

    /// Inserts `credential` as the active record, deactivating any prior one
    /// for the same organization and provider in the same transaction.
    pub fn insert_active(&self, credential: &NewCredential) -> Result<CredentialRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            UPDATE credential_records
            SET is_active = 0,
                access_token_ciphertext = NULL,
                refresh_token_ciphertext = NULL,
                updated_at = ?3
            WHERE organization_id = ?1 AND provider = ?2 AND is_active = 1
            "#,
            params![credential.organization_id, credential.provider.as_str(), now],
        )
        .context("Failed to deactivate previous credential")?;

        let record = insert_record(&tx, credential)?;
        prune_history(&tx, &credential.organization_id, credential.provider)?;
        tx.commit().context("Failed to commit credential")?;

        Ok(record)
    }

    /// Replaces the active record `previous_id` with `credential`.
    ///
    /// Returns `Ok(None)` without writing anything if `previous_id` is no longer
    /// the active record (revoked or replaced meanwhile).
    pub fn supersede(
        &self,
        previous_id: i64,
        credential: &NewCredential,
    ) -> Result<Option<CredentialRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let now = Utc::now().to_rfc3339();
        let deactivated = tx
            .execute(
                r#"
                UPDATE credential_records
                SET is_active = 0,
                    access_token_ciphertext = NULL,
                    refresh_token_ciphertext = NULL,
                    updated_at = ?2
                WHERE id = ?1 AND is_active = 1
                "#,
                params![previous_id, now],
            )
            .context("Failed to deactivate superseded credential")?;

        if deactivated == 0 {
            return Ok(None);
        }

        let record = insert_record(&tx, credential)?;
        prune_history(&tx, &credential.organization_id, credential.provider)?;
        tx.commit().context("Failed to commit refreshed credential")?;

        Ok(Some(record))
    }

    /// Returns the active record for an organization and provider.
    pub fn active(&self, organization_id: &str, provider: Provider) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM credential_records WHERE organization_id = ?1 AND provider = ?2 AND is_active = 1",
            SELECT_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![organization_id, provider.as_str()], read_row)
            .optional()
            .context("Failed to query active credential")?;

        row.map(StoredRow::into_record).transpose()
    }

    /// Deactivates the active record and clears its ciphertext.
    ///
    /// Returns `Ok(false)` if there was nothing to deactivate.
    pub fn deactivate(&self, organization_id: &str, provider: Provider) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credential_records
                SET is_active = 0,
                    access_token_ciphertext = NULL,
                    refresh_token_ciphertext = NULL,
                    updated_at = ?3
                WHERE organization_id = ?1 AND provider = ?2 AND is_active = 1
                "#,
                params![organization_id, provider.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to deactivate credential")?;

        Ok(rows > 0)
    }

    /// Deactivates one specific record if it is still active.
    pub fn deactivate_record(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credential_records
                SET is_active = 0,
                    access_token_ciphertext = NULL,
                    refresh_token_ciphertext = NULL,
                    updated_at = ?2
                WHERE id = ?1 AND is_active = 1
                "#,
                params![id, Utc::now().to_rfc3339()],
            )
            .context("Failed to deactivate credential record")?;

        Ok(rows > 0)
    }

    /// Overrides the expiry of the active record.
    ///
    /// Used by operators to force a refresh on next use.
    pub fn set_expires_at(
        &self,
        organization_id: &str,
        provider: Provider,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credential_records
                SET expires_at = ?3, updated_at = ?4
                WHERE organization_id = ?1 AND provider = ?2 AND is_active = 1
                "#,
                params![
                    organization_id,
                    provider.as_str(),
                    expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to update credential expiry")?;

        Ok(rows > 0)
    }

    /// Number of records (active and inactive) for an organization and provider.
    pub fn history_len(&self, organization_id: &str, provider: Provider) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM credential_records WHERE organization_id = ?1 AND provider = ?2",
                params![organization_id, provider.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count credential records")?;

        Ok(count as usize)
    }
}

fn insert_record(tx: &Transaction<'_>, credential: &NewCredential) -> Result<CredentialRecord> {
    let now = Utc::now();
    let scopes_json =
        serde_json::to_string(&credential.scopes).context("Failed to encode scopes")?;

    tx.execute(
        r#"
        INSERT INTO credential_records (
            organization_id, provider,
            access_token_ciphertext, refresh_token_ciphertext,
            expires_at, scopes, ad_account_id, business_id,
            is_active, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)
        "#,
        params![
            credential.organization_id,
            credential.provider.as_str(),
            credential.access_token_ciphertext,
            credential.refresh_token_ciphertext,
            credential.expires_at.to_rfc3339(),
            scopes_json,
            credential.ad_account_id,
            credential.business_id,
            now.to_rfc3339(),
        ],
    )
    .context("Failed to insert credential")?;

    Ok(CredentialRecord {
        id: tx.last_insert_rowid(),
        organization_id: credential.organization_id.clone(),
        provider: credential.provider,
        access_token_ciphertext: Some(credential.access_token_ciphertext.clone()),
        refresh_token_ciphertext: credential.refresh_token_ciphertext.clone(),
        expires_at: credential.expires_at,
        scopes: credential.scopes.clone(),
        ad_account_id: credential.ad_account_id.clone(),
        business_id: credential.business_id.clone(),
        is_active: true,
        created_at: now,
        updated_at: now,
    })
}

/// Deletes inactive rows beyond the newest [`RETAINED_INACTIVE_RECORDS`].
fn prune_history(tx: &Transaction<'_>, organization_id: &str, provider: Provider) -> Result<usize> {
    tx.execute(
        r#"
        DELETE FROM credential_records
        WHERE organization_id = ?1 AND provider = ?2 AND is_active = 0
          AND id NOT IN (
              SELECT id FROM credential_records
              WHERE organization_id = ?1 AND provider = ?2 AND is_active = 0
              ORDER BY id DESC
              LIMIT ?3
          )
        "#,
        params![organization_id, provider.as_str(), RETAINED_INACTIVE_RECORDS],
    )
    .context("Failed to prune superseded credentials")
}

/// Row as stored, before parsing provider, timestamps and scopes.
struct StoredRow {
    id: i64,
    organization_id: String,
    provider: String,
    access_token_ciphertext: Option<String>,
    refresh_token_ciphertext: Option<String>,
    expires_at: String,
    scopes: String,
    ad_account_id: Option<String>,
    business_id: Option<String>,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        provider: row.get(2)?,
        access_token_ciphertext: row.get(3)?,
        refresh_token_ciphertext: row.get(4)?,
        expires_at: row.get(5)?,
        scopes: row.get(6)?,
        ad_account_id: row.get(7)?,
        business_id: row.get(8)?,
        is_active: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl StoredRow {
    fn into_record(self) -> Result<CredentialRecord> {
        let provider: Provider = self
            .provider
            .parse()
            .map_err(|_| anyhow!("Unknown provider '{}' in credential store", self.provider))?;
        let scopes: BTreeSet<String> =
            serde_json::from_str(&self.scopes).context("Failed to parse stored scopes")?;

        Ok(CredentialRecord {
            id: self.id,
            organization_id: self.organization_id,
            provider,
            access_token_ciphertext: self.access_token_ciphertext,
            refresh_token_ciphertext: self.refresh_token_ciphertext,
            expires_at: parse_timestamp(&self.expires_at).context("Failed to parse expires_at")?,
            scopes,
            ad_account_id: self.ad_account_id,
            business_id: self.business_id,
            is_active: self.is_active,
            created_at: parse_timestamp(&self.created_at).context("Failed to parse created_at")?,
            updated_at: parse_timestamp(&self.updated_at).context("Failed to parse updated_at")?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        CredentialStore::new(":memory:").expect("Failed to create test store")
    }

    fn new_credential(org: &str, provider: Provider, access: &str) -> NewCredential {
        NewCredential {
            organization_id: org.to_string(),
            provider,
            access_token_ciphertext: access.to_string(),
            refresh_token_ciphertext: Some(format!("{}-refresh", access)),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: ["ads_read".to_string()].into_iter().collect(),
            ad_account_id: Some("act_42".to_string()),
            business_id: None,
        }
    }

    #[test]
    fn test_insert_and_get_active() {
        let store = create_test_store();
        let inserted = store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();

        let active = store.active("org1", Provider::Meta).unwrap().unwrap();
        assert_eq!(active.id, inserted.id);
        assert_eq!(active.access_token_ciphertext.as_deref(), Some("ct-1"));
        assert_eq!(active.refresh_token_ciphertext.as_deref(), Some("ct-1-refresh"));
        assert!(active.scopes.contains("ads_read"));
        assert_eq!(active.account_id(), Some("act_42"));
        assert!(active.is_active);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.active("org1", Provider::Meta).unwrap().is_none());
    }

    #[test]
    fn test_insert_deactivates_previous_record() {
        let store = create_test_store();
        store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();
        let second = store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-2"))
            .unwrap();

        let active = store.active("org1", Provider::Meta).unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.access_token_ciphertext.as_deref(), Some("ct-2"));
        assert_eq!(store.history_len("org1", Provider::Meta).unwrap(), 2);
    }

    #[test]
    fn test_keys_are_isolated() {
        let store = create_test_store();
        store
            .insert_active(&new_credential("org1", Provider::Meta, "meta"))
            .unwrap();
        store
            .insert_active(&new_credential("org1", Provider::GoogleAds, "google"))
            .unwrap();
        store
            .insert_active(&new_credential("org2", Provider::Meta, "other"))
            .unwrap();

        let google = store.active("org1", Provider::GoogleAds).unwrap().unwrap();
        assert_eq!(google.access_token_ciphertext.as_deref(), Some("google"));
        let other = store.active("org2", Provider::Meta).unwrap().unwrap();
        assert_eq!(other.access_token_ciphertext.as_deref(), Some("other"));
    }

    #[test]
    fn test_supersede_replaces_active_record() {
        let store = create_test_store();
        let first = store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();

        let replaced = store
            .supersede(first.id, &new_credential("org1", Provider::Meta, "ct-2"))
            .unwrap()
            .expect("first record was active");
        assert_ne!(replaced.id, first.id);

        let active = store.active("org1", Provider::Meta).unwrap().unwrap();
        assert_eq!(active.id, replaced.id);
    }

    #[test]
    fn test_history_is_bounded() {
        let store = create_test_store();
        let mut current = store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-0"))
            .unwrap();
        for i in 1..=20 {
            current = store
                .supersede(current.id, &new_credential("org1", Provider::Meta, &format!("ct-{}", i)))
                .unwrap()
                .expect("record is active");
        }
        for i in 0..10 {
            store
                .insert_active(&new_credential("org1", Provider::Meta, &format!("re-{}", i)))
                .unwrap();
        }

        let expected = 1 + RETAINED_INACTIVE_RECORDS as usize;
        assert_eq!(store.history_len("org1", Provider::Meta).unwrap(), expected);
        let active = store.active("org1", Provider::Meta).unwrap().unwrap();
        assert_eq!(active.access_token_ciphertext.as_deref(), Some("re-9"));

        // Other keys keep their own history
        store
            .insert_active(&new_credential("org2", Provider::Meta, "other"))
            .unwrap();
        assert_eq!(store.history_len("org1", Provider::Meta).unwrap(), expected);
        assert_eq!(store.history_len("org2", Provider::Meta).unwrap(), 1);
    }

    #[test]
    fn test_supersede_skips_inactive_record() {
        let store = create_test_store();
        let first = store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();
        assert!(store.deactivate("org1", Provider::Meta).unwrap());

        let result = store
            .supersede(first.id, &new_credential("org1", Provider::Meta, "ct-2"))
            .unwrap();
        assert!(result.is_none());
        assert!(store.active("org1", Provider::Meta).unwrap().is_none());
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let store = create_test_store();
        store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();

        assert!(store.deactivate("org1", Provider::Meta).unwrap());
        assert!(!store.deactivate("org1", Provider::Meta).unwrap());
        assert!(store.active("org1", Provider::Meta).unwrap().is_none());
    }

    #[test]
    fn test_deactivated_rows_keep_no_ciphertext() {
        let store = create_test_store();
        store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();
        store.deactivate("org1", Provider::Meta).unwrap();

        let conn = store.conn().unwrap();
        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM credential_records WHERE access_token_ciphertext IS NOT NULL OR refresh_token_ciphertext IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_set_expires_at() {
        let store = create_test_store();
        store
            .insert_active(&new_credential("org1", Provider::Meta, "ct-1"))
            .unwrap();

        let past = Utc::now() - Duration::minutes(5);
        assert!(store.set_expires_at("org1", Provider::Meta, past).unwrap());

        let active = store.active("org1", Provider::Meta).unwrap().unwrap();
        assert!(active.expires_at <= Utc::now());
        assert!(!store.set_expires_at("org2", Provider::Meta, past).unwrap());
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        {
            let store = CredentialStore::new(&path).unwrap();
            store
                .insert_active(&new_credential("org1", Provider::GoogleAds, "ct-1"))
                .unwrap();
        }

        let reopened = CredentialStore::new(&path).unwrap();
        let active = reopened.active("org1", Provider::GoogleAds).unwrap().unwrap();
        assert_eq!(active.access_token_ciphertext.as_deref(), Some("ct-1"));
    }
}
