//! SQLite-backed sync store.
//!
//! Single-node deployments keep credentials, locks, configurations, sync
//! metadata and the synced investment records in one WAL database.
//! Timestamps are fixed-width RFC 3339 UTC text so string comparison
//! orders them correctly inside SQL.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{InvestmentRecord, InvestmentType, UserId};
use crate::store::models::{AccountLock, CredentialRecord, MetadataKey, SyncClaim};
use crate::store::traits::{InvestmentStore, SyncStore};
use crate::sync::models::{SyncConfiguration, SyncFrequency, SyncMetadata, SyncStatus};
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_store mkdir", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store connect options", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store connect", e))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. One connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_store connect options", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store connect", e))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store schema", e))?;
        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
  user_id TEXT NOT NULL,
  service TEXT NOT NULL,
  ciphertext BLOB NOT NULL,
  key_version INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, service)
);

CREATE TABLE IF NOT EXISTS account_locks (
  user_id TEXT NOT NULL,
  service TEXT NOT NULL,
  locked_at TEXT NOT NULL,
  lock_until TEXT NOT NULL,
  reason TEXT NOT NULL,
  PRIMARY KEY (user_id, service)
);

CREATE TABLE IF NOT EXISTS sync_configurations (
  user_id TEXT NOT NULL,
  investment_type TEXT NOT NULL,
  enabled INTEGER NOT NULL,
  frequency TEXT NOT NULL,
  preferred_source TEXT NULL,
  fallback_source TEXT NULL,
  notify_on_success INTEGER NOT NULL,
  notify_on_failure INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, investment_type)
);

CREATE TABLE IF NOT EXISTS sync_metadata (
  user_id TEXT NOT NULL,
  investment_type TEXT NOT NULL,
  scope TEXT NOT NULL,
  status TEXT NOT NULL,
  last_sync_at TEXT NULL,
  source TEXT NULL,
  last_error TEXT NULL,
  content_hash TEXT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, investment_type, scope)
);

CREATE TABLE IF NOT EXISTS investments (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  investment_type TEXT NOT NULL,
  key TEXT NOT NULL,
  fields_json TEXT NOT NULL,
  manual_override INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS investments_user_type_key_idx
  ON investments(user_id, investment_type, key);
"#;

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite_store", e)
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::backend("parse datetime", e))
}

fn parse_user(s: &str) -> Result<UserId> {
    UserId::from_str(s).map_err(|e| Error::backend("parse user id", e))
}

fn parse_type(s: &str) -> Result<InvestmentType> {
    InvestmentType::from_str(s).map_err(|e| Error::backend("parse investment type", e))
}

fn row_to_credential(r: &SqliteRow) -> Result<CredentialRecord> {
    Ok(CredentialRecord {
        user_id: parse_user(r.get::<String, _>("user_id").as_str())?,
        service: r.get("service"),
        ciphertext: r.get("ciphertext"),
        key_version: r.get::<i64, _>("key_version").max(0) as u32,
        created_at: parse_dt(r.get::<String, _>("created_at").as_str())?,
        updated_at: parse_dt(r.get::<String, _>("updated_at").as_str())?,
    })
}

fn row_to_lock(r: &SqliteRow) -> Result<AccountLock> {
    Ok(AccountLock {
        user_id: parse_user(r.get::<String, _>("user_id").as_str())?,
        service: r.get("service"),
        locked_at: parse_dt(r.get::<String, _>("locked_at").as_str())?,
        lock_until: parse_dt(r.get::<String, _>("lock_until").as_str())?,
        reason: r.get("reason"),
    })
}

fn row_to_configuration(r: &SqliteRow) -> Result<SyncConfiguration> {
    Ok(SyncConfiguration {
        user_id: parse_user(r.get::<String, _>("user_id").as_str())?,
        investment_type: parse_type(r.get::<String, _>("investment_type").as_str())?,
        enabled: r.get::<i64, _>("enabled") != 0,
        frequency: SyncFrequency::from_str(r.get::<String, _>("frequency").as_str())?,
        preferred_source: r.get("preferred_source"),
        fallback_source: r.get("fallback_source"),
        notify_on_success: r.get::<i64, _>("notify_on_success") != 0,
        notify_on_failure: r.get::<i64, _>("notify_on_failure") != 0,
        created_at: parse_dt(r.get::<String, _>("created_at").as_str())?,
        updated_at: parse_dt(r.get::<String, _>("updated_at").as_str())?,
    })
}

fn row_to_metadata(r: &SqliteRow) -> Result<SyncMetadata> {
    let last_sync_at: Option<String> = r.get("last_sync_at");
    Ok(SyncMetadata {
        key: MetadataKey {
            user_id: parse_user(r.get::<String, _>("user_id").as_str())?,
            investment_type: parse_type(r.get::<String, _>("investment_type").as_str())?,
            scope: r.get("scope"),
        },
        status: SyncStatus::from_str(r.get::<String, _>("status").as_str())?,
        last_sync_at: last_sync_at.as_deref().map(parse_dt).transpose()?,
        source: r.get("source"),
        last_error: r.get("last_error"),
        content_hash: r.get("content_hash"),
        updated_at: parse_dt(r.get::<String, _>("updated_at").as_str())?,
    })
}

fn row_to_investment(r: &SqliteRow) -> Result<InvestmentRecord> {
    let fields_json: String = r.get("fields_json");
    Ok(InvestmentRecord {
        id: Uuid::parse_str(r.get::<String, _>("id").as_str())
            .map_err(|e| Error::backend("parse investment id", e))?,
        user_id: parse_user(r.get::<String, _>("user_id").as_str())?,
        investment_type: parse_type(r.get::<String, _>("investment_type").as_str())?,
        key: r.get("key"),
        fields: serde_json::from_str(&fields_json)
            .map_err(|e| Error::backend("decode investment fields", e))?,
        manual_override: r.get::<i64, _>("manual_override") != 0,
        created_at: parse_dt(r.get::<String, _>("created_at").as_str())?,
        updated_at: parse_dt(r.get::<String, _>("updated_at").as_str())?,
    })
}

#[async_trait]
impl SyncStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, record), fields(user_id = %record.user_id, service = %record.service))]
    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO credentials (user_id, service, ciphertext, key_version, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(user_id, service) DO UPDATE SET
  ciphertext = excluded.ciphertext,
  key_version = excluded.key_version,
  updated_at = excluded.updated_at
"#,
        )
        .bind(record.user_id.to_string())
        .bind(&record.service)
        .bind(&record.ciphertext)
        .bind(record.key_version as i64)
        .bind(ts(record.created_at))
        .bind(ts(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_credential(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            r#"
SELECT user_id, service, ciphertext, key_version, created_at, updated_at
FROM credentials
WHERE user_id = ?1 AND service = ?2
"#,
        )
        .bind(user_id.to_string())
        .bind(service)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_credential).transpose()
    }

    async fn delete_credential(&self, user_id: UserId, service: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM credentials WHERE user_id = ?1 AND service = ?2")
            .bind(user_id.to_string())
            .bind(service)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_credentials(&self, user_id: UserId) -> Result<Vec<CredentialRecord>> {
        let rows = sqlx::query(
            r#"
SELECT user_id, service, ciphertext, key_version, created_at, updated_at
FROM credentials
WHERE user_id = ?1
ORDER BY service ASC
"#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn upsert_account_lock(&self, lock: &AccountLock) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO account_locks (user_id, service, locked_at, lock_until, reason)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(user_id, service) DO UPDATE SET
  locked_at = excluded.locked_at,
  lock_until = excluded.lock_until,
  reason = excluded.reason
"#,
        )
        .bind(lock.user_id.to_string())
        .bind(&lock.service)
        .bind(ts(lock.locked_at))
        .bind(ts(lock.lock_until))
        .bind(&lock.reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_account_lock(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<Option<AccountLock>> {
        let row = sqlx::query(
            r#"
SELECT user_id, service, locked_at, lock_until, reason
FROM account_locks
WHERE user_id = ?1 AND service = ?2
"#,
        )
        .bind(user_id.to_string())
        .bind(service)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_lock).transpose()
    }

    async fn delete_account_lock(&self, user_id: UserId, service: &str) -> Result<()> {
        sqlx::query("DELETE FROM account_locks WHERE user_id = ?1 AND service = ?2")
            .bind(user_id.to_string())
            .bind(service)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_sync_configuration(&self, config: &SyncConfiguration) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO sync_configurations
  (user_id, investment_type, enabled, frequency, preferred_source, fallback_source,
   notify_on_success, notify_on_failure, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(user_id, investment_type) DO UPDATE SET
  enabled = excluded.enabled,
  frequency = excluded.frequency,
  preferred_source = excluded.preferred_source,
  fallback_source = excluded.fallback_source,
  notify_on_success = excluded.notify_on_success,
  notify_on_failure = excluded.notify_on_failure,
  updated_at = excluded.updated_at
"#,
        )
        .bind(config.user_id.to_string())
        .bind(config.investment_type.as_str())
        .bind(config.enabled as i64)
        .bind(config.frequency.as_str())
        .bind(&config.preferred_source)
        .bind(&config.fallback_source)
        .bind(config.notify_on_success as i64)
        .bind(config.notify_on_failure as i64)
        .bind(ts(config.created_at))
        .bind(ts(config.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_sync_configuration(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Option<SyncConfiguration>> {
        let row = sqlx::query(
            r#"
SELECT * FROM sync_configurations
WHERE user_id = ?1 AND investment_type = ?2
"#,
        )
        .bind(user_id.to_string())
        .bind(investment_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_configuration).transpose()
    }

    async fn list_sync_configurations(&self, user_id: UserId) -> Result<Vec<SyncConfiguration>> {
        let rows = sqlx::query(
            r#"
SELECT * FROM sync_configurations
WHERE user_id = ?1
ORDER BY investment_type ASC
"#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut out = rows
            .iter()
            .map(row_to_configuration)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by_key(|c| c.investment_type);
        Ok(out)
    }

    #[tracing::instrument(level = "debug", skip(self, claim), fields(key = %claim.key, force = claim.force))]
    async fn try_begin_sync(&self, claim: &SyncClaim) -> Result<bool> {
        // The SELECT yields no row while any scope of this (user, type) is
        // held by a live run, so a refused claim affects zero rows.
        let res = sqlx::query(
            r#"
INSERT INTO sync_metadata
  (user_id, investment_type, scope, status, last_sync_at, source, last_error, content_hash, updated_at)
SELECT ?1, ?2, ?3, 'in_progress', NULL, ?4, NULL, NULL, ?5
WHERE ?6 = 1
   OR NOT EXISTS (
     SELECT 1 FROM sync_metadata
     WHERE user_id = ?1
       AND investment_type = ?2
       AND status = 'in_progress'
       AND updated_at >= ?7
   )
ON CONFLICT(user_id, investment_type, scope) DO UPDATE SET
  status = 'in_progress',
  source = excluded.source,
  updated_at = excluded.updated_at
"#,
        )
        .bind(claim.key.user_id.to_string())
        .bind(claim.key.investment_type.as_str())
        .bind(&claim.key.scope)
        .bind(&claim.source)
        .bind(ts(claim.now))
        .bind(claim.force as i64)
        .bind(ts(claim.stale_before))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn upsert_sync_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO sync_metadata
  (user_id, investment_type, scope, status, last_sync_at, source, last_error, content_hash, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(user_id, investment_type, scope) DO UPDATE SET
  status = excluded.status,
  last_sync_at = excluded.last_sync_at,
  source = excluded.source,
  last_error = excluded.last_error,
  content_hash = excluded.content_hash,
  updated_at = excluded.updated_at
"#,
        )
        .bind(metadata.key.user_id.to_string())
        .bind(metadata.key.investment_type.as_str())
        .bind(&metadata.key.scope)
        .bind(metadata.status.as_str())
        .bind(metadata.last_sync_at.map(ts))
        .bind(&metadata.source)
        .bind(&metadata.last_error)
        .bind(&metadata.content_hash)
        .bind(ts(metadata.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_sync_metadata(&self, key: &MetadataKey) -> Result<Option<SyncMetadata>> {
        let row = sqlx::query(
            r#"
SELECT * FROM sync_metadata
WHERE user_id = ?1 AND investment_type = ?2 AND scope = ?3
"#,
        )
        .bind(key.user_id.to_string())
        .bind(key.investment_type.as_str())
        .bind(&key.scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_metadata).transpose()
    }

    async fn list_sync_metadata(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<SyncMetadata>> {
        let rows = sqlx::query(
            r#"
SELECT * FROM sync_metadata
WHERE user_id = ?1 AND investment_type = ?2
ORDER BY scope ASC
"#,
        )
        .bind(user_id.to_string())
        .bind(investment_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_metadata).collect()
    }
}

#[async_trait]
impl InvestmentStore for SqliteStore {
    async fn get_investment(&self, user_id: UserId, id: Uuid) -> Result<Option<InvestmentRecord>> {
        let row = sqlx::query("SELECT * FROM investments WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_investment).transpose()
    }

    async fn find_investment_by_key(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        key: &str,
    ) -> Result<Option<InvestmentRecord>> {
        let row = sqlx::query(
            r#"
SELECT * FROM investments
WHERE user_id = ?1 AND investment_type = ?2 AND key = ?3
"#,
        )
        .bind(user_id.to_string())
        .bind(investment_type.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_investment).transpose()
    }

    async fn list_investments(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<InvestmentRecord>> {
        let rows = sqlx::query(
            r#"
SELECT * FROM investments
WHERE user_id = ?1 AND investment_type = ?2
ORDER BY key ASC
"#,
        )
        .bind(user_id.to_string())
        .bind(investment_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_investment).collect()
    }

    async fn upsert_investment(&self, record: &InvestmentRecord) -> Result<()> {
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|e| Error::backend("serialize investment fields", e))?;
        sqlx::query(
            r#"
INSERT INTO investments
  (id, user_id, investment_type, key, fields_json, manual_override, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(id) DO UPDATE SET
  key = excluded.key,
  fields_json = excluded.fields_json,
  manual_override = excluded.manual_override,
  updated_at = excluded.updated_at
"#,
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(record.investment_type.as_str())
        .bind(&record.key)
        .bind(fields_json)
        .bind(record.manual_override as i64)
        .bind(ts(record.created_at))
        .bind(ts(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn claim(key: &MetadataKey, now: DateTime<Utc>, force: bool) -> SyncClaim {
        SyncClaim {
            key: key.clone(),
            source: Some("amfi".to_string()),
            force,
            now,
            stale_before: now - Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn credential_roundtrip_keeps_created_at() {
        let store = SqliteStore::in_memory().await.unwrap();
        let user = UserId::new();
        let t0 = Utc::now();
        let mut record = CredentialRecord {
            user_id: user,
            service: "epfo".to_string(),
            ciphertext: vec![1, 2, 3],
            key_version: 1,
            created_at: t0,
            updated_at: t0,
        };
        store.upsert_credential(&record).await.unwrap();

        record.ciphertext = vec![9, 9];
        record.key_version = 2;
        record.created_at = t0 + Duration::hours(1);
        record.updated_at = t0 + Duration::hours(1);
        store.upsert_credential(&record).await.unwrap();

        let got = store.get_credential(user, "epfo").await.unwrap().unwrap();
        assert_eq!(got.ciphertext, vec![9, 9]);
        assert_eq!(got.key_version, 2);
        assert_eq!(got.created_at, t0);
        assert_eq!(store.list_credentials(user).await.unwrap().len(), 1);

        assert!(store.delete_credential(user, "epfo").await.unwrap());
        assert!(!store.delete_credential(user, "epfo").await.unwrap());
        assert!(store.get_credential(user, "epfo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_respect_live_stale_and_forced_runs() {
        let store = SqliteStore::in_memory().await.unwrap();
        let key = MetadataKey::global(UserId::new(), InvestmentType::MutualFund);
        let t0 = Utc::now();

        assert!(store.try_begin_sync(&claim(&key, t0, false)).await.unwrap());
        assert!(!store
            .try_begin_sync(&claim(&key, t0 + Duration::minutes(5), false))
            .await
            .unwrap());
        assert!(store
            .try_begin_sync(&claim(&key, t0 + Duration::minutes(5), true))
            .await
            .unwrap());
        // Last touched at +5m, so it is stale by +40m.
        assert!(store
            .try_begin_sync(&claim(&key, t0 + Duration::minutes(40), false))
            .await
            .unwrap());

        let row = store.get_sync_metadata(&key).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::InProgress);
        assert_eq!(row.source.as_deref(), Some("amfi"));
    }

    #[tokio::test]
    async fn live_run_on_one_scope_blocks_the_others() {
        let store = SqliteStore::in_memory().await.unwrap();
        let user = UserId::new();
        let global = MetadataKey::global(user, InvestmentType::ProvidentFund);
        let one = MetadataKey::investment(user, InvestmentType::ProvidentFund, Uuid::new_v4());
        let t0 = Utc::now();

        assert!(store.try_begin_sync(&claim(&global, t0, false)).await.unwrap());
        assert!(!store.try_begin_sync(&claim(&one, t0, false)).await.unwrap());
        assert!(store.get_sync_metadata(&one).await.unwrap().is_none());
        assert!(store
            .try_begin_sync(&claim(&MetadataKey::global(user, InvestmentType::Stock), t0, false))
            .await
            .unwrap());

        let mut row = store.get_sync_metadata(&global).await.unwrap().unwrap();
        row.status = SyncStatus::Synced;
        store.upsert_sync_metadata(&row).await.unwrap();
        assert!(store.try_begin_sync(&claim(&one, t0, false)).await.unwrap());
        assert!(!store.try_begin_sync(&claim(&global, t0, false)).await.unwrap());
        // A stale per-investment run no longer holds the type.
        assert!(store
            .try_begin_sync(&claim(&global, t0 + Duration::minutes(40), false))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn finished_rows_can_be_claimed_again() {
        let store = SqliteStore::in_memory().await.unwrap();
        let key = MetadataKey::global(UserId::new(), InvestmentType::Stock);
        let now = Utc::now();
        assert!(store.try_begin_sync(&claim(&key, now, false)).await.unwrap());

        let mut row = store.get_sync_metadata(&key).await.unwrap().unwrap();
        row.status = SyncStatus::Synced;
        row.last_sync_at = Some(now);
        row.content_hash = Some("0123456789abcdef".to_string());
        store.upsert_sync_metadata(&row).await.unwrap();

        assert!(store.try_begin_sync(&claim(&key, now, false)).await.unwrap());
        let row = store.get_sync_metadata(&key).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::InProgress);
        assert_eq!(row.last_sync_at, Some(now));
        assert_eq!(row.content_hash.as_deref(), Some("0123456789abcdef"));
    }

    #[tokio::test]
    async fn configuration_and_investment_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let user = UserId::new();
        let now = Utc::now();

        let mut cfg = SyncConfiguration::defaults(user, InvestmentType::ProvidentFund, now);
        cfg.enabled = true;
        cfg.preferred_source = Some("epfo".to_string());
        store.upsert_sync_configuration(&cfg).await.unwrap();
        let got = store
            .get_sync_configuration(user, InvestmentType::ProvidentFund)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, cfg);

        let mut fields = serde_json::Map::new();
        fields.insert("balance".to_string(), json!(1250.5));
        let record = InvestmentRecord::new(
            user,
            InvestmentType::ProvidentFund,
            "100200300400",
            fields,
            Some(now),
        )
        .unwrap();
        store.upsert_investment(&record).await.unwrap();

        let by_key = store
            .find_investment_by_key(user, InvestmentType::ProvidentFund, "100200300400")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key, record);
        assert!(store
            .get_investment(UserId::new(), record.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn locks_roundtrip_and_delete() {
        let store = SqliteStore::in_memory().await.unwrap();
        let user = UserId::new();
        let now = Utc::now();
        let lock = AccountLock {
            user_id: user,
            service: "nsdl".to_string(),
            locked_at: now,
            lock_until: now + Duration::minutes(15),
            reason: "too many failed attempts".to_string(),
        };
        store.upsert_account_lock(&lock).await.unwrap();
        assert_eq!(
            store.get_account_lock(user, "nsdl").await.unwrap(),
            Some(lock)
        );
        store.delete_account_lock(user, "nsdl").await.unwrap();
        assert!(store.get_account_lock(user, "nsdl").await.unwrap().is_none());
    }
}
