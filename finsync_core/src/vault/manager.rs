//! The credential vault facade.
//!
//! `CredentialVault` validates credential JSON against the service's
//! schema, encrypts it under the current key version and persists the blob
//! through `SyncStore`. It also owns the failed-attempt lockout for each
//! (user, service).

use crate::config::{Environment, LockoutConfig, VaultConfig};
use crate::models::UserId;
use crate::o11y::{mask_identifier, redact_value};
use crate::store::models::{AccountLock, CredentialRecord};
use crate::store::traits::SyncStore;
use crate::vault::cipher::Keyring;
use crate::vault::lockout::{AttemptOutcome, LockoutTracker};
use crate::vault::schema::SchemaRegistry;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroizing;

/// What the vault knows about one (user, service) without decrypting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub service: String,
    pub has_credentials: bool,
    pub key_version: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
    pub needs_rotation: bool,
    pub lock: Option<AccountLock>,
}

/// True if a blob should be re-encrypted: it was written under an older key
/// version, or it is older than the rotation interval.
pub fn needs_rotation(
    last_updated: DateTime<Utc>,
    key_version: u32,
    current_version: u32,
    rotation_interval: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    key_version < current_version || now - last_updated > rotation_interval
}

fn associated_data(user_id: UserId, service: &str) -> Vec<u8> {
    format!("{user_id}:{service}").into_bytes()
}

pub struct CredentialVault {
    store: Arc<dyn SyncStore>,
    keyring: Arc<Keyring>,
    schemas: SchemaRegistry,
    lockout: LockoutTracker,
    rotation_interval: chrono::Duration,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn SyncStore>,
        vault: &VaultConfig,
        lockout: LockoutConfig,
    ) -> Result<Self> {
        // Production-only floors are enforced by `FinsyncConfig::validate`.
        vault.validate(Environment::Development)?;
        lockout.validate()?;
        Ok(Self {
            store,
            keyring: Arc::new(Keyring::from_config(vault)?),
            schemas: SchemaRegistry::with_defaults(),
            lockout: LockoutTracker::new(lockout),
            rotation_interval: vault.rotation_interval,
        })
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn current_key_version(&self) -> u32 {
        self.keyring.current_version()
    }

    async fn seal(&self, user_id: UserId, service: &str, plaintext: Zeroizing<Vec<u8>>) -> Result<Vec<u8>> {
        let keyring = self.keyring.clone();
        let aad = associated_data(user_id, service);
        tokio::task::spawn_blocking(move || keyring.encrypt_to_bytes(&plaintext, &aad))
            .await
            .map_err(|e| Error::backend("credential encryption task", e))?
    }

    async fn open(&self, record: &CredentialRecord) -> Result<serde_json::Value> {
        let keyring = self.keyring.clone();
        let aad = associated_data(record.user_id, &record.service);
        let blob = record.ciphertext.clone();
        let plaintext =
            tokio::task::spawn_blocking(move || keyring.decrypt_bytes(&blob, &aad))
                .await
                .map_err(|e| Error::backend("credential decryption task", e))??;
        serde_json::from_slice(&plaintext)
            .map_err(|_| Error::Decryption("decrypted credentials are not valid JSON".to_string()))
    }

    /// Validate, encrypt and persist credentials, replacing any existing ones.
    #[tracing::instrument(level = "debug", skip(self, credentials))]
    pub async fn store(
        &self,
        user_id: UserId,
        service: &str,
        credentials: &serde_json::Value,
    ) -> Result<()> {
        self.schemas.validate(service, credentials)?;

        let plaintext = Zeroizing::new(
            serde_json::to_vec(credentials)
                .map_err(|e| Error::Encryption(format!("serialize credentials: {e}")))?,
        );
        let ciphertext = self.seal(user_id, service, plaintext).await?;

        let now = Utc::now();
        let created_at = self
            .store
            .get_credential(user_id, service)
            .await?
            .map(|r| r.created_at)
            .unwrap_or(now);
        self.store
            .upsert_credential(&CredentialRecord {
                user_id,
                service: service.to_string(),
                ciphertext,
                key_version: self.keyring.current_version(),
                created_at,
                updated_at: now,
            })
            .await?;
        tracing::info!(%user_id, service, key_version = self.keyring.current_version(), "credentials stored");
        Ok(())
    }

    /// Decrypt stored credentials. A failed tag check is reported as
    /// `Decryption` and never partially decoded.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve(&self, user_id: UserId, service: &str) -> Result<serde_json::Value> {
        let record = self
            .store
            .get_credential(user_id, service)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no credentials stored for '{service}'")))?;
        self.open(&record).await.inspect_err(|e| {
            if e.is_tamper_evidence() {
                tracing::error!(%user_id, service, key_version = record.key_version, "credential blob failed verification");
            }
        })
    }

    /// Like `retrieve`, but refuses while the account is locked.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve_for_use(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<serde_json::Value> {
        if let Some(lock) = self.get_lock(user_id, service).await? {
            return Err(Error::AccountLocked {
                user_id: user_id.to_string(),
                service: service.to_string(),
                until: lock.lock_until,
            });
        }
        self.retrieve(user_id, service).await
    }

    /// Remove credentials along with any lock and failure history.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, user_id: UserId, service: &str) -> Result<()> {
        if !self.store.delete_credential(user_id, service).await? {
            return Err(Error::NotFound(format!(
                "no credentials stored for '{service}'"
            )));
        }
        self.store.delete_account_lock(user_id, service).await?;
        self.lockout.clear(user_id, service);
        tracing::info!(%user_id, service, "credentials deleted");
        Ok(())
    }

    /// Re-encrypt under the current key version. Returns `false` when
    /// nothing is stored.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rotate(&self, user_id: UserId, service: &str) -> Result<bool> {
        let Some(record) = self.store.get_credential(user_id, service).await? else {
            return Ok(false);
        };
        let credentials = self.open(&record).await?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&credentials)
                .map_err(|e| Error::Encryption(format!("serialize credentials: {e}")))?,
        );
        let ciphertext = self.seal(user_id, service, plaintext).await?;
        self.store
            .upsert_credential(&CredentialRecord {
                ciphertext,
                key_version: self.keyring.current_version(),
                updated_at: Utc::now(),
                ..record.clone()
            })
            .await?;
        tracing::info!(
            %user_id,
            service,
            from_version = record.key_version,
            to_version = self.keyring.current_version(),
            "credentials rotated"
        );
        Ok(true)
    }

    /// Rotate every credential of `user_id` that is due. Returns the rotated
    /// service ids.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rotate_stale(&self, user_id: UserId) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut rotated = Vec::new();
        for record in self.store.list_credentials(user_id).await? {
            if !self.needs_rotation_at(record.updated_at, record.key_version, now) {
                continue;
            }
            if self.rotate(user_id, &record.service).await? {
                rotated.push(record.service);
            }
        }
        Ok(rotated)
    }

    pub fn needs_rotation(&self, last_updated: DateTime<Utc>, key_version: u32) -> bool {
        self.needs_rotation_at(last_updated, key_version, Utc::now())
    }

    fn needs_rotation_at(
        &self,
        last_updated: DateTime<Utc>,
        key_version: u32,
        now: DateTime<Utc>,
    ) -> bool {
        needs_rotation(
            last_updated,
            key_version,
            self.keyring.current_version(),
            self.rotation_interval,
            now,
        )
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn status(&self, user_id: UserId, service: &str) -> Result<CredentialStatus> {
        let record = self.store.get_credential(user_id, service).await?;
        let lock = self.get_lock(user_id, service).await?;
        Ok(CredentialStatus {
            service: service.to_string(),
            has_credentials: record.is_some(),
            key_version: record.as_ref().map(|r| r.key_version),
            updated_at: record.as_ref().map(|r| r.updated_at),
            needs_rotation: record
                .as_ref()
                .is_some_and(|r| self.needs_rotation(r.updated_at, r.key_version)),
            lock,
        })
    }

    pub async fn list_services(&self, user_id: UserId) -> Result<Vec<String>> {
        let mut services: Vec<String> = self
            .store
            .list_credentials(user_id)
            .await?
            .into_iter()
            .map(|r| r.service)
            .collect();
        services.sort();
        Ok(services)
    }

    /// Credentials safe to display: identifiers masked, secrets redacted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn masked(&self, user_id: UserId, service: &str) -> Result<serde_json::Value> {
        let mut value = self.retrieve(user_id, service).await?;
        let identifier_fields = self
            .schemas
            .get(service)
            .map(|s| s.identifier_fields())
            .unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            for field in identifier_fields {
                if let Some(serde_json::Value::String(s)) = obj.get_mut(&field) {
                    *s = mask_identifier(s);
                }
            }
        }
        redact_value(&mut value);
        Ok(value)
    }

    pub async fn track_failed_attempt(
        &self,
        user_id: UserId,
        service: &str,
        reason: &str,
    ) -> Result<AttemptOutcome> {
        self.track_failed_attempt_at(user_id, service, reason, Utc::now())
            .await
    }

    /// Count a failed use. Persists an `AccountLock` once the threshold is hit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn track_failed_attempt_at(
        &self,
        user_id: UserId,
        service: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let outcome = self.lockout.record_failure_at(user_id, service, now);
        match &outcome {
            AttemptOutcome::Locked(lock) => {
                let lock = AccountLock {
                    reason: format!("{}; last failure: {reason}", lock.reason),
                    ..lock.clone()
                };
                self.store.upsert_account_lock(&lock).await?;
                tracing::warn!(%user_id, service, lock_until = %lock.lock_until, "account locked after repeated failures");
                Ok(AttemptOutcome::Locked(lock))
            }
            AttemptOutcome::Counted { failures, remaining } => {
                tracing::debug!(%user_id, service, failures, remaining, "failed credential attempt");
                Ok(outcome)
            }
        }
    }

    /// Reset after a successful use.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn clear_failed_attempts(&self, user_id: UserId, service: &str) -> Result<()> {
        self.lockout.clear(user_id, service);
        self.store.delete_account_lock(user_id, service).await
    }

    pub async fn is_account_locked(&self, user_id: UserId, service: &str) -> Result<bool> {
        self.is_account_locked_at(user_id, service, Utc::now()).await
    }

    pub async fn is_account_locked_at(
        &self,
        user_id: UserId,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.get_lock_at(user_id, service, now).await?.is_some())
    }

    pub async fn get_lock(&self, user_id: UserId, service: &str) -> Result<Option<AccountLock>> {
        self.get_lock_at(user_id, service, Utc::now()).await
    }

    /// Active lock, if any. Expired locks are removed on read.
    pub async fn get_lock_at(
        &self,
        user_id: UserId,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLock>> {
        match self.store.get_account_lock(user_id, service).await? {
            Some(lock) if lock.is_active(now) => Ok(Some(lock)),
            Some(_) => {
                self.store.delete_account_lock(user_id, service).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Operator override: drop an active lock and its failure history.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn unlock(&self, user_id: UserId, service: &str) -> Result<bool> {
        let existed = self.store.get_account_lock(user_id, service).await?.is_some();
        self.clear_failed_attempts(user_id, service).await?;
        Ok(existed)
    }
}
