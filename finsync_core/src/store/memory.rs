use crate::models::{InvestmentRecord, InvestmentType, UserId};
use crate::store::models::{AccountLock, CredentialRecord, MetadataKey, SyncClaim};
use crate::store::traits::{InvestmentStore, SyncStore};
use crate::sync::models::{SyncConfiguration, SyncMetadata, SyncStatus};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type ServiceKey = (UserId, String);

#[derive(Default)]
struct Inner {
    credentials: HashMap<ServiceKey, CredentialRecord>,
    locks: HashMap<ServiceKey, AccountLock>,
    configurations: HashMap<(UserId, InvestmentType), SyncConfiguration>,
    metadata: HashMap<MetadataKey, SyncMetadata>,
    investments: HashMap<Uuid, InvestmentRecord>,
}

/// In-process store for tests and local tooling. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.credentials.insert(
            (record.user_id, record.service.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_credential(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<Option<CredentialRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .credentials
            .get(&(user_id, service.to_string()))
            .cloned())
    }

    async fn delete_credential(&self, user_id: UserId, service: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .credentials
            .remove(&(user_id, service.to_string()))
            .is_some())
    }

    async fn list_credentials(&self, user_id: UserId) -> Result<Vec<CredentialRecord>> {
        let inner = self.inner.read().await;
        let mut out: Vec<CredentialRecord> = inner
            .credentials
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(out)
    }

    async fn upsert_account_lock(&self, lock: &AccountLock) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .locks
            .insert((lock.user_id, lock.service.clone()), lock.clone());
        Ok(())
    }

    async fn get_account_lock(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<Option<AccountLock>> {
        let inner = self.inner.read().await;
        Ok(inner.locks.get(&(user_id, service.to_string())).cloned())
    }

    async fn delete_account_lock(&self, user_id: UserId, service: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.locks.remove(&(user_id, service.to_string()));
        Ok(())
    }

    async fn upsert_sync_configuration(&self, config: &SyncConfiguration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .configurations
            .insert((config.user_id, config.investment_type), config.clone());
        Ok(())
    }

    async fn get_sync_configuration(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Option<SyncConfiguration>> {
        let inner = self.inner.read().await;
        Ok(inner
            .configurations
            .get(&(user_id, investment_type))
            .cloned())
    }

    async fn list_sync_configurations(&self, user_id: UserId) -> Result<Vec<SyncConfiguration>> {
        let inner = self.inner.read().await;
        let mut out: Vec<SyncConfiguration> = inner
            .configurations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.investment_type);
        Ok(out)
    }

    async fn try_begin_sync(&self, claim: &SyncClaim) -> Result<bool> {
        // Check and write under one write guard.
        let mut inner = self.inner.write().await;
        let held = inner.metadata.values().any(|m| {
            m.key.user_id == claim.key.user_id
                && m.key.investment_type == claim.key.investment_type
                && m.status == SyncStatus::InProgress
                && m.updated_at >= claim.stale_before
        });
        if held && !claim.force {
            return Ok(false);
        }
        if let Some(current) = inner.metadata.get_mut(&claim.key) {
            current.status = SyncStatus::InProgress;
            current.source = claim.source.clone();
            current.updated_at = claim.now;
            return Ok(true);
        }
        let mut row = SyncMetadata::new(claim.key.clone(), SyncStatus::InProgress, claim.now);
        row.source = claim.source.clone();
        inner.metadata.insert(claim.key.clone(), row);
        Ok(true)
    }

    async fn upsert_sync_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .metadata
            .insert(metadata.key.clone(), metadata.clone());
        Ok(())
    }

    async fn get_sync_metadata(&self, key: &MetadataKey) -> Result<Option<SyncMetadata>> {
        let inner = self.inner.read().await;
        Ok(inner.metadata.get(key).cloned())
    }

    async fn list_sync_metadata(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<SyncMetadata>> {
        let inner = self.inner.read().await;
        let mut out: Vec<SyncMetadata> = inner
            .metadata
            .values()
            .filter(|m| m.key.user_id == user_id && m.key.investment_type == investment_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.scope.cmp(&b.key.scope));
        Ok(out)
    }
}

#[async_trait]
impl InvestmentStore for MemoryStore {
    async fn get_investment(&self, user_id: UserId, id: Uuid) -> Result<Option<InvestmentRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .investments
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .cloned())
    }

    async fn find_investment_by_key(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        key: &str,
    ) -> Result<Option<InvestmentRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .investments
            .values()
            .find(|r| r.user_id == user_id && r.investment_type == investment_type && r.key == key)
            .cloned())
    }

    async fn list_investments(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<InvestmentRecord>> {
        let inner = self.inner.read().await;
        let mut out: Vec<InvestmentRecord> = inner
            .investments
            .values()
            .filter(|r| r.user_id == user_id && r.investment_type == investment_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn upsert_investment(&self, record: &InvestmentRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.investments.insert(record.id, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claim(key: &MetadataKey, force: bool) -> SyncClaim {
        let now = Utc::now();
        SyncClaim {
            key: key.clone(),
            source: Some("p".to_string()),
            force,
            now,
            stale_before: now - chrono::Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let key = MetadataKey::global(UserId::new(), InvestmentType::Stock);

        assert!(store.try_begin_sync(&claim(&key, false)).await.unwrap());
        assert!(!store.try_begin_sync(&claim(&key, false)).await.unwrap());
        assert!(store.try_begin_sync(&claim(&key, true)).await.unwrap());

        let mut row = store.get_sync_metadata(&key).await.unwrap().unwrap();
        row.status = SyncStatus::Synced;
        store.upsert_sync_metadata(&row).await.unwrap();
        assert!(store.try_begin_sync(&claim(&key, false)).await.unwrap());
    }

    #[tokio::test]
    async fn live_run_blocks_every_scope_of_the_same_type() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let global = MetadataKey::global(user, InvestmentType::ProvidentFund);
        let one = MetadataKey::investment(user, InvestmentType::ProvidentFund, Uuid::new_v4());
        let other_type = MetadataKey::global(user, InvestmentType::Stock);

        assert!(store.try_begin_sync(&claim(&one, false)).await.unwrap());
        assert!(!store.try_begin_sync(&claim(&global, false)).await.unwrap());
        assert!(store.try_begin_sync(&claim(&other_type, false)).await.unwrap());
        assert!(store.try_begin_sync(&claim(&global, true)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_admit_exactly_one() {
        let store = MemoryStore::new();
        let key = MetadataKey::global(UserId::new(), InvestmentType::MutualFund);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let c = claim(&key, false);
            handles.push(tokio::spawn(async move { store.try_begin_sync(&c).await.unwrap() }));
        }
        let mut won = 0;
        for h in handles {
            if h.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn metadata_rows_are_scoped() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let global = MetadataKey::global(user, InvestmentType::Stock);
        let one = MetadataKey::investment(user, InvestmentType::Stock, Uuid::new_v4());
        let other_type = MetadataKey::global(user, InvestmentType::Sip);
        for key in [&global, &one, &other_type] {
            store
                .upsert_sync_metadata(&SyncMetadata::new(key.clone(), SyncStatus::Synced, Utc::now()))
                .await
                .unwrap();
        }
        let rows = store
            .list_sync_metadata(user, InvestmentType::Stock)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
