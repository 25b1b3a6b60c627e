use crate::models::{InvestmentRecord, InvestmentType, UserId};
use crate::sync::models::{SyncConfiguration, SyncMetadata};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use crate::store::models::{AccountLock, CredentialRecord, MetadataKey, SyncClaim};

/// Durable state owned by the sync subsystem: encrypted credentials,
/// account locks, per-type configuration and sync metadata.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<()>;
    async fn get_credential(
        &self,
        user_id: UserId,
        service: &str,
    ) -> Result<Option<CredentialRecord>>;
    /// Returns whether a row was removed.
    async fn delete_credential(&self, user_id: UserId, service: &str) -> Result<bool>;
    async fn list_credentials(&self, user_id: UserId) -> Result<Vec<CredentialRecord>>;

    async fn upsert_account_lock(&self, lock: &AccountLock) -> Result<()>;
    async fn get_account_lock(&self, user_id: UserId, service: &str)
        -> Result<Option<AccountLock>>;
    async fn delete_account_lock(&self, user_id: UserId, service: &str) -> Result<()>;

    async fn upsert_sync_configuration(&self, config: &SyncConfiguration) -> Result<()>;
    async fn get_sync_configuration(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Option<SyncConfiguration>>;
    async fn list_sync_configurations(&self, user_id: UserId) -> Result<Vec<SyncConfiguration>>;

    /// Atomically mark the claimed row `in_progress`.
    ///
    /// Returns `false` when the claim is not forced and a live (non-stale)
    /// run holds any row of the same (user, investment type), whichever
    /// scope it was taken under. Check and write must be a single operation.
    async fn try_begin_sync(&self, claim: &SyncClaim) -> Result<bool>;
    async fn upsert_sync_metadata(&self, metadata: &SyncMetadata) -> Result<()>;
    async fn get_sync_metadata(&self, key: &MetadataKey) -> Result<Option<SyncMetadata>>;
    async fn list_sync_metadata(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<SyncMetadata>>;
}

/// The tracker's investment records, as far as sync needs to see them.
#[async_trait]
pub trait InvestmentStore: Send + Sync {
    async fn get_investment(&self, user_id: UserId, id: Uuid) -> Result<Option<InvestmentRecord>>;
    async fn find_investment_by_key(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        key: &str,
    ) -> Result<Option<InvestmentRecord>>;
    async fn list_investments(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<Vec<InvestmentRecord>>;
    async fn upsert_investment(&self, record: &InvestmentRecord) -> Result<()>;
}
