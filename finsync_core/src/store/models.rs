use crate::models::{InvestmentType, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scope label for the run-wide metadata row of a (user, investment type).
pub const GLOBAL_SCOPE: &str = "global";

/// Encrypted credential row. At most one per (user, service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: UserId,
    pub service: String,
    /// Encoded `EncryptedBlob`; plaintext never reaches storage.
    pub ciphertext: Vec<u8>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Temporary lock after repeated failed credential use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLock {
    pub user_id: UserId,
    pub service: String,
    pub locked_at: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,
    pub reason: String,
}

impl AccountLock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.lock_until
    }
}

/// Identifies one sync metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataKey {
    pub user_id: UserId,
    pub investment_type: InvestmentType,
    /// Investment id, or `GLOBAL_SCOPE` for the run as a whole.
    pub scope: String,
}

impl MetadataKey {
    pub fn global(user_id: UserId, investment_type: InvestmentType) -> Self {
        Self {
            user_id,
            investment_type,
            scope: GLOBAL_SCOPE.to_string(),
        }
    }

    pub fn investment(
        user_id: UserId,
        investment_type: InvestmentType,
        investment_id: uuid::Uuid,
    ) -> Self {
        Self {
            user_id,
            investment_type,
            scope: investment_id.to_string(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.investment_type, self.scope)
    }
}

/// Request to atomically mark a metadata row `in_progress`.
#[derive(Debug, Clone)]
pub struct SyncClaim {
    pub key: MetadataKey,
    pub source: Option<String>,
    /// Take the row even if another run holds it.
    pub force: bool,
    pub now: DateTime<Utc>,
    /// `in_progress` rows last touched before this instant are reclaimable.
    pub stale_before: DateTime<Utc>,
}
