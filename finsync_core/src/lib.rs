//! finsync core library: credential vault, sync orchestration, error
//! recovery and sync metadata for an investment tracker.

pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod recovery;
pub mod store;
pub mod sync;
pub mod vault;

pub use config::{FinsyncConfig, LockoutConfig, LogConfig, RetryConfig, VaultConfig};
pub use error::{Error, Result};
pub use models::{InvestmentRecord, InvestmentType, UserId};
pub use recovery::{
    classify, DefaultRecoveryPolicy, PortalRecoveryPolicy, ProviderFailure, RecoveryAction,
    RecoveryActionKind, RecoveryPolicy, SyncError, SyncErrorKind,
};
pub use store::memory::MemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::traits::{InvestmentStore, SyncStore};
pub use sync::{
    DataProvider, SyncConfiguration, SyncEngine, SyncOptions, SyncResult, SyncStatus,
    SyncStatusReport,
};
pub use vault::{CredentialVault, SchemaRegistry};
