//! Failure taxonomy and recovery decisions.

pub mod classify;
pub mod policy;
pub mod portal;

pub use classify::{classify, ProviderFailure, SyncError, SyncErrorKind};
pub use policy::{
    DefaultRecoveryPolicy, RecoveryAction, RecoveryActionKind, RecoveryContext, RecoveryPolicy,
};
pub use portal::{PortalPolicyConfig, PortalRecoveryPolicy};
