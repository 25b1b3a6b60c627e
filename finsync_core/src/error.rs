use std::error::Error as StdError;

use crate::recovery::classify::SyncError;

/// Common error type for `finsync_core`.
///
/// Storage backends preserve the underlying error chain via `Error::backend`.
/// Variants never carry plaintext credential material.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Credential or record shape rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    /// Authentication tag mismatch, unknown key version or malformed blob.
    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sync already in progress for {user_id}/{investment_type}")]
    SyncInProgress {
        user_id: String,
        investment_type: String,
    },

    #[error("sync disabled for {user_id}/{investment_type}")]
    SyncDisabled {
        user_id: String,
        investment_type: String,
    },

    #[error("account locked for {user_id}/{service} until {until}")]
    AccountLocked {
        user_id: String,
        service: String,
        until: chrono::DateTime<chrono::Utc>,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "finsync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for failures that indicate tampering or key mismatch rather than
    /// a transient condition.
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(self, Error::Decryption(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
