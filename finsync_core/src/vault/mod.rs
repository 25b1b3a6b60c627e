//! Credential vault: key derivation, AEAD blobs, per-service schemas and
//! failed-attempt lockout.

pub mod cipher;
pub mod lockout;
pub mod manager;
pub mod schema;

pub use cipher::{EncryptedBlob, Keyring, MasterKey};
pub use lockout::{AttemptOutcome, LockoutTracker};
pub use manager::{needs_rotation, CredentialStatus, CredentialVault};
pub use schema::{ApiKeySchema, CredentialSchema, PortalLoginSchema, SchemaRegistry};
