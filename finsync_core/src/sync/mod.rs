//! Sync orchestration: provider seam, validation, field-level merge,
//! bounded retry and metadata bookkeeping.

pub mod engine;
pub mod merge;
pub mod metadata;
pub mod models;
pub mod retry;
mod test_support;
pub mod traits;
pub mod validate;

pub use engine::SyncEngine;
pub use merge::{merge_fields, merge_record, ConflictResolution, FieldConflict, MergeOutcome};
pub use metadata::{aggregate_status, content_hash};
pub use models::{
    SyncConfiguration, SyncFrequency, SyncMetadata, SyncOptions, SyncResult, SyncStatus,
    SyncStatusReport,
};
pub use retry::{with_retry, Attempt, RetryOutcome, RetryScope};
pub use traits::{DataProvider, FetchRequest, NormalizedRecord, RawRecord, TransformReport};
pub use validate::{validate_records, ValidationReport};
