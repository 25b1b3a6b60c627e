use crate::o11y::redact_message;
use crate::store::models::MetadataKey;
use crate::sync::models::{SyncMetadata, SyncResult, SyncStatus};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

fn priority(status: SyncStatus) -> u8 {
    match status {
        SyncStatus::InProgress => 5,
        SyncStatus::Failed => 4,
        SyncStatus::Synced => 3,
        SyncStatus::Pending => 2,
        SyncStatus::Disabled => 1,
        SyncStatus::Manual => 0,
    }
}

/// Collapse per-investment rows into one status:
/// `in_progress > failed > synced > pending > disabled > manual`.
pub fn aggregate_status<'a>(rows: impl IntoIterator<Item = &'a SyncMetadata>) -> Option<SyncStatus> {
    rows.into_iter().map(|r| r.status).max_by_key(|s| priority(*s))
}

/// 16 hex chars over (processed, updated, source, UTC date). Equal hashes
/// on consecutive days' runs mean nothing changed.
pub fn content_hash(
    records_processed: u64,
    records_updated: u64,
    source: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(records_processed.to_be_bytes());
    hasher.update(records_updated.to_be_bytes());
    hasher.update(source.unwrap_or("").as_bytes());
    hasher.update(at.date_naive().to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Metadata row describing a finished run.
pub fn metadata_for_result(key: MetadataKey, result: &SyncResult, now: DateTime<Utc>) -> SyncMetadata {
    let status = if result.success {
        SyncStatus::Synced
    } else {
        SyncStatus::Failed
    };
    let last_error = if result.success {
        None
    } else {
        result.errors.last().map(|e| redact_message(&e.to_string()))
    };
    SyncMetadata {
        key,
        status,
        last_sync_at: Some(now),
        source: result.source.clone(),
        last_error,
        content_hash: Some(content_hash(
            result.records_processed,
            result.records_updated,
            result.source.as_deref(),
            now,
        )),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvestmentType, UserId};

    fn row(status: SyncStatus) -> SyncMetadata {
        SyncMetadata::new(
            MetadataKey::global(UserId::new(), InvestmentType::Stock),
            status,
            Utc::now(),
        )
    }

    #[test]
    fn aggregation_priority() {
        let rows = [row(SyncStatus::Synced), row(SyncStatus::Failed), row(SyncStatus::Synced)];
        assert_eq!(aggregate_status(&rows), Some(SyncStatus::Failed));

        let rows = [row(SyncStatus::Failed), row(SyncStatus::InProgress)];
        assert_eq!(aggregate_status(&rows), Some(SyncStatus::InProgress));

        let rows = [row(SyncStatus::Manual), row(SyncStatus::Synced)];
        assert_eq!(aggregate_status(&rows), Some(SyncStatus::Synced));

        assert_eq!(aggregate_status(&Vec::<SyncMetadata>::new()), None);
    }

    #[test]
    fn hash_is_short_and_sensitive_to_inputs() {
        let now = Utc::now();
        let h = content_hash(10, 2, Some("amfi"), now);
        assert_eq!(h.len(), 16);
        assert_eq!(h, content_hash(10, 2, Some("amfi"), now));
        assert_ne!(h, content_hash(10, 3, Some("amfi"), now));
        assert_ne!(h, content_hash(10, 2, Some("other"), now));
        assert_ne!(h, content_hash(10, 2, Some("amfi"), now + chrono::Duration::days(1)));
    }

    #[test]
    fn failed_result_keeps_last_error() {
        use crate::recovery::classify::{SyncError, SyncErrorKind};
        let result = SyncResult {
            success: false,
            errors: vec![SyncError::new(SyncErrorKind::NetworkTimeout, "timed out")],
            ..SyncResult::default()
        };
        let m = metadata_for_result(
            MetadataKey::global(UserId::new(), InvestmentType::Stock),
            &result,
            Utc::now(),
        );
        assert_eq!(m.status, SyncStatus::Failed);
        assert_eq!(m.last_error.as_deref(), Some("network_timeout: timed out"));
    }
}
