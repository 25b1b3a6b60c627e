use crate::models::{InvestmentType, UserId};
use crate::recovery::classify::{ProviderFailure, SyncError, SyncErrorKind};
use crate::sync::validate::{validate_records, ValidationReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the orchestrator asks a provider for.
#[derive(Clone)]
pub struct FetchRequest {
    pub user_id: UserId,
    pub investment_type: InvestmentType,
    /// External keys of the records to fetch. Empty means "everything the
    /// account holds".
    pub identifiers: Vec<String>,
    /// Decrypted credentials for the provider's service, if it needs any.
    pub credentials: Option<serde_json::Value>,
    /// Discard any cached session and log in again.
    pub reauthenticate: bool,
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("user_id", &self.user_id)
            .field("investment_type", &self.investment_type)
            .field("identifiers", &self.identifiers)
            .field("credentials", &self.credentials.as_ref().map(|_| "[REDACTED]"))
            .field("reauthenticate", &self.reauthenticate)
            .finish()
    }
}

/// One record as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub key: String,
    pub payload: serde_json::Value,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// A record in the tracker's field vocabulary, ready to merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformReport {
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<SyncError>,
}

/// An external source of investment data.
///
/// Only `fetch_data` and `is_available` suspend. Validation and transform
/// are synchronous and have defaults that most providers keep.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn id(&self) -> &str;

    fn investment_type(&self) -> InvestmentType;

    /// Vault service whose credentials `fetch_data` needs.
    fn credential_service(&self) -> Option<&str> {
        None
    }

    async fn is_available(&self) -> bool;

    async fn fetch_data(
        &self,
        request: &FetchRequest,
    ) -> std::result::Result<Vec<RawRecord>, ProviderFailure>;

    fn validate_data(&self, records: &[RawRecord]) -> ValidationReport {
        validate_records(self.investment_type(), records)
    }

    fn transform_record(
        &self,
        record: &RawRecord,
    ) -> std::result::Result<NormalizedRecord, ProviderFailure> {
        match &record.payload {
            serde_json::Value::Object(map) => Ok(NormalizedRecord {
                key: record.key.clone(),
                fields: map.clone(),
            }),
            other => Err(ProviderFailure::message(format!(
                "expected an object payload, got {}",
                json_type_name(other)
            ))),
        }
    }

    /// Transform each record independently; one failure never drops the rest.
    fn transform_data(&self, records: Vec<RawRecord>) -> TransformReport {
        let mut report = TransformReport::default();
        for record in records {
            match self.transform_record(&record) {
                Ok(normalized) => report.records.push(normalized),
                Err(failure) => report.errors.push(
                    SyncError::new(SyncErrorKind::DataParsingFailed, failure.message)
                        .for_record(record.key)
                        .from_provider(self.id()),
                ),
            }
        }
        report
    }
}

pub(crate) fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
