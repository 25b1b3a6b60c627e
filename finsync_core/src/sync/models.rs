use crate::models::{InvestmentType, UserId};
use crate::recovery::classify::SyncError;
use crate::store::models::MetadataKey;
use crate::sync::merge::FieldConflict;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Outcome recorded for the most recent sync attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Manual,
    Synced,
    Failed,
    InProgress,
    Disabled,
    Pending,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Manual => "manual",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Disabled => "disabled",
            SyncStatus::Pending => "pending",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(SyncStatus::Manual),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "in_progress" => Ok(SyncStatus::InProgress),
            "disabled" => Ok(SyncStatus::Disabled),
            "pending" => Ok(SyncStatus::Pending),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl SyncFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFrequency::Hourly => "hourly",
            SyncFrequency::Daily => "daily",
            SyncFrequency::Weekly => "weekly",
            SyncFrequency::Monthly => "monthly",
        }
    }
}

impl FromStr for SyncFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(SyncFrequency::Hourly),
            "daily" => Ok(SyncFrequency::Daily),
            "weekly" => Ok(SyncFrequency::Weekly),
            "monthly" => Ok(SyncFrequency::Monthly),
            other => Err(Error::InvalidInput(format!(
                "unknown sync frequency '{other}'"
            ))),
        }
    }
}

/// Per (user, investment type) sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub user_id: UserId,
    pub investment_type: InvestmentType,
    pub enabled: bool,
    pub frequency: SyncFrequency,
    pub preferred_source: Option<String>,
    pub fallback_source: Option<String>,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfiguration {
    /// Defaults used until the user writes a configuration. Sync is opt-in.
    pub fn defaults(user_id: UserId, investment_type: InvestmentType, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            investment_type,
            enabled: false,
            frequency: SyncFrequency::Daily,
            preferred_source: None,
            fallback_source: None,
            notify_on_success: false,
            notify_on_failure: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("preferred_source", &self.preferred_source),
            ("fallback_source", &self.fallback_source),
        ] {
            if let Some(v) = value {
                if v.trim().is_empty() {
                    return Err(Error::InvalidInput(format!("{name} is empty")));
                }
            }
        }
        if self.preferred_source.is_some() && self.preferred_source == self.fallback_source {
            return Err(Error::InvalidInput(
                "fallback_source must differ from preferred_source".to_string(),
            ));
        }
        Ok(())
    }
}

/// Persisted outcome of the latest attempt for one metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub key: MetadataKey,
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub last_error: Option<String>,
    /// Short digest used to detect whether consecutive runs changed anything.
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncMetadata {
    pub fn new(key: MetadataKey, status: SyncStatus, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status,
            last_sync_at: None,
            source: None,
            last_error: None,
            content_hash: None,
            updated_at: now,
        }
    }
}

/// Caller options for a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Skip the enabled and in-progress checks.
    pub force: bool,
    /// Fetch, validate and merge, but persist nothing.
    pub dry_run: bool,
    /// Provider to use instead of the configured preference.
    pub source: Option<String>,
}

/// Report of one sync run. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub records_processed: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<String>,
    pub conflicts: Vec<FieldConflict>,
    pub duration_ms: u64,
    pub source: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Aggregated status across a (user, investment type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub user_id: UserId,
    pub investment_type: InvestmentType,
    pub status: SyncStatus,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rows: Vec<SyncMetadata>,
}
