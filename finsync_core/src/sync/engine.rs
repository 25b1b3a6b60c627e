//! Sync orchestration.
//!
//! A run for one (user, investment type) goes through: enabled check,
//! in-progress claim, credential fetch, provider availability, fetch with
//! retry, validation, transform, field-level merge, persist, and finally a
//! metadata update. Once the claim is taken the metadata row is always
//! finalized, so a failed run never leaves the key stuck `in_progress`.

use crate::config::RetryConfig;
use crate::models::{InvestmentRecord, InvestmentType, UserId};
use crate::o11y::redact_message;
use crate::recovery::classify::{SyncError, SyncErrorKind};
use crate::recovery::policy::{
    DefaultRecoveryPolicy, RecoveryAction, RecoveryActionKind, RecoveryContext, RecoveryPolicy,
};
use crate::store::models::{MetadataKey, SyncClaim};
use crate::store::traits::{InvestmentStore, SyncStore};
use crate::sync::merge::{merge_record, ConflictResolution, FieldConflict};
use crate::sync::metadata::{aggregate_status, metadata_for_result};
use crate::sync::models::{
    SyncConfiguration, SyncMetadata, SyncOptions, SyncResult, SyncStatus, SyncStatusReport,
};
use crate::sync::retry::{with_retry, RetryScope};
use crate::sync::traits::{DataProvider, FetchRequest, RawRecord};
use crate::vault::manager::CredentialVault;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Which records a run covers.
#[derive(Debug, Clone)]
enum Target {
    All,
    One(Box<InvestmentRecord>),
}

/// Internal result of the steps between claim and finalize.
struct RunReport {
    result: SyncResult,
    disable: Option<RecoveryAction>,
    /// Per-investment rows to write alongside the run's own row.
    touched: Vec<(Uuid, SyncStatus)>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            result: SyncResult::default(),
            disable: None,
            touched: Vec::new(),
        }
    }

    fn fail(mut self, error: SyncError) -> Self {
        self.result.success = false;
        self.result.errors.push(error);
        self
    }
}

struct FetchFailure {
    error: SyncError,
    action: Option<RecoveryAction>,
}

pub struct SyncEngine {
    sync_store: Arc<dyn SyncStore>,
    investments: Arc<dyn InvestmentStore>,
    vault: Arc<CredentialVault>,
    providers: HashMap<String, Arc<dyn DataProvider>>,
    policies: HashMap<String, Arc<dyn RecoveryPolicy>>,
    default_policy: Arc<dyn RecoveryPolicy>,
    retry: RetryConfig,
}

impl SyncEngine {
    pub fn new(
        sync_store: Arc<dyn SyncStore>,
        investments: Arc<dyn InvestmentStore>,
        vault: Arc<CredentialVault>,
        retry: RetryConfig,
    ) -> Result<Self> {
        retry.validate()?;
        Ok(Self {
            sync_store,
            investments,
            vault,
            providers: HashMap::new(),
            policies: HashMap::new(),
            default_policy: Arc::new(DefaultRecoveryPolicy::default()),
            retry,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    /// Recovery policy for one provider, replacing the general table.
    pub fn with_policy(
        mut self,
        provider_id: impl Into<String>,
        policy: Arc<dyn RecoveryPolicy>,
    ) -> Self {
        self.policies.insert(provider_id.into(), policy);
        self
    }

    pub fn with_default_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn provider_ids(&self, investment_type: InvestmentType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .providers
            .values()
            .filter(|p| p.investment_type() == investment_type)
            .map(|p| p.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn policy_for(&self, provider_id: &str) -> Arc<dyn RecoveryPolicy> {
        self.policies
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    fn resolve_provider(
        &self,
        investment_type: InvestmentType,
        config: &SyncConfiguration,
        opts: &SyncOptions,
    ) -> std::result::Result<Arc<dyn DataProvider>, SyncError> {
        let requested = opts
            .source
            .clone()
            .or_else(|| config.preferred_source.clone())
            .or_else(|| self.provider_ids(investment_type).into_iter().next());
        let Some(id) = requested else {
            return Err(SyncError::new(
                SyncErrorKind::ConfigurationError,
                format!("no data provider registered for {investment_type}"),
            ));
        };
        match self.providers.get(&id) {
            Some(p) if p.investment_type() == investment_type => Ok(p.clone()),
            Some(p) => Err(SyncError::new(
                SyncErrorKind::ConfigurationError,
                format!(
                    "provider '{id}' serves {}, not {investment_type}",
                    p.investment_type()
                ),
            )),
            None => Err(SyncError::new(
                SyncErrorKind::ConfigurationError,
                format!("unknown data provider '{id}'"),
            )),
        }
    }

    fn fallback_provider(
        &self,
        investment_type: InvestmentType,
        config: &SyncConfiguration,
        current: &str,
    ) -> Option<Arc<dyn DataProvider>> {
        let id = config.fallback_source.as_deref()?;
        if id == current {
            return None;
        }
        self.providers
            .get(id)
            .filter(|p| p.investment_type() == investment_type)
            .cloned()
    }

    /// Persisted configuration, or the opt-in defaults.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_configuration(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<SyncConfiguration> {
        Ok(self
            .sync_store
            .get_sync_configuration(user_id, investment_type)
            .await?
            .unwrap_or_else(|| SyncConfiguration::defaults(user_id, investment_type, Utc::now())))
    }

    #[tracing::instrument(level = "debug", skip(self, config), fields(user_id = %config.user_id, investment_type = %config.investment_type))]
    pub async fn set_configuration(&self, config: SyncConfiguration) -> Result<SyncConfiguration> {
        config.validate()?;
        let now = Utc::now();
        let created_at = self
            .sync_store
            .get_sync_configuration(config.user_id, config.investment_type)
            .await?
            .map(|c| c.created_at)
            .unwrap_or(now);
        let config = SyncConfiguration {
            created_at,
            updated_at: now,
            ..config
        };
        self.sync_store.upsert_sync_configuration(&config).await?;
        Ok(config)
    }

    /// Turn sync off for a (user, investment type) and record why.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disable_sync(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        reason: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut config = self.get_configuration(user_id, investment_type).await?;
        config.enabled = false;
        config.updated_at = now;
        self.sync_store.upsert_sync_configuration(&config).await?;

        let key = MetadataKey::global(user_id, investment_type);
        let mut meta = self
            .sync_store
            .get_sync_metadata(&key)
            .await?
            .unwrap_or_else(|| SyncMetadata::new(key, SyncStatus::Disabled, now));
        meta.status = SyncStatus::Disabled;
        meta.last_error = Some(redact_message(reason));
        meta.updated_at = now;
        self.sync_store.upsert_sync_metadata(&meta).await?;
        tracing::warn!(%user_id, %investment_type, reason, "sync disabled");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn status(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
    ) -> Result<SyncStatusReport> {
        let config = self.get_configuration(user_id, investment_type).await?;
        let rows = self
            .sync_store
            .list_sync_metadata(user_id, investment_type)
            .await?;
        // A disabled type stays disabled even when older per-record rows
        // still read synced; only a live run outranks it.
        let disabled = !config.enabled
            && rows
                .iter()
                .any(|r| r.key.is_global() && r.status == SyncStatus::Disabled);
        let running = rows.iter().any(|r| r.status == SyncStatus::InProgress);
        let status = if disabled && !running {
            SyncStatus::Disabled
        } else {
            aggregate_status(&rows).unwrap_or(if config.enabled {
                SyncStatus::Pending
            } else {
                SyncStatus::Manual
            })
        };
        let last_sync_at = rows.iter().filter_map(|r| r.last_sync_at).max();
        let last_error = rows
            .iter()
            .find(|r| r.key.is_global())
            .and_then(|r| r.last_error.clone())
            .or_else(|| rows.iter().find_map(|r| r.last_error.clone()));
        Ok(SyncStatusReport {
            user_id,
            investment_type,
            status,
            enabled: config.enabled,
            last_sync_at,
            last_error,
            rows,
        })
    }

    /// Sync every record of one investment type.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sync(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        opts: SyncOptions,
    ) -> Result<SyncResult> {
        let key = MetadataKey::global(user_id, investment_type);
        self.run(user_id, investment_type, key, Target::All, opts)
            .await
    }

    /// Sync one record. Records under manual override are left alone.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sync_single(
        &self,
        user_id: UserId,
        investment_id: Uuid,
        opts: SyncOptions,
    ) -> Result<SyncResult> {
        let record = self
            .investments
            .get_investment(user_id, investment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("investment {investment_id}")))?;
        let investment_type = record.investment_type;
        let key = MetadataKey::investment(user_id, investment_type, investment_id);

        if record.manual_override {
            let now = Utc::now();
            if !opts.dry_run {
                let mut meta = self
                    .sync_store
                    .get_sync_metadata(&key)
                    .await?
                    .unwrap_or_else(|| SyncMetadata::new(key.clone(), SyncStatus::Manual, now));
                meta.status = SyncStatus::Manual;
                meta.updated_at = now;
                self.sync_store.upsert_sync_metadata(&meta).await?;
            }
            tracing::info!(%user_id, %investment_id, "record under manual override; skipped");
            return Ok(SyncResult {
                success: true,
                records_processed: 1,
                warnings: vec!["record is under manual override; synced data not applied".to_string()],
                conflicts: vec![FieldConflict {
                    record_key: record.key.clone(),
                    field: None,
                    old: None,
                    new: None,
                    resolution: ConflictResolution::KeptManualOverride,
                }],
                ..SyncResult::default()
            });
        }

        self.run(
            user_id,
            investment_type,
            key,
            Target::One(Box::new(record)),
            opts,
        )
        .await
    }

    async fn run(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        key: MetadataKey,
        target: Target,
        opts: SyncOptions,
    ) -> Result<SyncResult> {
        let started = tokio::time::Instant::now();
        let now = Utc::now();

        let config = self.get_configuration(user_id, investment_type).await?;
        if !config.enabled && !opts.force {
            return Err(Error::SyncDisabled {
                user_id: user_id.to_string(),
                investment_type: investment_type.to_string(),
            });
        }

        let in_progress = || Error::SyncInProgress {
            user_id: user_id.to_string(),
            investment_type: investment_type.to_string(),
        };
        let stale_before = now - self.retry.stale_in_progress_after;
        if opts.dry_run {
            let held = self
                .sync_store
                .list_sync_metadata(user_id, investment_type)
                .await?
                .iter()
                .any(|m| m.status == SyncStatus::InProgress && m.updated_at >= stale_before);
            if held && !opts.force {
                return Err(in_progress());
            }
        } else {
            let claim = SyncClaim {
                key: key.clone(),
                source: opts.source.clone(),
                force: opts.force,
                now,
                stale_before,
            };
            if !self.sync_store.try_begin_sync(&claim).await? {
                tracing::info!(%key, "sync already in progress");
                return Err(in_progress());
            }
        }

        let mut report = match self
            .execute(user_id, investment_type, &config, &target, &opts, now)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(%key, error = %e, "sync run aborted");
                RunReport::new().fail(SyncError::new(
                    SyncErrorKind::UnknownError,
                    redact_message(&e.to_string()),
                ))
            }
        };
        report.result.duration_ms = started.elapsed().as_millis() as u64;
        if opts.dry_run {
            report
                .result
                .metadata
                .insert("dry_run".to_string(), serde_json::Value::Bool(true));
        }

        if !opts.dry_run {
            self.finalize(&key, &report, Utc::now()).await?;
            if let Some(action) = &report.disable {
                let mut config = self.get_configuration(user_id, investment_type).await?;
                config.enabled = false;
                config.updated_at = Utc::now();
                self.sync_store.upsert_sync_configuration(&config).await?;
                tracing::warn!(%user_id, %investment_type, reason = %action.reason, "sync disabled by recovery policy");
            }
        }

        let r = &report.result;
        tracing::info!(
            %key,
            success = r.success,
            processed = r.records_processed,
            updated = r.records_updated,
            skipped = r.records_skipped,
            errors = r.errors.len(),
            source = r.source.as_deref().unwrap_or(""),
            duration_ms = r.duration_ms,
            "sync finished"
        );
        Ok(report.result)
    }

    async fn finalize(&self, key: &MetadataKey, report: &RunReport, now: DateTime<Utc>) -> Result<()> {
        let mut meta = metadata_for_result(key.clone(), &report.result, now);
        if report.disable.is_some() {
            meta.status = SyncStatus::Disabled;
        }
        self.sync_store.upsert_sync_metadata(&meta).await?;

        if key.is_global() {
            for (investment_id, status) in &report.touched {
                let row_key = MetadataKey::investment(key.user_id, key.investment_type, *investment_id);
                let mut row = metadata_for_result(row_key, &report.result, now);
                row.status = *status;
                row.last_error = None;
                self.sync_store.upsert_sync_metadata(&row).await?;
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        user_id: UserId,
        investment_type: InvestmentType,
        config: &SyncConfiguration,
        target: &Target,
        opts: &SyncOptions,
        now: DateTime<Utc>,
    ) -> Result<RunReport> {
        let mut report = RunReport::new();

        let provider = match self.resolve_provider(investment_type, config, opts) {
            Ok(p) => p,
            Err(e) => return Ok(report.fail(e)),
        };

        let identifiers = match target {
            Target::All => self
                .investments
                .list_investments(user_id, investment_type)
                .await?
                .into_iter()
                .map(|r| r.key)
                .collect(),
            Target::One(record) => vec![record.key.clone()],
        };

        let mut provider = provider;
        let mut fetched = self
            .fetch_from(&provider, user_id, investment_type, config, &identifiers, true)
            .await;

        let fallback_reason = match &fetched {
            Err(FetchFailure {
                error,
                action: Some(action),
            }) if action.is(RecoveryActionKind::FallbackSource) => Some(error.message.clone()),
            _ => None,
        };
        if let Some(reason) = fallback_reason {
            if let Some(fallback) = self.fallback_provider(investment_type, config, provider.id()) {
                tracing::warn!(from = provider.id(), to = fallback.id(), "falling back to secondary source");
                report.result.warnings.push(format!(
                    "{} unavailable ({reason}); used fallback source {}",
                    provider.id(),
                    fallback.id()
                ));
                provider = fallback;
                fetched = self
                    .fetch_from(&provider, user_id, investment_type, config, &identifiers, false)
                    .await;
            }
        }
        report.result.source = Some(provider.id().to_string());

        let records = match fetched {
            Ok(records) => records,
            Err(FetchFailure { mut error, action }) => {
                if let Some(action) = action {
                    report.result.metadata.insert(
                        "recovery_action".to_string(),
                        serde_json::Value::String(action.kind.as_str().to_string()),
                    );
                    match action.kind {
                        RecoveryActionKind::DisableSync => {
                            report
                                .result
                                .warnings
                                .push(format!("sync disabled: {}", action.reason));
                            report.disable = Some(action);
                        }
                        RecoveryActionKind::Delay => {
                            let retry_at = Utc::now()
                                + chrono::Duration::milliseconds(action.delay_ms as i64);
                            error.message = format!(
                                "{}; retry after {}",
                                error.message,
                                retry_at.to_rfc3339()
                            );
                        }
                        _ => {
                            report.result.warnings.push(action.reason.clone());
                        }
                    }
                }
                error.message = redact_message(&error.message);
                return Ok(report.fail(error));
            }
        };

        report.result.records_processed = records.len() as u64;

        let validation = provider.validate_data(&records);
        report.result.records_skipped += validation.errors.len() as u64;
        report
            .result
            .errors
            .extend(validation.errors.into_iter().map(|e| e.from_provider(provider.id())));

        let transformed = provider.transform_data(validation.valid);
        report.result.records_skipped += transformed.errors.len() as u64;
        report.result.errors.extend(transformed.errors);

        for synced in transformed.records {
            let existing = match target {
                Target::One(record) if record.key != synced.key => {
                    report.result.warnings.push(format!(
                        "provider returned unrequested record '{}'; ignored",
                        synced.key
                    ));
                    report.result.records_skipped += 1;
                    continue;
                }
                Target::One(record) => Some((**record).clone()),
                Target::All => {
                    self.investments
                        .find_investment_by_key(user_id, investment_type, &synced.key)
                        .await?
                }
            };

            match existing {
                Some(mut record) => {
                    let merged = merge_record(&record, &synced);
                    report.result.conflicts.extend(merged.conflicts);
                    if record.manual_override {
                        report.touched.push((record.id, SyncStatus::Manual));
                        continue;
                    }
                    if !merged.changed {
                        report.touched.push((record.id, SyncStatus::Synced));
                        continue;
                    }
                    record.fields = merged.fields;
                    record.touch(now);
                    if !opts.dry_run {
                        self.investments.upsert_investment(&record).await?;
                    }
                    report.result.records_updated += 1;
                    report.touched.push((record.id, SyncStatus::Synced));
                }
                None => {
                    let record = match InvestmentRecord::new(
                        user_id,
                        investment_type,
                        synced.key.clone(),
                        synced.fields,
                        Some(now),
                    ) {
                        Ok(r) => r,
                        Err(e) => {
                            report.result.records_skipped += 1;
                            report.result.errors.push(
                                SyncError::new(SyncErrorKind::DataValidationFailed, e.to_string())
                                    .for_record(synced.key),
                            );
                            continue;
                        }
                    };
                    if !opts.dry_run {
                        self.investments.upsert_investment(&record).await?;
                    }
                    report.result.records_updated += 1;
                    report.touched.push((record.id, SyncStatus::Synced));
                }
            }
        }

        // Per-record errors do not fail the run.
        report.result.success = report.result.errors.iter().all(|e| e.record_key.is_some());
        Ok(report)
    }

    /// Credentials, availability and the retried fetch against one provider.
    async fn fetch_from(
        &self,
        provider: &Arc<dyn DataProvider>,
        user_id: UserId,
        investment_type: InvestmentType,
        config: &SyncConfiguration,
        identifiers: &[String],
        allow_fallback: bool,
    ) -> std::result::Result<Vec<RawRecord>, FetchFailure> {
        let has_fallback = allow_fallback
            && self
                .fallback_provider(investment_type, config, provider.id())
                .is_some();
        let policy = self.policy_for(provider.id());
        let scope = RetryScope {
            user_id,
            provider: provider.id().to_string(),
            has_fallback,
        };

        let credentials = match provider.credential_service() {
            None => None,
            Some(service) => match self.vault.retrieve_for_use(user_id, service).await {
                Ok(c) => Some(c),
                Err(e) => {
                    let message = match &e {
                        Error::AccountLocked { until, .. } => {
                            format!("credentials for '{service}' are locked until {until}")
                        }
                        Error::NotFound(_) => format!("no credentials stored for '{service}'"),
                        other => format!("credentials for '{service}' unusable: {other}"),
                    };
                    let error = SyncError::new(SyncErrorKind::CredentialError, message)
                        .from_provider(provider.id());
                    // A lock expires on its own; wait it out instead of disabling.
                    let action = match &e {
                        Error::AccountLocked { until, .. } => RecoveryAction::delayed(
                            (*until - Utc::now()).to_std().unwrap_or_default(),
                            "credentials temporarily locked",
                        ),
                        _ => policy.recommend(
                            &error,
                            &RecoveryContext {
                                user_id,
                                provider: provider.id().to_string(),
                                attempt: 1,
                                has_fallback,
                                now: Utc::now(),
                            },
                        ),
                    };
                    return Err(FetchFailure {
                        error,
                        action: Some(action),
                    });
                }
            },
        };

        if !provider.is_available().await {
            let error = SyncError::new(
                SyncErrorKind::ServiceUnavailable,
                format!("provider '{}' reports unavailable", provider.id()),
            )
            .from_provider(provider.id());
            let action = policy.recommend(
                &error,
                &RecoveryContext {
                    user_id,
                    provider: provider.id().to_string(),
                    attempt: 1,
                    has_fallback,
                    now: Utc::now(),
                },
            );
            return Err(FetchFailure {
                error,
                action: Some(action),
            });
        }

        let outcome = with_retry(&self.retry, policy.as_ref(), &scope, |attempt| {
            let request = FetchRequest {
                user_id,
                investment_type,
                identifiers: identifiers.to_vec(),
                credentials: credentials.clone(),
                reauthenticate: attempt.reauthenticate,
            };
            let provider = provider.clone();
            async move { provider.fetch_data(&request).await }
        })
        .await;

        let service = provider.credential_service();
        match outcome.result {
            Ok(records) => {
                if let Some(service) = service {
                    if let Err(e) = self.vault.clear_failed_attempts(user_id, service).await {
                        tracing::warn!(service, error = %e, "failed to clear credential failures");
                    }
                }
                Ok(records)
            }
            Err(error) => {
                if let (true, Some(service)) = (error.kind.is_credential_related(), service) {
                    if let Err(e) = self
                        .vault
                        .track_failed_attempt(user_id, service, &redact_message(&error.message))
                        .await
                    {
                        tracing::warn!(service, error = %e, "failed to record credential failure");
                    }
                }
                Err(FetchFailure {
                    error,
                    action: outcome.last_action,
                })
            }
        }
    }
}
