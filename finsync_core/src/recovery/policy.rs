use crate::models::UserId;
use crate::recovery::classify::{SyncError, SyncErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Retry,
    Delay,
    SkipRecord,
    FallbackSource,
    DisableSync,
    ManualIntervention,
    Ignore,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::Retry => "retry",
            RecoveryActionKind::Delay => "delay",
            RecoveryActionKind::SkipRecord => "skip_record",
            RecoveryActionKind::FallbackSource => "fallback_source",
            RecoveryActionKind::DisableSync => "disable_sync",
            RecoveryActionKind::ManualIntervention => "manual_intervention",
            RecoveryActionKind::Ignore => "ignore",
        }
    }
}

impl std::fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do about a classified failure. A decision, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    /// Wait before acting (or cool-down for `disable_sync`).
    pub delay_ms: u64,
    pub reason: String,
    /// Upper bound on retries this action permits.
    pub max_retries: u32,
    /// Retry must force a fresh login with the provider.
    pub reauthenticate: bool,
}

impl RecoveryAction {
    pub fn new(kind: RecoveryActionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            delay_ms: 0,
            reason: reason.into(),
            max_retries: 0,
            reauthenticate: false,
        }
    }

    pub fn retry(max_retries: u32, reason: impl Into<String>) -> Self {
        Self {
            max_retries,
            ..Self::new(RecoveryActionKind::Retry, reason)
        }
    }

    pub fn delayed(delay: Duration, reason: impl Into<String>) -> Self {
        Self::new(RecoveryActionKind::Delay, reason).with_delay(delay)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_reauthentication(mut self) -> Self {
        self.reauthenticate = true;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn is(&self, kind: RecoveryActionKind) -> bool {
        self.kind == kind
    }
}

/// Facts a policy may consult besides the error itself.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub user_id: UserId,
    pub provider: String,
    /// 1-based attempt number that just failed.
    pub attempt: u32,
    pub has_fallback: bool,
    pub now: DateTime<Utc>,
}

/// Maps classified failures to recovery actions.
///
/// Policies may keep state across calls (outage timers, failure counts);
/// they are shared by every run that uses the same provider.
pub trait RecoveryPolicy: Send + Sync {
    fn recommend(&self, error: &SyncError, ctx: &RecoveryContext) -> RecoveryAction;

    /// Called after a successful fetch; resets any escalation state.
    fn record_success(&self, _ctx: &RecoveryContext) {}
}

/// The general recovery table.
#[derive(Debug, Clone)]
pub struct DefaultRecoveryPolicy {
    pub network_max_retries: u32,
    pub rate_limit_default_delay: Duration,
    pub unavailable_delay: Duration,
}

impl Default for DefaultRecoveryPolicy {
    fn default() -> Self {
        Self {
            network_max_retries: 5,
            rate_limit_default_delay: Duration::from_secs(60),
            unavailable_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RecoveryPolicy for DefaultRecoveryPolicy {
    fn recommend(&self, error: &SyncError, ctx: &RecoveryContext) -> RecoveryAction {
        match error.kind {
            SyncErrorKind::NetworkError | SyncErrorKind::NetworkTimeout => RecoveryAction::retry(
                self.network_max_retries,
                format!("transient {}; retrying with backoff", error.kind),
            ),
            SyncErrorKind::RateLimitExceeded => {
                let wait = error.retry_after().unwrap_or(self.rate_limit_default_delay);
                RecoveryAction::delayed(wait, "rate limited by provider")
            }
            SyncErrorKind::AuthenticationFailed | SyncErrorKind::CredentialError => {
                RecoveryAction::new(
                    RecoveryActionKind::DisableSync,
                    "credentials rejected; sync disabled until they are updated",
                )
            }
            SyncErrorKind::AuthorizationFailed => RecoveryAction::new(
                RecoveryActionKind::ManualIntervention,
                "provider denied access to the requested data",
            ),
            SyncErrorKind::DataValidationFailed | SyncErrorKind::DataParsingFailed => {
                RecoveryAction::new(
                    RecoveryActionKind::SkipRecord,
                    "record rejected; continuing with the rest of the batch",
                )
            }
            SyncErrorKind::ServiceUnavailable if ctx.has_fallback => RecoveryAction::new(
                RecoveryActionKind::FallbackSource,
                "provider unavailable; switching to fallback source",
            ),
            SyncErrorKind::ServiceUnavailable => {
                RecoveryAction::delayed(self.unavailable_delay, "provider unavailable")
            }
            SyncErrorKind::ConfigurationError => RecoveryAction::new(
                RecoveryActionKind::ManualIntervention,
                "sync configuration is invalid",
            ),
            SyncErrorKind::UnknownError if ctx.attempt <= 1 => {
                RecoveryAction::retry(1, "unrecognised failure; retrying once")
            }
            SyncErrorKind::UnknownError => RecoveryAction::new(
                RecoveryActionKind::ManualIntervention,
                "unrecognised failure persisted after retry",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: u32, has_fallback: bool) -> RecoveryContext {
        RecoveryContext {
            user_id: UserId::new(),
            provider: "p".to_string(),
            attempt,
            has_fallback,
            now: Utc::now(),
        }
    }

    fn recommend(kind: SyncErrorKind, attempt: u32, has_fallback: bool) -> RecoveryAction {
        DefaultRecoveryPolicy::default().recommend(&SyncError::new(kind, "x"), &ctx(attempt, has_fallback))
    }

    #[test]
    fn general_table() {
        assert!(recommend(SyncErrorKind::NetworkError, 1, false).is(RecoveryActionKind::Retry));
        assert!(recommend(SyncErrorKind::NetworkTimeout, 1, false).is(RecoveryActionKind::Retry));
        assert!(recommend(SyncErrorKind::AuthenticationFailed, 1, false)
            .is(RecoveryActionKind::DisableSync));
        assert!(recommend(SyncErrorKind::CredentialError, 1, false)
            .is(RecoveryActionKind::DisableSync));
        assert!(recommend(SyncErrorKind::DataValidationFailed, 1, false)
            .is(RecoveryActionKind::SkipRecord));
        assert!(recommend(SyncErrorKind::ServiceUnavailable, 1, true)
            .is(RecoveryActionKind::FallbackSource));
        assert!(recommend(SyncErrorKind::ServiceUnavailable, 1, false)
            .is(RecoveryActionKind::Delay));
    }

    #[test]
    fn rate_limit_prefers_provider_wait() {
        let policy = DefaultRecoveryPolicy::default();
        let mut err = SyncError::new(SyncErrorKind::RateLimitExceeded, "429");
        let action = policy.recommend(&err, &ctx(1, false));
        assert_eq!(action.delay(), Duration::from_secs(60));

        err.retry_after_ms = Some(2_500);
        let action = policy.recommend(&err, &ctx(1, false));
        assert!(action.is(RecoveryActionKind::Delay));
        assert_eq!(action.delay(), Duration::from_millis(2_500));
    }

    #[test]
    fn unknown_errors_escalate_after_one_retry() {
        let first = recommend(SyncErrorKind::UnknownError, 1, false);
        assert!(first.is(RecoveryActionKind::Retry));
        assert_eq!(first.max_retries, 1);
        assert!(recommend(SyncErrorKind::UnknownError, 2, false)
            .is(RecoveryActionKind::ManualIntervention));
    }
}
