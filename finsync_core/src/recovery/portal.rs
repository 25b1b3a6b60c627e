//! Recovery policy for portal-backed sources (scraped web logins such as
//! the provident-fund authority).
//!
//! Portals fail in ways APIs don't: CAPTCHA walls, scheduled maintenance,
//! expiring sessions. This policy recognises those, tracks continuous
//! outages across runs and counts credential rejections per user, then
//! defers to the general table for everything else.

use crate::models::UserId;
use crate::recovery::classify::{SyncError, SyncErrorKind};
use crate::recovery::policy::{
    DefaultRecoveryPolicy, RecoveryAction, RecoveryActionKind, RecoveryContext, RecoveryPolicy,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PortalPolicyConfig {
    pub maintenance_delay: Duration,
    /// Continuous downtime after which delays escalate to a disable.
    pub outage_threshold: chrono::Duration,
    pub outage_cooldown: Duration,
    /// Credential rejections per user before a security-locked disable.
    pub credential_failure_cap: u32,
    pub security_lock_cooldown: Duration,
}

impl Default for PortalPolicyConfig {
    fn default() -> Self {
        Self {
            maintenance_delay: Duration::from_secs(4 * 60 * 60),
            outage_threshold: chrono::Duration::minutes(30),
            outage_cooldown: Duration::from_secs(6 * 60 * 60),
            credential_failure_cap: 3,
            security_lock_cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct PortalRecoveryPolicy {
    cfg: PortalPolicyConfig,
    general: DefaultRecoveryPolicy,
    outage_started: Mutex<Option<DateTime<Utc>>>,
    credential_failures: DashMap<UserId, u32>,
}

impl PortalRecoveryPolicy {
    pub fn new(cfg: PortalPolicyConfig) -> Self {
        Self {
            cfg,
            general: DefaultRecoveryPolicy::default(),
            outage_started: Mutex::new(None),
            credential_failures: DashMap::new(),
        }
    }

    pub fn with_general(mut self, general: DefaultRecoveryPolicy) -> Self {
        self.general = general;
        self
    }

    /// How long the portal has been continuously failing, if it is.
    pub fn outage_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = *self
            .outage_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started.map(|s| now - s)
    }

    pub fn credential_failures(&self, user_id: UserId) -> u32 {
        self.credential_failures
            .get(&user_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    fn note_outage(&self, now: DateTime<Utc>) -> chrono::Duration {
        let mut started = self
            .outage_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let since = *started.get_or_insert(now);
        now - since
    }

    fn credential_failure(&self, error: &SyncError, ctx: &RecoveryContext) -> RecoveryAction {
        let failures = {
            let mut entry = self.credential_failures.entry(ctx.user_id).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        if failures >= self.cfg.credential_failure_cap {
            tracing::warn!(
                user_id = %ctx.user_id,
                provider = %ctx.provider,
                failures,
                "portal credential failures reached cap; security lock"
            );
            return RecoveryAction::new(
                RecoveryActionKind::DisableSync,
                format!(
                    "security lock: {failures} consecutive credential failures for this portal"
                ),
            )
            .with_delay(self.cfg.security_lock_cooldown);
        }
        RecoveryAction::new(
            RecoveryActionKind::ManualIntervention,
            format!(
                "portal rejected credentials ({failures}/{}): {}",
                self.cfg.credential_failure_cap, error.message
            ),
        )
    }
}

impl Default for PortalRecoveryPolicy {
    fn default() -> Self {
        Self::new(PortalPolicyConfig::default())
    }
}

impl RecoveryPolicy for PortalRecoveryPolicy {
    fn recommend(&self, error: &SyncError, ctx: &RecoveryContext) -> RecoveryAction {
        let msg = error.message.to_ascii_lowercase();

        if msg.contains("captcha") {
            return RecoveryAction::new(
                RecoveryActionKind::ManualIntervention,
                "portal requires a CAPTCHA; log in manually once",
            );
        }
        if msg.contains("maintenance") || msg.contains("scheduled downtime") {
            return RecoveryAction::delayed(
                self.cfg.maintenance_delay,
                "portal is in a maintenance window",
            );
        }
        if msg.contains("session expired")
            || msg.contains("session has expired")
            || msg.contains("session timed out")
        {
            return RecoveryAction::retry(1, "portal session expired; logging in again")
                .with_reauthentication();
        }

        match error.kind {
            SyncErrorKind::AuthenticationFailed | SyncErrorKind::CredentialError => {
                self.credential_failure(error, ctx)
            }
            SyncErrorKind::ServiceUnavailable
            | SyncErrorKind::NetworkError
            | SyncErrorKind::NetworkTimeout => {
                let down_for = self.note_outage(ctx.now);
                if down_for >= self.cfg.outage_threshold {
                    tracing::warn!(
                        provider = %ctx.provider,
                        down_minutes = down_for.num_minutes(),
                        "portal outage exceeded threshold; disabling sync"
                    );
                    return RecoveryAction::new(
                        RecoveryActionKind::DisableSync,
                        format!(
                            "portal unreachable for {} minutes",
                            down_for.num_minutes()
                        ),
                    )
                    .with_delay(self.cfg.outage_cooldown);
                }
                self.general.recommend(error, ctx)
            }
            _ => self.general.recommend(error, ctx),
        }
    }

    fn record_success(&self, ctx: &RecoveryContext) {
        *self
            .outage_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.credential_failures.remove(&ctx.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user_id: UserId, now: DateTime<Utc>) -> RecoveryContext {
        RecoveryContext {
            user_id,
            provider: "epfo".to_string(),
            attempt: 1,
            has_fallback: false,
            now,
        }
    }

    #[test]
    fn captcha_requires_a_human() {
        let policy = PortalRecoveryPolicy::default();
        let err = SyncError::new(SyncErrorKind::AuthenticationFailed, "Please solve the CAPTCHA");
        let action = policy.recommend(&err, &ctx(UserId::new(), Utc::now()));
        assert!(action.is(RecoveryActionKind::ManualIntervention));
        assert_eq!(policy.credential_failures(UserId::new()), 0);
    }

    #[test]
    fn maintenance_delays_for_hours() {
        let policy = PortalRecoveryPolicy::default();
        let err = SyncError::new(SyncErrorKind::ServiceUnavailable, "Site under maintenance");
        let action = policy.recommend(&err, &ctx(UserId::new(), Utc::now()));
        assert!(action.is(RecoveryActionKind::Delay));
        assert!(action.delay() >= Duration::from_secs(3 * 60 * 60));
    }

    #[test]
    fn session_expiry_retries_once_with_fresh_login() {
        let policy = PortalRecoveryPolicy::default();
        let err = SyncError::new(SyncErrorKind::UnknownError, "Your session has expired");
        let action = policy.recommend(&err, &ctx(UserId::new(), Utc::now()));
        assert!(action.is(RecoveryActionKind::Retry));
        assert!(action.reauthenticate);
        assert_eq!(action.max_retries, 1);
        assert_eq!(action.delay_ms, 0);
    }

    #[test]
    fn outage_escalates_to_disable_after_threshold() {
        let policy = PortalRecoveryPolicy::default();
        let user = UserId::new();
        let t0 = Utc::now();
        let err = SyncError::new(SyncErrorKind::ServiceUnavailable, "502 bad gateway");

        let first = policy.recommend(&err, &ctx(user, t0));
        assert!(first.is(RecoveryActionKind::Delay));

        let later = policy.recommend(&err, &ctx(user, t0 + chrono::Duration::minutes(10)));
        assert!(later.is(RecoveryActionKind::Delay));

        let escalated = policy.recommend(&err, &ctx(user, t0 + chrono::Duration::minutes(31)));
        assert!(escalated.is(RecoveryActionKind::DisableSync));
        assert!(escalated.delay() >= Duration::from_secs(60 * 60));

        policy.record_success(&ctx(user, t0 + chrono::Duration::minutes(40)));
        assert!(policy.outage_duration(t0).is_none());
    }

    #[test]
    fn credential_failures_escalate_to_security_lock() {
        let policy = PortalRecoveryPolicy::default();
        let alice = UserId::new();
        let bob = UserId::new();
        let err = SyncError::new(SyncErrorKind::AuthenticationFailed, "invalid password");
        let now = Utc::now();

        assert!(policy
            .recommend(&err, &ctx(alice, now))
            .is(RecoveryActionKind::ManualIntervention));
        assert!(policy
            .recommend(&err, &ctx(alice, now))
            .is(RecoveryActionKind::ManualIntervention));
        let locked = policy.recommend(&err, &ctx(alice, now));
        assert!(locked.is(RecoveryActionKind::DisableSync));
        assert!(locked.reason.contains("security lock"));

        assert_eq!(policy.credential_failures(bob), 0);
        policy.record_success(&ctx(alice, now));
        assert_eq!(policy.credential_failures(alice), 0);
    }

    #[test]
    fn other_kinds_use_general_table() {
        let policy = PortalRecoveryPolicy::default();
        let err = SyncError::new(SyncErrorKind::DataValidationFailed, "bad balance");
        assert!(policy
            .recommend(&err, &ctx(UserId::new(), Utc::now()))
            .is(RecoveryActionKind::SkipRecord));
    }
}
