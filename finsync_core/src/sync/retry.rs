//! Bounded retry around a provider call.
//!
//! Every failure is classified and handed to the recovery policy. `retry`
//! backs off exponentially up to the attempt limit; short `delay`s are
//! waited out without spending an attempt; anything else stops at once.

use crate::config::RetryConfig;
use crate::models::UserId;
use crate::recovery::classify::{ProviderFailure, SyncError};
use crate::recovery::policy::{RecoveryAction, RecoveryActionKind, RecoveryContext, RecoveryPolicy};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;

/// Passed to each invocation of the wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based, counts only attempts that spend retry budget.
    pub number: u32,
    pub reauthenticate: bool,
}

#[derive(Debug, Clone)]
pub struct RetryScope {
    pub user_id: UserId,
    pub provider: String,
    pub has_fallback: bool,
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, SyncError>,
    /// Total invocations, including those after rate-limit waits.
    pub calls: u32,
    pub delays: Vec<Duration>,
    /// Action that ended the loop on failure.
    pub last_action: Option<RecoveryAction>,
}

impl<T> RetryOutcome<T> {
    fn finish(
        result: std::result::Result<T, SyncError>,
        calls: u32,
        delays: Vec<Duration>,
        last_action: Option<RecoveryAction>,
    ) -> Self {
        Self {
            result,
            calls,
            delays,
            last_action,
        }
    }
}

#[tracing::instrument(level = "debug", skip(cfg, policy, op), fields(provider = %scope.provider))]
pub async fn with_retry<T, F, Fut>(
    cfg: &RetryConfig,
    policy: &dyn RecoveryPolicy,
    scope: &RetryScope,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderFailure>>,
{
    let mut attempt = Attempt {
        number: 1,
        reauthenticate: false,
    };
    let mut calls = 0u32;
    let mut waits = 0u32;
    let mut delays = Vec::new();

    loop {
        calls += 1;
        let failure = match op(attempt).await {
            Ok(value) => {
                policy.record_success(&RecoveryContext {
                    user_id: scope.user_id,
                    provider: scope.provider.clone(),
                    attempt: attempt.number,
                    has_fallback: scope.has_fallback,
                    now: Utc::now(),
                });
                return RetryOutcome::finish(Ok(value), calls, delays, None);
            }
            Err(failure) => failure,
        };

        let error = SyncError::from_failure(&failure).from_provider(scope.provider.clone());
        let ctx = RecoveryContext {
            user_id: scope.user_id,
            provider: scope.provider.clone(),
            attempt: attempt.number,
            has_fallback: scope.has_fallback,
            now: Utc::now(),
        };
        let action = policy.recommend(&error, &ctx);
        tracing::debug!(
            attempt = attempt.number,
            kind = %error.kind,
            action = %action.kind,
            delay_ms = action.delay_ms,
            "provider call failed"
        );

        let delay = match action.kind {
            RecoveryActionKind::Retry => {
                let allowed = cfg.max_attempts.min(action.max_retries.saturating_add(1));
                if attempt.number >= allowed {
                    tracing::warn!(attempts = attempt.number, kind = %error.kind, "retries exhausted");
                    return RetryOutcome::finish(Err(error), calls, delays, Some(action));
                }
                let delay = if action.reauthenticate {
                    action.delay()
                } else {
                    cfg.backoff(attempt.number)
                };
                attempt = Attempt {
                    number: attempt.number + 1,
                    reauthenticate: action.reauthenticate,
                };
                delay
            }
            RecoveryActionKind::Delay
                if action.delay() <= cfg.max_inline_delay() && waits < cfg.max_rate_limit_waits =>
            {
                waits += 1;
                action.delay()
            }
            _ => return RetryOutcome::finish(Err(error), calls, delays, Some(action)),
        };

        delays.push(delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
