//! Sliding-window failure counting for credential use.
//!
//! Counters live in memory; the resulting lock is persisted by the vault so
//! it survives restarts. All mutation happens inside a single map entry
//! guard, which is never held across an await point.

use crate::config::LockoutConfig;
use crate::models::UserId;
use crate::store::models::AccountLock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Failure recorded; `remaining` more are allowed inside the window.
    Counted { failures: u32, remaining: u32 },
    /// This failure hit the limit. The window has been reset.
    Locked(AccountLock),
}

type LockoutKey = (UserId, String);

pub struct LockoutTracker {
    cfg: LockoutConfig,
    failures: DashMap<LockoutKey, VecDeque<DateTime<Utc>>>,
}

impl LockoutTracker {
    pub fn new(cfg: LockoutConfig) -> Self {
        Self {
            cfg,
            failures: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.cfg
    }

    pub fn record_failure(&self, user_id: UserId, service: &str) -> AttemptOutcome {
        self.record_failure_at(user_id, service, Utc::now())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn record_failure_at(
        &self,
        user_id: UserId,
        service: &str,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let window_start = now - self.cfg.window;
        let mut entry = self
            .failures
            .entry((user_id, service.to_string()))
            .or_default();
        let window = entry.value_mut();
        while window.front().is_some_and(|t| *t <= window_start) {
            window.pop_front();
        }
        window.push_back(now);

        let failures = window.len() as u32;
        if failures >= self.cfg.max_attempts {
            window.clear();
            return AttemptOutcome::Locked(AccountLock {
                user_id,
                service: service.to_string(),
                locked_at: now,
                lock_until: now + self.cfg.lock_duration,
                reason: format!(
                    "{failures} failed attempts within {} minutes",
                    self.cfg.window.num_minutes()
                ),
            });
        }
        AttemptOutcome::Counted {
            failures,
            remaining: self.cfg.max_attempts - failures,
        }
    }

    /// Failures currently inside the window.
    pub fn failures_at(&self, user_id: UserId, service: &str, now: DateTime<Utc>) -> u32 {
        let window_start = now - self.cfg.window;
        self.failures
            .get(&(user_id, service.to_string()))
            .map(|w| w.iter().filter(|t| **t > window_start).count() as u32)
            .unwrap_or(0)
    }

    pub fn clear(&self, user_id: UserId, service: &str) {
        self.failures.remove(&(user_id, service.to_string()));
    }
}
