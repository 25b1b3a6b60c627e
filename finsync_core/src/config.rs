use crate::vault::cipher::{MasterKey, MIN_KDF_ITERATIONS};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment. Only non-production environments may run with a
/// generated master key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::Configuration(format!(
                "unknown FINSYNC_ENV value {other:?}"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct VaultConfig {
    /// Version stamped on newly encrypted blobs.
    pub current_key_version: u32,
    /// Master keys by version. Must contain `current_key_version`.
    pub keys: BTreeMap<u32, MasterKey>,
    pub kdf_iterations: u32,
    /// Credentials older than this are due for re-encryption.
    pub rotation_interval: chrono::Duration,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("current_key_version", &self.current_key_version)
            .field("key_versions", &self.keys.keys().collect::<Vec<_>>())
            .field("kdf_iterations", &self.kdf_iterations)
            .field("rotation_interval", &self.rotation_interval)
            .finish()
    }
}

/// Ephemeral: a freshly generated version-1 key. Blobs written under it are
/// unreadable after restart.
impl Default for VaultConfig {
    fn default() -> Self {
        Self::with_key(MasterKey::generate(), 1)
    }
}

impl VaultConfig {
    /// Single-key config, mostly for tests and local tooling.
    pub fn with_key(key: MasterKey, version: u32) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            current_key_version: version,
            keys,
            kdf_iterations: MIN_KDF_ITERATIONS,
            rotation_interval: chrono::Duration::days(90),
        }
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    /// Register a retired key that is still needed to decrypt older blobs.
    pub fn with_retired_key(mut self, version: u32, key: MasterKey) -> Self {
        self.keys.insert(version, key);
        self
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self, env: Environment) -> Result<()> {
        if self.current_key_version == 0 {
            return Err(Error::Configuration(
                "key version must be >= 1".to_string(),
            ));
        }
        if !self.keys.contains_key(&self.current_key_version) {
            return Err(Error::Configuration(format!(
                "no master key registered for current key version {}",
                self.current_key_version
            )));
        }
        if self.kdf_iterations == 0 {
            return Err(Error::Configuration(
                "kdf_iterations must be > 0".to_string(),
            ));
        }
        if env.is_production() && self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(Error::Configuration(format!(
                "kdf_iterations must be >= {MIN_KDF_ITERATIONS} in production"
            )));
        }
        if self.rotation_interval <= chrono::Duration::zero() {
            return Err(Error::Configuration(
                "rotation_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Failed-attempt lockout for stored credentials.
#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    /// Trailing window in which failures are counted.
    pub window: chrono::Duration,
    pub lock_duration: chrono::Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: chrono::Duration::minutes(15),
            lock_duration: chrono::Duration::minutes(15),
        }
    }
}

impl LockoutConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "lockout max_attempts must be > 0".to_string(),
            ));
        }
        if self.window <= chrono::Duration::zero() {
            return Err(Error::Configuration(
                "lockout window must be > 0".to_string(),
            ));
        }
        if self.lock_duration <= chrono::Duration::zero() {
            return Err(Error::Configuration(
                "lockout lock_duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded retry/backoff for provider fetches.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Delays recommended by a recovery policy are waited out inline only up
    /// to this bound; longer ones end the run.
    pub max_inline_delay_ms: u64,
    /// Rate-limit waits do not consume attempts but are capped separately.
    pub max_rate_limit_waits: u32,
    /// `in_progress` markers older than this may be reclaimed.
    pub stale_in_progress_after: chrono::Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_inline_delay_ms: 60_000,
            max_rate_limit_waits: 3,
            stale_in_progress_after: chrono::Duration::minutes(30),
        }
    }
}

impl RetryConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry max_attempts must be > 0".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::Configuration(
                "retry backoff_base_ms must be > 0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::Configuration(
                "retry backoff_max_ms must be >= backoff_base_ms".to_string(),
            ));
        }
        if self.stale_in_progress_after <= chrono::Duration::zero() {
            return Err(Error::Configuration(
                "stale_in_progress_after must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let exp = 1u128 << shift;
        let ms = (self.backoff_base_ms as u128).saturating_mul(exp);
        Duration::from_millis(ms.min(self.backoff_max_ms as u128) as u64)
    }

    pub fn max_inline_delay(&self) -> Duration {
        Duration::from_millis(self.max_inline_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: true,
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct FinsyncConfig {
    pub environment: Environment,
    pub vault: VaultConfig,
    pub lockout: LockoutConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
    pub database_path: PathBuf,
}

impl FinsyncConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let environment = match lookup("FINSYNC_ENV") {
            Some(v) => v.parse::<Environment>()?,
            None => Environment::Development,
        };

        let current_key_version = parse_or(&lookup, "FINSYNC_KEY_VERSION", 1u32)?;
        let mut keys = BTreeMap::new();
        match lookup("FINSYNC_MASTER_KEY") {
            Some(hex) => {
                keys.insert(current_key_version, MasterKey::from_hex(&hex)?);
            }
            None if environment.is_production() => {
                return Err(Error::Configuration(
                    "FINSYNC_MASTER_KEY is required in production".to_string(),
                ));
            }
            None => {
                tracing::warn!(
                    ?environment,
                    "FINSYNC_MASTER_KEY not set; generated an ephemeral master key"
                );
                keys.insert(current_key_version, MasterKey::generate());
            }
        }
        for version in 1..current_key_version {
            if let Some(hex) = lookup(&format!("FINSYNC_MASTER_KEY_V{version}")) {
                keys.insert(version, MasterKey::from_hex(&hex)?);
            }
        }

        let vault = VaultConfig {
            current_key_version,
            keys,
            kdf_iterations: parse_or(&lookup, "FINSYNC_KDF_ITERATIONS", MIN_KDF_ITERATIONS)?,
            rotation_interval: duration_or(
                &lookup,
                "FINSYNC_ROTATION_DAYS",
                90,
                chrono::Duration::try_days,
            )?,
        };

        let lockout = LockoutConfig {
            max_attempts: parse_or(&lookup, "FINSYNC_LOCKOUT_MAX_ATTEMPTS", 5u32)?,
            window: duration_or(
                &lookup,
                "FINSYNC_LOCKOUT_WINDOW_SECS",
                900,
                chrono::Duration::try_seconds,
            )?,
            lock_duration: duration_or(
                &lookup,
                "FINSYNC_LOCKOUT_DURATION_SECS",
                900,
                chrono::Duration::try_seconds,
            )?,
        };

        let retry = RetryConfig {
            max_attempts: parse_or(&lookup, "FINSYNC_RETRY_MAX_ATTEMPTS", 3u32)?,
            backoff_base_ms: parse_or(&lookup, "FINSYNC_RETRY_BASE_MS", 1_000u64)?,
            backoff_max_ms: parse_or(&lookup, "FINSYNC_RETRY_MAX_MS", 30_000u64)?,
            max_inline_delay_ms: parse_or(&lookup, "FINSYNC_MAX_INLINE_DELAY_MS", 60_000u64)?,
            max_rate_limit_waits: parse_or(&lookup, "FINSYNC_MAX_RATE_LIMIT_WAITS", 3u32)?,
            stale_in_progress_after: duration_or(
                &lookup,
                "FINSYNC_STALE_IN_PROGRESS_SECS",
                1_800,
                chrono::Duration::try_seconds,
            )?,
        };

        let database_path = lookup("FINSYNC_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/finsync.db"));

        let cfg = Self {
            environment,
            vault,
            lockout,
            retry,
            log: LogConfig::default(),
            database_path,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        self.vault.validate(self.environment)?;
        self.lockout.validate()?;
        self.retry.validate()?;
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Configuration("database_path is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Configuration(format!("{name} has invalid value {raw:?}"))),
    }
}

/// Positive duration from an integer variable. Values chrono cannot
/// represent are configuration errors, not panics.
fn duration_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: i64,
    to_duration: fn(i64) -> Option<chrono::Duration>,
) -> Result<chrono::Duration> {
    let value = parse_or(lookup, name, default)?;
    if value <= 0 {
        return Err(Error::Configuration(format!("{name} must be > 0, got {value}")));
    }
    to_duration(value)
        .ok_or_else(|| Error::Configuration(format!("{name} is out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn production_requires_master_key() {
        let err = FinsyncConfig::from_lookup(lookup(&[("FINSYNC_ENV", "production")])).unwrap_err();
        assert!(err.to_string().contains("FINSYNC_MASTER_KEY"));
    }

    #[test]
    fn development_generates_key_when_missing() {
        let cfg = FinsyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.vault.current_key_version, 1);
        assert!(cfg.vault.keys.contains_key(&1));
    }

    #[test]
    fn reads_retired_keys_and_overrides() {
        let cfg = FinsyncConfig::from_lookup(lookup(&[
            ("FINSYNC_ENV", "production"),
            ("FINSYNC_MASTER_KEY", KEY_HEX),
            ("FINSYNC_KEY_VERSION", "3"),
            ("FINSYNC_MASTER_KEY_V1", KEY_HEX),
            ("FINSYNC_RETRY_MAX_ATTEMPTS", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.vault.current_key_version, 3);
        assert_eq!(
            cfg.vault.keys.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn production_rejects_weak_kdf() {
        let err = FinsyncConfig::from_lookup(lookup(&[
            ("FINSYNC_ENV", "production"),
            ("FINSYNC_MASTER_KEY", KEY_HEX),
            ("FINSYNC_KDF_ITERATIONS", "1000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("kdf_iterations"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = FinsyncConfig::from_lookup(lookup(&[("FINSYNC_RETRY_BASE_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("FINSYNC_RETRY_BASE_MS"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RetryConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(350));
        assert_eq!(cfg.backoff(64), Duration::from_millis(350));
    }

    #[test]
    fn sub_config_defaults_validate() {
        VaultConfig::default()
            .validate(Environment::Production)
            .unwrap();
        LockoutConfig::default().validate().unwrap();
        RetryConfig::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_durations_are_errors() {
        for (name, value) in [
            ("FINSYNC_ROTATION_DAYS", "9223372036854775807"),
            ("FINSYNC_LOCKOUT_WINDOW_SECS", "9223372036854775807"),
            ("FINSYNC_LOCKOUT_DURATION_SECS", "-5"),
            ("FINSYNC_STALE_IN_PROGRESS_SECS", "0"),
        ] {
            let err = FinsyncConfig::from_lookup(lookup(&[(name, value)])).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{name}: {err}");
            assert!(err.to_string().contains(name), "{err}");
        }
    }
}
