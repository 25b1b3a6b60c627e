//! Raw provider failures and their mapping onto the sync error taxonomy.
//!
//! Precedence: low-level connection codes, then transport status codes,
//! then message text. Message heuristics are a last resort because
//! provider error text is not a stable contract.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    NetworkError,
    NetworkTimeout,
    AuthenticationFailed,
    AuthorizationFailed,
    RateLimitExceeded,
    ServiceUnavailable,
    DataValidationFailed,
    DataParsingFailed,
    CredentialError,
    ConfigurationError,
    UnknownError,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::NetworkError => "network_error",
            SyncErrorKind::NetworkTimeout => "network_timeout",
            SyncErrorKind::AuthenticationFailed => "authentication_failed",
            SyncErrorKind::AuthorizationFailed => "authorization_failed",
            SyncErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            SyncErrorKind::ServiceUnavailable => "service_unavailable",
            SyncErrorKind::DataValidationFailed => "data_validation_failed",
            SyncErrorKind::DataParsingFailed => "data_parsing_failed",
            SyncErrorKind::CredentialError => "credential_error",
            SyncErrorKind::ConfigurationError => "configuration_error",
            SyncErrorKind::UnknownError => "unknown_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::NetworkError
                | SyncErrorKind::NetworkTimeout
                | SyncErrorKind::RateLimitExceeded
                | SyncErrorKind::ServiceUnavailable
        )
    }

    pub fn is_credential_related(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::AuthenticationFailed | SyncErrorKind::CredentialError
        )
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a `DataProvider`, before classification.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderFailure {
    /// Low-level connection error code (`ECONNRESET`, `ETIMEDOUT`, ...).
    pub code: Option<String>,
    /// Transport status code, if the request got that far.
    pub status: Option<u16>,
    pub message: String,
    /// Provider-specified wait (e.g. from `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::message(message)
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::message(message)
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl From<std::io::Error> for ProviderFailure {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match e.kind() {
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            ErrorKind::NotConnected => Some("ENOTCONN"),
            ErrorKind::BrokenPipe => Some("EPIPE"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            _ => None,
        };
        Self {
            code: code.map(str::to_string),
            ..Self::message(e.to_string())
        }
    }
}

impl From<reqwest::Error> for ProviderFailure {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            Some("ETIMEDOUT")
        } else if e.is_connect() {
            Some("ECONNREFUSED")
        } else {
            None
        };
        let kind = if e.is_decode() {
            "response could not be parsed: "
        } else {
            ""
        };
        Self {
            code: code.map(str::to_string),
            status: e.status().map(|s| s.as_u16()),
            message: format!("{kind}{e}"),
            retry_after: None,
        }
    }
}

/// A classified sync failure, collected per record or per run.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
    /// Record the error applies to; `None` for run-level failures.
    pub record_key: Option<String>,
    pub provider: Option<String>,
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            record_key: None,
            provider: None,
            retry_after_ms: None,
        }
    }

    pub fn for_record(mut self, key: impl Into<String>) -> Self {
        self.record_key = Some(key.into());
        self
    }

    pub fn from_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn from_failure(failure: &ProviderFailure) -> Self {
        Self {
            kind: classify(failure),
            message: failure.message.clone(),
            record_key: None,
            provider: None,
            retry_after_ms: failure.retry_after.map(|d| d.as_millis() as u64),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl From<ProviderFailure> for SyncError {
    fn from(failure: ProviderFailure) -> Self {
        SyncError::from_failure(&failure)
    }
}

/// Map a raw failure onto the taxonomy.
pub fn classify(failure: &ProviderFailure) -> SyncErrorKind {
    if let Some(kind) = failure.code.as_deref().and_then(classify_code) {
        return kind;
    }
    if let Some(kind) = failure.status.and_then(classify_status) {
        return kind;
    }
    classify_message(&failure.message)
}

fn classify_code(code: &str) -> Option<SyncErrorKind> {
    match code.to_ascii_uppercase().as_str() {
        "ETIMEDOUT" | "ESOCKETTIMEDOUT" | "ECONNABORTED" => Some(SyncErrorKind::NetworkTimeout),
        "ECONNREFUSED" | "ECONNRESET" | "ENOTFOUND" | "EAI_AGAIN" | "EPIPE" | "EHOSTUNREACH"
        | "ENETUNREACH" | "ENOTCONN" => Some(SyncErrorKind::NetworkError),
        _ => None,
    }
}

fn classify_status(status: u16) -> Option<SyncErrorKind> {
    match status {
        400 | 422 => Some(SyncErrorKind::DataValidationFailed),
        401 => Some(SyncErrorKind::AuthenticationFailed),
        403 => Some(SyncErrorKind::AuthorizationFailed),
        408 | 504 => Some(SyncErrorKind::NetworkTimeout),
        429 => Some(SyncErrorKind::RateLimitExceeded),
        500..=599 => Some(SyncErrorKind::ServiceUnavailable),
        _ => None,
    }
}

fn classify_message(message: &str) -> SyncErrorKind {
    let m = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["timeout", "timed out"]) {
        SyncErrorKind::NetworkTimeout
    } else if has(&["rate limit", "too many requests", "throttl"]) {
        SyncErrorKind::RateLimitExceeded
    } else if has(&["unauthorized", "invalid credentials", "login failed", "authentication", "invalid password"]) {
        SyncErrorKind::AuthenticationFailed
    } else if has(&["forbidden", "access denied", "permission"]) {
        SyncErrorKind::AuthorizationFailed
    } else if has(&["service unavailable", "maintenance", "bad gateway", "temporarily unavailable"]) {
        SyncErrorKind::ServiceUnavailable
    } else if has(&["network", "connection", "socket", "dns"]) {
        SyncErrorKind::NetworkError
    } else if has(&["parse", "unexpected token", "malformed", "invalid json"]) {
        SyncErrorKind::DataParsingFailed
    } else if has(&["validation", "invalid data", "out of range"]) {
        SyncErrorKind::DataValidationFailed
    } else if has(&["credential", "decrypt"]) {
        SyncErrorKind::CredentialError
    } else if has(&["config"]) {
        SyncErrorKind::ConfigurationError
    } else {
        SyncErrorKind::UnknownError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_codes_take_precedence() {
        let f = ProviderFailure {
            code: Some("ECONNRESET".to_string()),
            status: Some(401),
            message: "unauthorized".to_string(),
            retry_after: None,
        };
        assert_eq!(classify(&f), SyncErrorKind::NetworkError);
        assert_eq!(
            classify(&ProviderFailure::connection("etimedout", "x")),
            SyncErrorKind::NetworkTimeout
        );
    }

    #[test]
    fn status_codes_beat_message_text() {
        let f = ProviderFailure::http(429, "login failed");
        assert_eq!(classify(&f), SyncErrorKind::RateLimitExceeded);
        assert_eq!(
            classify(&ProviderFailure::http(401, "")),
            SyncErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify(&ProviderFailure::http(403, "")),
            SyncErrorKind::AuthorizationFailed
        );
        assert_eq!(
            classify(&ProviderFailure::http(503, "")),
            SyncErrorKind::ServiceUnavailable
        );
        assert_eq!(
            classify(&ProviderFailure::http(504, "")),
            SyncErrorKind::NetworkTimeout
        );
    }

    #[test]
    fn unknown_status_falls_through_to_message() {
        let f = ProviderFailure::http(302, "Request timed out upstream");
        assert_eq!(classify(&f), SyncErrorKind::NetworkTimeout);
    }

    #[test]
    fn message_heuristics() {
        let cases = [
            ("Too Many Requests", SyncErrorKind::RateLimitExceeded),
            ("Invalid credentials supplied", SyncErrorKind::AuthenticationFailed),
            ("Access denied for account", SyncErrorKind::AuthorizationFailed),
            ("Portal under maintenance", SyncErrorKind::ServiceUnavailable),
            ("connection closed by peer", SyncErrorKind::NetworkError),
            ("Unexpected token < in JSON", SyncErrorKind::DataParsingFailed),
            ("validation failed for nav", SyncErrorKind::DataValidationFailed),
            ("could not decrypt stored secret", SyncErrorKind::CredentialError),
            ("missing config value", SyncErrorKind::ConfigurationError),
            ("something odd happened", SyncErrorKind::UnknownError),
        ];
        for (msg, kind) in cases {
            assert_eq!(classify(&ProviderFailure::message(msg)), kind, "{msg}");
        }
    }

    #[test]
    fn io_errors_map_to_connection_codes() {
        let f: ProviderFailure =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline").into();
        assert_eq!(f.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(classify(&f), SyncErrorKind::NetworkTimeout);
    }

    #[test]
    fn sync_error_carries_retry_after() {
        let f = ProviderFailure::http(429, "slow down").with_retry_after(Duration::from_secs(7));
        let e = SyncError::from(f);
        assert_eq!(e.kind, SyncErrorKind::RateLimitExceeded);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(e.to_string(), "rate_limit_exceeded: slow down");
    }
}
