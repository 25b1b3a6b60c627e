use regex::Regex;
use std::sync::OnceLock;

pub const REDACTED: &str = "[REDACTED]";

/// Replace sensitive values in a JSON document, in place.
///
/// Keys that name secrets are replaced wholesale; other strings are kept
/// unless they look like a bearer token or API key.
pub fn redact_value(v: &mut serde_json::Value) {
    match v {
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {}
        serde_json::Value::String(s) => {
            if looks_like_secret(s) {
                *s = REDACTED.to_string();
            }
        }
        serde_json::Value::Array(a) => {
            for e in a {
                redact_value(e);
            }
        }
        serde_json::Value::Object(o) => {
            for (k, v) in o.iter_mut() {
                if is_sensitive_key(k) {
                    *v = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_value(v);
                }
            }
        }
    }
}

pub fn redacted(v: &serde_json::Value) -> serde_json::Value {
    let mut out = v.clone();
    redact_value(&mut out);
    out
}

pub fn is_sensitive_key(k: &str) -> bool {
    let k = k.to_ascii_lowercase();
    k.contains("authorization")
        || k.contains("password")
        || k.contains("passwd")
        || k.contains("secret")
        || k.contains("token")
        || k.contains("api_key")
        || k.contains("apikey")
        || k.contains("cookie")
        || k.contains("private_key")
        || k
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|seg| SHORT_SECRET_SEGMENTS.contains(&seg))
}

/// Short secret names matched only as whole key segments, so `otp_code`
/// and `login_pin` match but `shipping` and `footprint` do not.
const SHORT_SECRET_SEGMENTS: &[&str] = &["otp", "pin", "mpin", "tpin"];

fn looks_like_secret(s: &str) -> bool {
    let s = s.trim();
    if s.len() < 12 {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    lower.starts_with("bearer ") || lower.starts_with("basic ") || lower.starts_with("sk-")
}

/// Show only the last four characters of an account identifier.
pub fn mask_identifier(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

fn inline_secret_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // key=value or key: value pairs echoed back in provider error text.
        Regex::new(r"(?i)\b(password|passwd|secret|token|api_?key|otp)\b(\s*[=:]\s*)[^\s&,;]+").ok()
    })
    .as_ref()
}

/// Scrub `key=value` secrets out of free-form text before it is logged or
/// persisted as `last_error`.
pub fn redact_message(msg: &str) -> String {
    match inline_secret_pattern() {
        Some(re) => re
            .replace_all(msg, format!("$1$2{REDACTED}").as_str())
            .into_owned(),
        None => msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_are_replaced() {
        let v = redacted(&json!({
            "identifier": "100200300400",
            "secret": "hunter2",
            "nested": {"api_key": "abc", "note": "fine"},
            "auth": "Bearer abcdefghijklmnop"
        }));
        assert_eq!(v["secret"], REDACTED);
        assert_eq!(v["nested"]["api_key"], REDACTED);
        assert_eq!(v["nested"]["note"], "fine");
        assert_eq!(v["auth"], REDACTED);
        assert_eq!(v["identifier"], "100200300400");
    }

    #[test]
    fn identifiers_keep_last_four() {
        assert_eq!(mask_identifier("100200300400"), "********0400");
        assert_eq!(mask_identifier("abc"), "***");
    }

    #[test]
    fn inline_secrets_are_scrubbed_from_messages() {
        let msg = redact_message("login failed for user=42 password=hunter2&x=1");
        assert!(!msg.contains("hunter2"), "{msg}");
        assert!(msg.contains("password=[REDACTED]"), "{msg}");
        assert!(msg.contains("user=42"), "{msg}");
    }

    #[test]
    fn short_secret_names_match_whole_segments_only() {
        assert!(is_sensitive_key("otp"));
        assert!(is_sensitive_key("login_pin"));
        assert!(is_sensitive_key("OTP-Code"));
        assert!(is_sensitive_key("mpin"));
        assert!(!is_sensitive_key("shipping"));
        assert!(!is_sensitive_key("opinion"));
        assert!(!is_sensitive_key("footprint"));

        let v = redacted(&json!({"shipping": "express", "login_pin": "1234"}));
        assert_eq!(v["shipping"], "express");
        assert_eq!(v["login_pin"], REDACTED);
    }
}
