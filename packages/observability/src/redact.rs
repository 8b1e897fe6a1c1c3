//! Credential scrubbing for structured log fields.

use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

const DENYLIST_KEYS: [&str; 10] = [
    "token",
    "authorization",
    "password",
    "secret",
    "cookie",
    "mfa_token",
    "oob_code",
    "access_token",
    "refresh_token",
    "credential",
];

/// Whether a field name denotes a secret. Matching is case-insensitive and
/// by substring, so `accessToken` and `x_refresh_token` both match.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    DENYLIST_KEYS.iter().any(|entry| lower.contains(entry))
}

/// Scrub one field value, recursing into objects and arrays.
pub fn redact_value(key: &str, value: &Value) -> Value {
    if is_sensitive_key(key) {
        return Value::String(REDACTED.to_string());
    }

    match value {
        Value::String(s) if looks_like_sensitive_value(s) => Value::String(REDACTED.to_string()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), redact_value(k, v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(key, v)).collect()),
        other => other.clone(),
    }
}

fn looks_like_sensitive_value(raw: &str) -> bool {
    let trimmed = raw.trim_matches('"');
    if trimmed.to_ascii_lowercase().starts_with("bearer ") {
        return true;
    }
    // JWT shape: three dot-separated segments.
    trimmed.matches('.').count() == 2 && trimmed.len() > 40 && !trimmed.contains(' ')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys_are_case_insensitive() {
        assert!(is_sensitive_key("access_token"));
        assert!(is_sensitive_key("accessToken"));
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("oob_code"));
        assert!(!is_sensitive_key("system_id"));
        assert!(!is_sensitive_key("event_type"));
    }

    #[test]
    fn test_redacts_nested_objects() {
        let value = json!({
            "user": "a@b.com",
            "grant": { "refresh_token": "abc", "scope": "offline_access" }
        });
        let out = redact_value("body", &value);
        assert_eq!(out["user"], "a@b.com");
        assert_eq!(out["grant"]["refresh_token"], REDACTED);
        assert_eq!(out["grant"]["scope"], "offline_access");
    }

    #[test]
    fn test_redacts_bearer_and_jwt_values() {
        let bearer = Value::String("Bearer abc.def".into());
        assert_eq!(redact_value("header", &bearer), json!(REDACTED));

        let jwt = Value::String(format!("{}.{}.{}", "a".repeat(20), "b".repeat(20), "c"));
        assert_eq!(redact_value("value", &jwt), json!(REDACTED));

        let plain = Value::String("sensor.opened".into());
        assert_eq!(redact_value("event", &plain), plain);
    }
}
